use std::fmt;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::clock;
use crate::config::{EchoPayload, Scenario};
use crate::error::DecodeError;
use crate::metrics::{MetricSink, Record};
use crate::probe::{self, CorrelationAnomaly, PING_PAYLOAD, Probe};
use crate::shutdown::ShutdownListener;
use crate::transport::{Connection, EventReceiver, TransportEvent};

/// Ordinal assigned at creation, unique within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends a probe, waits for its echo, records the RTT, repeats.
    EchoProbe,
    /// Sends a probe every interval without waiting for anything.
    Broadcaster,
    /// Records the latency of every probe relayed to it.
    Listener,
}

impl Role {
    pub fn assign(scenario: Scenario, broadcaster: ClientId, id: ClientId) -> Role {
        match scenario {
            Scenario::Echo => Role::EchoProbe,
            Scenario::Broadcast if id == broadcaster => Role::Broadcaster,
            Scenario::Broadcast => Role::Listener,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub probe_interval: Duration,
    pub echo_payload: EchoPayload,
    pub latency_ceiling: Duration,
    pub close_grace: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClientReport {
    pub probes_sent: u64,
    pub samples: u64,
    pub anomalies: u64,
    pub decode_errors: u64,
    pub lost_connection: bool,
}

pub struct SimulatedClient {
    id: ClientId,
    role: Role,
    connection: Connection,
    events: EventReceiver,
    sink: MetricSink,
    settings: ClientSettings,
    report: ClientReport,
}

/// How a message on the echo path relates to the outstanding probe.
enum Reply {
    Matched,
    Foreign,
}

impl SimulatedClient {
    pub fn new(
        role: Role,
        connection: Connection,
        events: EventReceiver,
        sink: MetricSink,
        settings: ClientSettings,
    ) -> Self {
        Self {
            id: connection.id(),
            role,
            connection,
            events,
            sink,
            settings,
            report: ClientReport::default(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Drives the role until shutdown or connection loss, then closes.
    pub async fn run(mut self, mut shutdown: ShutdownListener) -> ClientReport {
        debug!("Client {} running as {:?}", self.id, self.role);

        match self.role {
            Role::EchoProbe => self.run_echo(&mut shutdown).await,
            Role::Broadcaster => self.run_broadcaster(&mut shutdown).await,
            Role::Listener => self.run_listener(&mut shutdown).await,
        }

        let SimulatedClient {
            connection,
            settings,
            report,
            ..
        } = self;
        connection.finish(settings.close_grace).await;
        report
    }

    async fn run_echo(&mut self, shutdown: &mut ShutdownListener) {
        let mut next_send = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => return,
                _ = time::sleep_until(next_send) => {}
            }

            let sent_at = clock::now_nanos();
            let payload = match self.settings.echo_payload {
                EchoPayload::Probe => Probe::new(self.id, sent_at).encode(),
                EchoPayload::Literal => PING_PAYLOAD.to_string(),
            };
            next_send = Instant::now() + self.settings.probe_interval;

            if let Err(e) = self.connection.send(&payload) {
                debug!("Client {} stopped sending: {}", self.id, e);
                return;
            }
            self.report.probes_sent += 1;

            // the next probe waits until this one is answered
            loop {
                let event = tokio::select! {
                    biased;
                    _ = shutdown.wait() => return,
                    event = self.events.recv() => event,
                };
                match event {
                    Some(TransportEvent::Message {
                        payload,
                        received_at,
                    }) => {
                        if let Some(Reply::Matched) = self.on_echo(&payload, sent_at, received_at) {
                            break;
                        }
                    }
                    Some(TransportEvent::Undecodable(e)) => self.decode_error(e),
                    Some(TransportEvent::Closed { reason }) => {
                        self.lost(shutdown, reason);
                        return;
                    }
                    None => {
                        self.lost(shutdown, None);
                        return;
                    }
                }
            }
        }
    }

    /// Returns None when the payload could not be decoded at all.
    fn on_echo(&mut self, payload: &str, sent_at: u64, received_at: u64) -> Option<Reply> {
        match self.settings.echo_payload {
            EchoPayload::Literal if payload != PING_PAYLOAD => {
                self.decode_error(DecodeError::UnexpectedPayload(payload.to_string()));
                return None;
            }
            EchoPayload::Literal => {}
            EchoPayload::Probe => {
                let (probe, echoed) = self.decode_probe(payload)?;
                if probe.sender() != self.id || echoed != sent_at {
                    self.anomaly(CorrelationAnomaly::Mismatch {
                        expected: format!("{}@{}", self.id, sent_at),
                        got: format!("{}@{}", probe.sender_id, probe.send_time),
                    });
                    return Some(Reply::Foreign);
                }
            }
        }

        match probe::measure(sent_at, received_at, self.settings.latency_ceiling) {
            Ok(ms) => {
                self.sink.record(Record::round_trip(self.id, ms));
                self.report.samples += 1;
            }
            Err(anomaly) => self.anomaly(anomaly),
        }
        Some(Reply::Matched)
    }

    async fn run_broadcaster(&mut self, shutdown: &mut ShutdownListener) {
        let mut ticker = time::interval(self.settings.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => return,
                event = self.events.recv() => match event {
                    Some(TransportEvent::Message { .. }) => {
                        trace!("Broadcaster {} ignoring inbound message", self.id);
                    }
                    Some(TransportEvent::Undecodable(e)) => self.decode_error(e),
                    Some(TransportEvent::Closed { reason }) => {
                        self.lost(shutdown, reason);
                        return;
                    }
                    None => {
                        self.lost(shutdown, None);
                        return;
                    }
                },
                _ = ticker.tick() => {
                    let probe = Probe::new(self.id, clock::now_nanos());
                    if let Err(e) = self.connection.send(&probe.encode()) {
                        debug!("Broadcaster {} stopped sending: {}", self.id, e);
                        return;
                    }
                    self.report.probes_sent += 1;
                }
            }
        }
    }

    async fn run_listener(&mut self, shutdown: &mut ShutdownListener) {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.wait() => return,
                event = self.events.recv() => event,
            };
            match event {
                Some(TransportEvent::Message {
                    payload,
                    received_at,
                }) => self.on_broadcast(&payload, received_at),
                Some(TransportEvent::Undecodable(e)) => self.decode_error(e),
                Some(TransportEvent::Closed { reason }) => {
                    self.lost(shutdown, reason);
                    return;
                }
                None => {
                    self.lost(shutdown, None);
                    return;
                }
            }
        }
    }

    fn on_broadcast(&mut self, payload: &str, received_at: u64) {
        let Some((probe, sent_at)) = self.decode_probe(payload) else {
            return;
        };
        match probe::measure(sent_at, received_at, self.settings.latency_ceiling) {
            Ok(ms) => {
                self.sink
                    .record(Record::broadcast_latency(probe.sender(), self.id, ms));
                self.report.samples += 1;
            }
            Err(anomaly) => self.anomaly(anomaly),
        }
    }

    fn decode_probe(&mut self, payload: &str) -> Option<(Probe, u64)> {
        let decoded = Probe::decode(payload).and_then(|probe| {
            let sent_at = probe.send_nanos()?;
            Ok((probe, sent_at))
        });
        match decoded {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                self.decode_error(e);
                None
            }
        }
    }

    fn decode_error(&mut self, error: DecodeError) {
        warn!("Client {} dropped undecodable payload: {}", self.id, error);
        self.report.decode_errors += 1;
    }

    fn anomaly(&mut self, anomaly: CorrelationAnomaly) {
        warn!("Client {} correlation anomaly: {}", self.id, anomaly);
        self.sink
            .record(Record::anomaly(self.id, anomaly.kind(), anomaly.to_string()));
        self.report.anomalies += 1;
    }

    fn lost(&mut self, shutdown: &ShutdownListener, reason: Option<String>) {
        if shutdown.is_triggered() {
            return;
        }
        warn!(
            "Client {} lost its connection: {}",
            self.id,
            reason.as_deref().unwrap_or("stream ended")
        );
        self.report.lost_connection = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricKind, SinkOutputs};
    use crate::shutdown::Shutdown;
    use crate::transport::{self, ProtocolKind, TransportConfig};
    use futures::{SinkExt, StreamExt};
    use std::future::Future;
    use std::sync::{Arc, Mutex};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::Message;

    /// Accepts a single websocket connection and hands it to `handler`.
    async fn serve_one<F, Fut>(handler: F) -> String
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            handler(ws).await;
        });
        format!("ws://{addr}")
    }

    fn settings(interval_ms: u64, payload: EchoPayload) -> ClientSettings {
        ClientSettings {
            probe_interval: Duration::from_millis(interval_ms),
            echo_payload: payload,
            latency_ceiling: Duration::from_secs(60),
            close_grace: Duration::from_millis(200),
        }
    }

    async fn start(
        url: String,
        role: Role,
        settings: ClientSettings,
        sink: MetricSink,
    ) -> SimulatedClient {
        let config = TransportConfig {
            url,
            protocol: ProtocolKind::RawSocket,
            channel: "chat message".into(),
            connect_timeout: Duration::from_secs(5),
        };
        let opened = transport::connect(ClientId(0), &config, None).await.unwrap();
        SimulatedClient::new(role, opened.connection, opened.events, sink, settings)
    }

    #[test]
    fn roles_follow_explicit_broadcaster() {
        let sender = ClientId(2);
        assert_eq!(Role::assign(Scenario::Broadcast, sender, ClientId(2)), Role::Broadcaster);
        assert_eq!(Role::assign(Scenario::Broadcast, sender, ClientId(0)), Role::Listener);
        assert_eq!(Role::assign(Scenario::Echo, sender, ClientId(2)), Role::EchoProbe);
    }

    #[tokio::test]
    async fn echo_requests_never_overlap() {
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let seen = arrivals.clone();
        let url = serve_one(move |mut ws| async move {
            while let Some(Ok(msg)) = ws.next().await {
                if !msg.is_text() {
                    continue;
                }
                seen.lock().unwrap().push(Instant::now());
                time::sleep(Duration::from_millis(60)).await;
                if ws.send(msg).await.is_err() {
                    break;
                }
            }
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let (sink, handle) = MetricSink::spawn(
            SinkOutputs::new().with(MetricKind::RoundTrip, Some(dir.path().join("rtt.csv"))),
        );
        let client = start(url, Role::EchoProbe, settings(10, EchoPayload::Probe), sink).await;

        let shutdown = Shutdown::new();
        let task = tokio::spawn(client.run(shutdown.listener()));
        time::sleep(Duration::from_millis(500)).await;
        shutdown.trigger();
        let report = task.await.unwrap();
        handle.close().await;

        let arrivals = arrivals.lock().unwrap();
        assert!(arrivals.len() >= 3, "only {} requests", arrivals.len());
        for pair in arrivals.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(60));
        }
        assert!(report.samples >= 3);
        assert!(report.probes_sent >= report.samples);
        assert_eq!(report.anomalies, 0);
    }

    #[tokio::test]
    async fn foreign_reply_is_flagged_and_client_keeps_waiting() {
        let url = serve_one(|mut ws| async move {
            if let Some(Ok(msg)) = ws.next().await {
                let foreign = Probe::new(ClientId(99), 1).encode();
                ws.send(Message::Text(foreign)).await.unwrap();
                ws.send(Message::Text("not json".into())).await.unwrap();
                ws.send(msg).await.unwrap();
            }
            // hold the connection open without answering further probes
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let rtt = dir.path().join("rtt.csv");
        let anomalies = dir.path().join("anomalies.csv");
        let (sink, handle) = MetricSink::spawn(
            SinkOutputs::new()
                .with(MetricKind::RoundTrip, Some(rtt.clone()))
                .with(MetricKind::Anomaly, Some(anomalies.clone())),
        );
        let client = start(url, Role::EchoProbe, settings(10, EchoPayload::Probe), sink).await;

        let shutdown = Shutdown::new();
        let task = tokio::spawn(client.run(shutdown.listener()));
        time::sleep(Duration::from_millis(300)).await;
        shutdown.trigger();
        let report = task.await.unwrap();
        handle.close().await;

        assert_eq!(report.samples, 1);
        assert_eq!(report.anomalies, 1);
        assert_eq!(report.decode_errors, 1);
        // second probe sent, never answered
        assert_eq!(report.probes_sent, 2);

        let anomaly_rows = std::fs::read_to_string(&anomalies).unwrap();
        assert!(anomaly_rows.lines().nth(1).unwrap().contains(",0,mismatch,"));
        assert_eq!(std::fs::read_to_string(&rtt).unwrap().lines().count(), 2);
    }

    #[tokio::test]
    async fn literal_payload_measures_against_local_send_time() {
        let url = serve_one(|mut ws| async move {
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() && ws.send(msg).await.is_err() {
                    break;
                }
            }
        })
        .await;

        let (sink, handle) = MetricSink::spawn(SinkOutputs::new());
        let client = start(url, Role::EchoProbe, settings(50, EchoPayload::Literal), sink).await;

        let shutdown = Shutdown::new();
        let task = tokio::spawn(client.run(shutdown.listener()));
        time::sleep(Duration::from_millis(220)).await;
        shutdown.trigger();
        let report = task.await.unwrap();
        handle.close().await;

        assert!((3..=6).contains(&report.samples), "{report:?}");
        assert_eq!(report.decode_errors, 0);
    }

    #[tokio::test]
    async fn listener_survives_garbage_and_reports_peer_close() {
        let url = serve_one(|mut ws| async move {
            ws.send(Message::Text("garbage".into())).await.unwrap();
            let probe = Probe::new(ClientId(5), clock::now_nanos()).encode();
            ws.send(Message::Text(probe)).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let latency = dir.path().join("latency.csv");
        let (sink, handle) = MetricSink::spawn(
            SinkOutputs::new().with(MetricKind::BroadcastLatency, Some(latency.clone())),
        );
        let client = start(url, Role::Listener, settings(10, EchoPayload::Probe), sink).await;

        let shutdown = Shutdown::new();
        let report = time::timeout(Duration::from_secs(2), client.run(shutdown.listener()))
            .await
            .expect("listener should stop when the peer closes");
        handle.close().await;

        assert_eq!(report.samples, 1);
        assert_eq!(report.decode_errors, 1);
        assert!(report.lost_connection);

        let content = std::fs::read_to_string(&latency).unwrap();
        let row = content.lines().nth(1).unwrap();
        let fields: Vec<_> = row.split(',').collect();
        assert_eq!(fields[1], "5");
        assert_eq!(fields[2], "0");
        assert!(fields[3].parse::<f64>().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn future_dated_broadcast_is_an_anomaly_not_a_sample() {
        let url = serve_one(|mut ws| async move {
            let ahead = clock::now_nanos() + 5_000_000_000;
            let probe = Probe::new(ClientId(3), ahead).encode();
            ws.send(Message::Text(probe)).await.unwrap();
            // keep the session up until the client closes it
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let latency = dir.path().join("latency.csv");
        let anomalies = dir.path().join("anomalies.csv");
        let (sink, handle) = MetricSink::spawn(
            SinkOutputs::new()
                .with(MetricKind::BroadcastLatency, Some(latency.clone()))
                .with(MetricKind::Anomaly, Some(anomalies.clone())),
        );
        let client = start(url, Role::Listener, settings(10, EchoPayload::Probe), sink).await;

        let shutdown = Shutdown::new();
        let task = tokio::spawn(client.run(shutdown.listener()));
        time::sleep(Duration::from_millis(200)).await;
        shutdown.trigger();
        let report = task.await.unwrap();
        handle.close().await;

        assert_eq!(report.samples, 0);
        assert_eq!(report.anomalies, 1);
        assert!(!report.lost_connection);

        let latency_rows = std::fs::read_to_string(&latency).unwrap();
        assert_eq!(latency_rows.lines().count(), 1, "only the header: {latency_rows}");

        let anomaly_rows = std::fs::read_to_string(&anomalies).unwrap();
        let row = anomaly_rows.lines().nth(1).unwrap();
        assert!(row.contains(",0,negative,"), "{row}");
    }
}

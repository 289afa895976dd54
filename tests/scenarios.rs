use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Instant};
use tokio_tungstenite::WebSocketStream;
use ws_bench::client::ClientId;
use ws_bench::config::{Config, ServerMode};
use ws_bench::error::RunError;
use ws_bench::metrics::{MetricSink, SinkOutputs};
use ws_bench::server::{Server, ServerOptions};
use ws_bench::shutdown::Shutdown;
use ws_bench::transport::{self, ConnState, ProtocolKind, TransportConfig};
use ws_bench::{Orchestrator, RunOutcome};

async fn start_server(mode: ServerMode, protocol: ProtocolKind) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let (sink, _handle) = MetricSink::spawn(SinkOutputs::new());
    let server = Server::new(ServerOptions::new(mode, protocol));
    let listener_shutdown = shutdown.listener();
    tokio::spawn(async move { server.serve(listener, sink, listener_shutdown).await });
    (addr, shutdown)
}

async fn echo(mut ws: WebSocketStream<TcpStream>) {
    while let Some(Ok(msg)) = ws.next().await {
        if msg.is_text() && ws.send(msg).await.is_err() {
            break;
        }
    }
}

/// Echo server that cuts the first `doomed` connections without a close
/// handshake once `after` has passed, and serves the rest normally.
async fn cutting_echo_server(doomed: usize, after: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut accepted = 0;
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let cut = accepted < doomed;
            accepted += 1;
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                if cut {
                    let _ = time::timeout(after, echo(ws)).await;
                } else {
                    echo(ws).await;
                }
            });
        }
    });
    addr
}

fn echo_config(addr: SocketAddr, clients: u32, seconds: u64, rtt: &Path) -> Config {
    Config::from_toml(&format!(
        r#"
        [run]
        target_url = "ws://{addr}"
        scenario = "echo"
        num_clients = {clients}
        duration_seconds = {seconds}
        probe_interval_ms = 50
        grace_period_ms = 100

        [ramp_up]
        policy = "burst"

        [output]
        round_trip = "{}"
        "#,
        rtt.display()
    ))
    .unwrap()
}

fn rows(path: &Path) -> Vec<Vec<String>> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(|line| line.split(',').map(String::from).collect())
        .collect()
}

async fn one_probe_broadcast(protocol: ProtocolKind) {
    let (addr, server) = start_server(ServerMode::Broadcast, protocol).await;
    let dir = tempfile::tempdir().unwrap();
    let latency = dir.path().join("broadcast-latency.csv");
    let conn = dir.path().join("conn-time.csv");

    let config = Config::from_toml(&format!(
        r#"
        [run]
        target_url = "ws://{addr}"
        protocol = "{protocol}"
        scenario = "broadcast"
        num_clients = 5
        duration_seconds = 1
        probe_interval_ms = 60000
        grace_period_ms = 100

        [ramp_up]
        policy = "paced"
        interval_ms = 5

        [broadcast]
        sender_id = 2

        [output]
        broadcast_latency = "{}"
        connection_time = "{}"
        "#,
        latency.display(),
        conn.display()
    ))
    .unwrap();

    let report = Orchestrator::new(config).run().await.unwrap();
    server.trigger();

    assert_eq!(report.clients, 5);
    assert_eq!(report.probes_sent, 1);
    assert_eq!(report.samples, 4);
    assert_eq!(report.anomalies, 0);

    let mut receivers: Vec<u32> = rows(&latency)
        .iter()
        .map(|row| {
            assert_eq!(row[1], "2", "sender id");
            assert!(row[3].parse::<f64>().unwrap() >= 0.0);
            row[2].parse().unwrap()
        })
        .collect();
    receivers.sort();
    assert_eq!(receivers, vec![0, 1, 3, 4]);

    let mut connected: Vec<u32> = rows(&conn).iter().map(|r| r[1].parse().unwrap()).collect();
    connected.sort();
    assert_eq!(connected, vec![0, 1, 2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_probe_reaches_each_listener_once() {
    one_probe_broadcast(ProtocolKind::RawSocket).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_over_event_channel() {
    one_probe_broadcast(ProtocolKind::EventChannel).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_client_paces_probes_over_the_run() {
    let (addr, server) = start_server(ServerMode::Echo, ProtocolKind::RawSocket).await;
    let dir = tempfile::tempdir().unwrap();
    let rtt = dir.path().join("rtt.csv");

    let config = Config::from_toml(&format!(
        r#"
        [run]
        target_url = "ws://{addr}"
        scenario = "echo"
        num_clients = 1
        duration_seconds = 1
        probe_interval_ms = 100
        grace_period_ms = 100

        [ramp_up]
        policy = "burst"

        [output]
        round_trip = "{}"
        "#,
        rtt.display()
    ))
    .unwrap();

    let report = Orchestrator::new(config).run().await.unwrap();
    server.trigger();

    let samples = rows(&rtt);
    assert!((8..=11).contains(&samples.len()), "{} samples", samples.len());
    for row in &samples {
        assert_eq!(row[1], "0");
        assert!(row[2].parse::<f64>().unwrap() >= 0.0);
    }
    assert_eq!(report.samples as usize, samples.len());
    assert_eq!(report.lost_connections, 0);
}

#[tokio::test]
async fn burst_ramp_up_against_nothing_aborts() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let dir = tempfile::tempdir().unwrap();

    let config = Config::from_toml(&format!(
        r#"
        [run]
        target_url = "ws://{addr}"
        scenario = "echo"
        num_clients = 3
        duration_seconds = 60

        [ramp_up]
        policy = "burst"
        connect_timeout_ms = 2000

        [output]
        round_trip = "{}"
        "#,
        dir.path().join("rtt.csv").display()
    ))
    .unwrap();

    let err = Orchestrator::new(config).run().await.unwrap_err();
    assert!(matches!(err, RunError::RampUp { .. }), "{err}");
}

#[tokio::test]
async fn paced_ramp_up_names_the_failing_client() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    // accepts two websocket clients, then slams the door on everyone else
    let counter = accepted.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                held.push(tokio_tungstenite::accept_async(stream).await.unwrap());
            } else {
                drop(stream);
            }
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let config = Config::from_toml(&format!(
        r#"
        [run]
        target_url = "ws://{addr}"
        scenario = "echo"
        num_clients = 10
        duration_seconds = 60
        grace_period_ms = 100

        [ramp_up]
        policy = "paced"
        interval_ms = 50

        [output]
        round_trip = "{}"
        "#,
        dir.path().join("rtt.csv").display()
    ))
    .unwrap();

    match Orchestrator::new(config).run().await {
        Err(RunError::RampUp { id, .. }) => assert_eq!(id, ClientId(2)),
        other => panic!("expected ramp-up failure, got {other:?}"),
    }
    assert!(accepted.load(Ordering::SeqCst) < 10);
}

#[tokio::test]
async fn closing_twice_is_a_no_op() {
    let (addr, server) = start_server(ServerMode::Echo, ProtocolKind::RawSocket).await;
    let config = TransportConfig {
        url: format!("ws://{addr}"),
        protocol: ProtocolKind::RawSocket,
        channel: "chat message".into(),
        connect_timeout: Duration::from_secs(2),
    };

    let opened = transport::connect(ClientId(0), &config, None).await.unwrap();
    let connection = opened.connection;
    assert_eq!(connection.state(), ConnState::Open);

    assert!(connection.close());
    assert!(!connection.close());
    assert!(connection.send("late").is_err());

    connection.finish(Duration::from_secs(1)).await;
    server.trigger();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_mid_run_tears_down_in_order() {
    let (addr, server) = start_server(ServerMode::Echo, ProtocolKind::RawSocket).await;
    let dir = tempfile::tempdir().unwrap();
    let rtt = dir.path().join("rtt.csv");
    let orchestrator = Orchestrator::new(echo_config(addr, 2, 60, &rtt));

    let started = Instant::now();
    let (result, cancels) = tokio::join!(orchestrator.run(), async {
        time::sleep(Duration::from_millis(400)).await;
        (orchestrator.cancel(), orchestrator.cancel())
    });
    let report = result.unwrap();
    server.trigger();

    assert_eq!(cancels, (true, false));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.clients, 2);
    assert_eq!(report.lost_connections, 0);
    assert!(report.samples > 0);
    assert_eq!(rows(&rtt).len() as u64, report.samples);
    // the run is over, so there is nothing left to cancel
    assert!(!orchestrator.cancel());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_lost_client_does_not_stop_its_siblings() {
    let addr = cutting_echo_server(1, Duration::from_millis(300)).await;
    let dir = tempfile::tempdir().unwrap();
    let rtt = dir.path().join("rtt.csv");

    let started = Instant::now();
    let report = Orchestrator::new(echo_config(addr, 3, 1, &rtt))
        .run()
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.clients, 3);
    assert_eq!(report.lost_connections, 1);

    let mut per_client = std::collections::HashMap::<String, usize>::new();
    for row in rows(&rtt) {
        *per_client.entry(row[1].clone()).or_default() += 1;
    }
    let mut counts: Vec<usize> = per_client.values().copied().collect();
    counts.sort();
    // the cut client stopped after ~300ms, the others kept going for the full second
    assert_eq!(counts.len(), 3, "{per_client:?}");
    assert!(counts[0] < 10, "{per_client:?}");
    assert!(counts[1] >= 15 && counts[2] >= 15, "{per_client:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn losing_every_client_ends_the_run_early() {
    let addr = cutting_echo_server(usize::MAX, Duration::from_millis(200)).await;
    let dir = tempfile::tempdir().unwrap();
    let rtt = dir.path().join("rtt.csv");

    let started = Instant::now();
    let report = Orchestrator::new(echo_config(addr, 3, 30, &rtt))
        .run()
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.outcome, RunOutcome::PoolLost);
    assert_eq!(report.lost_connections, 3);
}

//! Uniform connect / send / receive / close over the two wire protocols.
//!
//! A [`Connection`] owns one websocket session split into a reader task and a
//! writer task. Inbound frames are decoded into plain text and pushed onto the
//! owning client's event queue together with the monotonic time they arrived,
//! so the client never sees which protocol is underneath.

pub mod event;
mod framing;

pub use framing::{Framing, Inbound};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use socket2::TcpKeepalive;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, client_async};
use tracing::{debug, trace, warn};

use crate::client::ClientId;
use crate::clock;
use crate::error::{ConnectError, DecodeError, TransportError};

type WsStream = WebSocketStream<TcpStream>;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    #[default]
    RawSocket,
    EventChannel,
}

impl FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw-socket" | "ws" => Ok(ProtocolKind::RawSocket),
            "event-channel" | "socketio" => Ok(ProtocolKind::EventChannel),
            other => Err(format!("unknown protocol {other}")),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::RawSocket => f.write_str("raw-socket"),
            ProtocolKind::EventChannel => f.write_str("event-channel"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> ConnState {
        ConnState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn swap(&self, state: ConnState) -> ConnState {
        ConnState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }

    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Delivered to the client that owns the connection.
#[derive(Debug)]
pub enum TransportEvent {
    Message { payload: String, received_at: u64 },
    Undecodable(DecodeError),
    Closed { reason: Option<String> },
}

/// Delivered to whoever keeps the books on open connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Opened {
        id: ClientId,
    },
    Closed {
        id: ClientId,
        reason: Option<String>,
        /// True when we asked for the close, false when the peer or the
        /// network ended it.
        requested: bool,
    },
}

pub type LifecycleSender = mpsc::UnboundedSender<LifecycleEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub protocol: ProtocolKind,
    pub channel: String,
    pub connect_timeout: Duration,
}

#[derive(Debug)]
enum Outbound {
    Frame(Message),
    Close,
}

/// A freshly opened connection and the queue its inbound traffic lands on.
#[derive(Debug)]
pub struct Opened {
    pub connection: Connection,
    pub events: EventReceiver,
    pub connect_time: Duration,
}

#[derive(Debug)]
pub struct Connection {
    id: ClientId,
    state: Arc<StateCell>,
    framing: Framing,
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct Endpoint {
    url: String,
    authority: String,
}

impl Endpoint {
    fn resolve(target: &str, protocol: ProtocolKind) -> Result<Self, ConnectError> {
        let url = match protocol {
            ProtocolKind::RawSocket => match target.strip_prefix("http://") {
                Some(rest) => format!("ws://{rest}"),
                None => target.to_string(),
            },
            ProtocolKind::EventChannel => event::endpoint_url(target),
        };

        let uri: http::Uri = url
            .parse()
            .map_err(|_| ConnectError::InvalidUrl(target.to_string()))?;
        if uri.scheme_str() != Some("ws") {
            return Err(ConnectError::InvalidUrl(target.to_string()));
        }
        let host = uri
            .host()
            .ok_or_else(|| ConnectError::InvalidUrl(target.to_string()))?;
        let port = uri.port_u16().unwrap_or(80);

        Ok(Self {
            authority: format!("{host}:{port}"),
            url,
        })
    }
}

fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    let sock_ref = socket2::SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    sock_ref.set_tcp_keepalive(&keepalive)?;

    // latency samples should not wait on Nagle
    stream.set_nodelay(true)?;
    Ok(())
}

/// Opens one connection for client `id`. The measured connect time covers
/// the TCP connect and every handshake up to Open.
pub async fn connect(
    id: ClientId,
    config: &TransportConfig,
    lifecycle: Option<LifecycleSender>,
) -> Result<Opened, ConnectError> {
    let endpoint = Endpoint::resolve(&config.url, config.protocol)?;
    let framing = Framing::new(config.protocol, &config.channel);

    let started = Instant::now();
    let handshake = async {
        let stream = TcpStream::connect(&endpoint.authority).await?;
        configure_socket(&stream)?;
        let (mut ws, _response) = client_async(endpoint.url.as_str(), stream).await?;
        if let Framing::Event { .. } = framing {
            event::client_handshake(&mut ws).await?;
        }
        Ok::<_, ConnectError>(ws)
    };
    let ws = time::timeout(config.connect_timeout, handshake)
        .await
        .map_err(|_| ConnectError::Timeout(config.connect_timeout))??;
    let connect_time = started.elapsed();

    debug!("Client {} connected to {} in {:?}", id, endpoint.url, connect_time);
    let state = Arc::new(StateCell::new(ConnState::Open));
    if let Some(lifecycle) = &lifecycle {
        let _ = lifecycle.send(LifecycleEvent::Opened { id });
    }

    let (sink, stream) = ws.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(write_loop(id, sink, outbound_rx, framing.goodbye()));
    let reader = tokio::spawn(read_loop(
        id,
        stream,
        framing.clone(),
        state.clone(),
        outbound_tx.clone(),
        events_tx,
        lifecycle,
    ));

    Ok(Opened {
        connection: Connection {
            id,
            state,
            framing,
            outbound: outbound_tx,
            reader,
            writer,
        },
        events: events_rx,
        connect_time,
    })
}

impl Connection {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    /// Queues `payload` for the writer task. Never waits on the socket.
    pub fn send(&self, payload: &str) -> Result<(), TransportError> {
        let state = self.state.get();
        if state != ConnState::Open {
            return Err(TransportError::NotOpen(state));
        }
        self.outbound
            .send(Outbound::Frame(self.framing.encode(payload)))
            .map_err(|_| TransportError::Disconnected)
    }

    /// Starts the close handshake. Returns false, doing nothing, when the
    /// connection is already closing or closed.
    pub fn close(&self) -> bool {
        if !self.state.transition(ConnState::Open, ConnState::Closing) {
            trace!("Client {} close ignored in state {:?}", self.id, self.state.get());
            return false;
        }
        if self.outbound.send(Outbound::Close).is_err() {
            self.state.swap(ConnState::Closed);
        }
        true
    }

    /// Closes and waits up to `grace` for each task to wind down, then
    /// abandons whatever is left.
    pub async fn finish(self, grace: Duration) {
        self.close();

        let Connection {
            id,
            state,
            outbound,
            mut reader,
            mut writer,
            ..
        } = self;
        // once the reader is gone too, the writer drains and sends its close
        drop(outbound);

        if time::timeout(grace, &mut writer).await.is_err() {
            debug!("Client {} writer did not flush within {:?}", id, grace);
            writer.abort();
        }
        if time::timeout(grace, &mut reader).await.is_err() {
            debug!("Client {} peer did not acknowledge close", id);
            reader.abort();
            state.swap(ConnState::Closed);
        }
    }
}

async fn write_loop(
    id: ClientId,
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    goodbye: Option<Message>,
) {
    while let Some(command) = outbound.recv().await {
        match command {
            Outbound::Frame(message) => {
                if let Err(e) = sink.send(message).await {
                    debug!("Client {} write failed: {}", id, e);
                    return;
                }
            }
            Outbound::Close => {
                if let Some(goodbye) = goodbye {
                    let _ = sink.send(goodbye).await;
                }
                break;
            }
        }
    }

    if let Err(e) = sink.close().await {
        trace!("Client {} close frame not sent: {}", id, e);
    }
}

async fn read_loop(
    id: ClientId,
    mut stream: SplitStream<WsStream>,
    framing: Framing,
    state: Arc<StateCell>,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
    lifecycle: Option<LifecycleSender>,
) {
    let reason = loop {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        };
        let received_at = clock::now_nanos();

        match framing.decode(message) {
            Ok(Inbound::Payload(payload)) => {
                let _ = events.send(TransportEvent::Message {
                    payload,
                    received_at,
                });
            }
            Ok(Inbound::Reply(reply)) => {
                let _ = outbound.send(Outbound::Frame(reply));
            }
            Ok(Inbound::Ignore) => {}
            Ok(Inbound::Closed(reason)) => break reason,
            Err(e) => {
                warn!("Client {} received undecodable frame: {}", id, e);
                let _ = events.send(TransportEvent::Undecodable(e));
            }
        }
    };

    let previous = state.swap(ConnState::Closed);
    let requested = previous == ConnState::Closing;
    if !requested {
        debug!("Client {} connection lost: {:?}", id, reason);
    }

    let _ = events.send(TransportEvent::Closed {
        reason: reason.clone(),
    });
    if let Some(lifecycle) = lifecycle {
        let _ = lifecycle.send(LifecycleEvent::Closed {
            id,
            reason,
            requested,
        });
    }
}

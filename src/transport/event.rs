//! Event-channel framing: Engine.IO v4 / Socket.IO v5 text packets carried in
//! WebSocket frames. Only the default namespace and text events are handled.

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::{ConnectError, DecodeError};

pub const HANDSHAKE_PATH: &str = "/socket.io/?EIO=4&transport=websocket";

/// How often a server pings each event-channel session.
pub const PING_INTERVAL: Duration = Duration::from_millis(25_000);
const PING_TIMEOUT_MS: u64 = 20_000;
const MAX_PAYLOAD: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Engine open, carrying the session json.
    Open(String),
    Close,
    Ping,
    Pong,
    Noop,
    /// Namespace connect. Clients send it bare, servers answer with a body.
    Connect(Option<String>),
    Disconnect,
    Event { name: String, data: String },
    ConnectError(String),
}

impl Packet {
    pub fn event(name: &str, data: &str) -> Self {
        Packet::Event {
            name: name.to_string(),
            data: data.to_string(),
        }
    }

    pub fn parse(text: &str) -> Result<Packet, DecodeError> {
        let malformed = || DecodeError::Packet(text.to_string());
        let mut chars = text.chars();
        let engine = chars.next().ok_or_else(malformed)?;
        let rest = chars.as_str();

        let packet = match engine {
            '0' => Packet::Open(rest.to_string()),
            '1' => Packet::Close,
            '2' => Packet::Ping,
            '3' => Packet::Pong,
            '6' => Packet::Noop,
            '4' => {
                let mut chars = rest.chars();
                let kind = chars.next().ok_or_else(malformed)?;
                let body = strip_namespace(chars.as_str());
                match kind {
                    '0' if body.is_empty() => Packet::Connect(None),
                    '0' => Packet::Connect(Some(body.to_string())),
                    '1' => Packet::Disconnect,
                    '2' => parse_event(body).ok_or_else(malformed)?,
                    '4' => Packet::ConnectError(body.to_string()),
                    _ => return Err(malformed()),
                }
            }
            _ => return Err(malformed()),
        };
        Ok(packet)
    }

    pub fn encode(&self) -> String {
        match self {
            Packet::Open(info) => format!("0{info}"),
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Noop => "6".to_string(),
            Packet::Connect(None) => "40".to_string(),
            Packet::Connect(Some(body)) => format!("40{body}"),
            Packet::Disconnect => "41".to_string(),
            Packet::Event { name, data } => {
                format!("42{}", Value::from(vec![name.as_str(), data.as_str()]))
            }
            Packet::ConnectError(body) => format!("44{body}"),
        }
    }

    pub fn into_message(self) -> Message {
        Message::Text(self.encode())
    }
}

/// Drops a `/nsp,` prefix and an ack id, neither of which we act on.
fn strip_namespace(body: &str) -> &str {
    let body = match body.strip_prefix('/') {
        Some(_) => body.split_once(',').map(|(_, rest)| rest).unwrap_or(""),
        None => body,
    };
    body.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn parse_event(body: &str) -> Option<Packet> {
    let args: Vec<Value> = serde_json::from_str(body).ok()?;
    let mut args = args.into_iter();
    let name = match args.next()? {
        Value::String(name) => name,
        _ => return None,
    };
    let data = match args.next() {
        Some(Value::String(data)) => data,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    Some(Packet::Event { name, data })
}

/// Points a target at the socket.io websocket endpoint. Any other path on
/// the target is replaced, since the engine only listens on its own path.
pub fn endpoint_url(target: &str) -> String {
    let target = match target.strip_prefix("http://") {
        Some(rest) => format!("ws://{rest}"),
        None => target.to_string(),
    };
    if target.contains("/socket.io/") {
        return target;
    }
    let (scheme, rest) = target.split_once("://").unwrap_or(("ws", target.as_str()));
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    format!("{scheme}://{authority}{HANDSHAKE_PATH}")
}

async fn next_packet<S>(ws: &mut WebSocketStream<S>) -> Result<Packet, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return Packet::parse(&text).map_err(|e| ConnectError::Protocol(e.to_string()));
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err(ConnectError::Protocol("closed during handshake".into()));
            }
            Some(Ok(other)) => {
                return Err(ConnectError::Protocol(format!("unexpected frame {other:?}")));
            }
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Waits for the engine open packet, joins the default namespace and waits
/// for the server's acknowledgement.
pub async fn client_handshake<S>(ws: &mut WebSocketStream<S>) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match next_packet(ws).await? {
        Packet::Open(info) => debug!("Event channel session opened: {}", info),
        other => {
            return Err(ConnectError::Protocol(format!("expected open packet, got {other:?}")));
        }
    }

    ws.send(Packet::Connect(None).into_message()).await?;

    loop {
        match next_packet(ws).await? {
            Packet::Connect(_) => return Ok(()),
            Packet::ConnectError(reason) => return Err(ConnectError::Protocol(reason)),
            Packet::Ping => ws.send(Packet::Pong.into_message()).await?,
            Packet::Noop => {}
            other => {
                return Err(ConnectError::Protocol(format!(
                    "expected namespace connect, got {other:?}"
                )));
            }
        }
    }
}

/// Server half of [`client_handshake`]. The server then owes the client a
/// ping every `ping_interval`.
pub async fn server_handshake<S>(
    ws: &mut WebSocketStream<S>,
    sid: &str,
    ping_interval: Duration,
) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let open = json!({
        "sid": sid,
        "upgrades": [],
        "pingInterval": ping_interval.as_millis() as u64,
        "pingTimeout": PING_TIMEOUT_MS,
        "maxPayload": MAX_PAYLOAD,
    });
    ws.send(Packet::Open(open.to_string()).into_message()).await?;

    loop {
        match next_packet(ws).await? {
            Packet::Connect(_) => break,
            Packet::Pong | Packet::Noop => {}
            other => {
                return Err(ConnectError::Protocol(format!(
                    "expected namespace connect, got {other:?}"
                )));
            }
        }
    }

    let ack = json!({ "sid": sid });
    ws.send(Packet::Connect(Some(ack.to_string())).into_message())
        .await?;
    Ok(())
}

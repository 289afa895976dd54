use tokio_tungstenite::tungstenite::Message;
use tracing::trace;

use super::ProtocolKind;
use super::event::Packet;
use crate::error::DecodeError;

/// What a received frame means to the connection.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Application payload, normalized to text.
    Payload(String),
    /// Protocol-level answer to send straight back.
    Reply(Message),
    Ignore,
    Closed(Option<String>),
}

/// Per-protocol mapping between application text and wire frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    Raw,
    Event { channel: String },
}

impl Framing {
    pub fn new(protocol: ProtocolKind, channel: &str) -> Self {
        match protocol {
            ProtocolKind::RawSocket => Framing::Raw,
            ProtocolKind::EventChannel => Framing::Event {
                channel: channel.to_string(),
            },
        }
    }

    pub fn encode(&self, payload: &str) -> Message {
        match self {
            Framing::Raw => Message::Text(payload.to_string()),
            Framing::Event { channel } => Packet::event(channel, payload).into_message(),
        }
    }

    /// Sent ahead of the websocket close frame.
    pub fn goodbye(&self) -> Option<Message> {
        match self {
            Framing::Raw => None,
            Framing::Event { .. } => Some(Packet::Disconnect.into_message()),
        }
    }

    pub fn decode(&self, message: Message) -> Result<Inbound, DecodeError> {
        let text = match message {
            Message::Close(frame) => {
                return Ok(Inbound::Closed(
                    frame.map(|f| format!("closed by peer ({}) {}", f.code, f.reason)),
                ));
            }
            // tungstenite answers pings on its own
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Ok(Inbound::Ignore),
            Message::Text(text) => text,
            Message::Binary(bytes) => match self {
                Framing::Raw => String::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?,
                Framing::Event { .. } => {
                    return Err(DecodeError::Packet(format!("{} byte binary frame", bytes.len())));
                }
            },
        };

        let channel = match self {
            Framing::Raw => return Ok(Inbound::Payload(text)),
            Framing::Event { channel } => channel,
        };

        match Packet::parse(&text)? {
            Packet::Event { name, data } if &name == channel => Ok(Inbound::Payload(data)),
            Packet::Event { name, .. } => {
                trace!("Ignoring event on channel {:?}", name);
                Ok(Inbound::Ignore)
            }
            Packet::Ping => Ok(Inbound::Reply(Packet::Pong.into_message())),
            Packet::Close | Packet::Disconnect => {
                Ok(Inbound::Closed(Some("server disconnected".to_string())))
            }
            Packet::Open(_)
            | Packet::Pong
            | Packet::Noop
            | Packet::Connect(_)
            | Packet::ConnectError(_) => Ok(Inbound::Ignore),
        }
    }
}

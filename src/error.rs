use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::client::ClientId;
use crate::transport::ConnState;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid target url {0}")]
    InvalidUrl(String),

    #[error("tcp connect failed: {0}")]
    Tcp(#[from] io::Error),

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),

    #[error("event channel handshake failed: {0}")]
    Protocol(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

/// A received payload that could not be turned into what the receiver
/// expected. Dropped and logged; the client keeps running.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("binary frame is not valid utf-8")]
    NotUtf8,

    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("send time {0:?} is not a decimal nanosecond count")]
    Timestamp(String),

    #[error("unexpected payload {0:?}")]
    UnexpectedPayload(String),

    #[error("malformed event packet {0:?}")]
    Packet(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is {0:?}, not open")]
    NotOpen(ConnState),

    #[error("connection writer has gone away")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors that end a run. Everything else stays local to one client.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("client {id} failed to connect during ramp-up: {source}")]
    RampUp {
        id: ClientId,
        #[source]
        source: ConnectError,
    },

    #[error("ramp-up finished with {connected} of {expected} clients open")]
    PartialPool { connected: usize, expected: usize },
}

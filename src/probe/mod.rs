//! Probe payloads and the send/receive correlation check.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::client::ClientId;
use crate::clock;
use crate::error::DecodeError;

/// Fixed payload used by literal echo runs.
pub const PING_PAYLOAD: &str = "Ping!";

/// `{"senderId": 3, "sendTime": "123456789"}`. The send time is the sender's
/// monotonic clock in nanoseconds, carried as a decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    pub sender_id: u32,
    pub send_time: String,
}

impl Probe {
    pub fn new(sender: ClientId, send_nanos: u64) -> Self {
        Self {
            sender_id: sender.0,
            send_time: send_nanos.to_string(),
        }
    }

    pub fn sender(&self) -> ClientId {
        ClientId(self.sender_id)
    }

    pub fn send_nanos(&self) -> Result<u64, DecodeError> {
        self.send_time
            .parse()
            .map_err(|_| DecodeError::Timestamp(self.send_time.clone()))
    }

    pub fn encode(&self) -> String {
        // a struct of a u32 and a String always serializes
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(payload: &str) -> Result<Self, DecodeError> {
        let probe: Probe = serde_json::from_str(payload)?;
        probe.send_nanos()?;
        Ok(probe)
    }
}

/// A latency that cannot be right. Kept out of the sample streams.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CorrelationAnomaly {
    #[error("receive at {received}ns precedes send at {sent}ns")]
    Negative { sent: u64, received: u64 },

    #[error("latency {ms:.3}ms exceeds ceiling {ceiling_ms}ms")]
    ExceedsCeiling { ms: f64, ceiling_ms: u128 },

    #[error("reply does not match outstanding probe: expected {expected}, got {got}")]
    Mismatch { expected: String, got: String },
}

impl CorrelationAnomaly {
    pub fn kind(&self) -> &'static str {
        match self {
            CorrelationAnomaly::Negative { .. } => "negative",
            CorrelationAnomaly::ExceedsCeiling { .. } => "ceiling",
            CorrelationAnomaly::Mismatch { .. } => "mismatch",
        }
    }
}

/// Latency in milliseconds between a send and its matching receive.
pub fn measure(sent: u64, received: u64, ceiling: Duration) -> Result<f64, CorrelationAnomaly> {
    if received < sent {
        return Err(CorrelationAnomaly::Negative { sent, received });
    }
    let ms = clock::delta_ms(sent, received);
    if ms > clock::duration_ms(ceiling) {
        return Err(CorrelationAnomaly::ExceedsCeiling {
            ms,
            ceiling_ms: ceiling.as_millis(),
        });
    }
    Ok(ms)
}

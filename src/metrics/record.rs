use std::fmt;

use crate::client::ClientId;
use crate::clock;

/// One output stream per kind, each with its own header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    ConnectionTime,
    RoundTrip,
    BroadcastLatency,
    Throughput,
    Anomaly,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::ConnectionTime,
        MetricKind::RoundTrip,
        MetricKind::BroadcastLatency,
        MetricKind::Throughput,
        MetricKind::Anomaly,
    ];

    pub fn header(self) -> &'static [&'static str] {
        match self {
            MetricKind::ConnectionTime => &["TIMESTAMP", "CLIENT_ID", "CONNECTION_TIME_MS"],
            MetricKind::RoundTrip => &["TIMESTAMP", "CLIENT_ID", "RTT_MS"],
            MetricKind::BroadcastLatency => {
                &["TIMESTAMP", "SENDER_ID", "RECEIVER_ID", "BROADCAST_LATENCY_MS"]
            }
            MetricKind::Throughput => &["TIMESTAMP", "THROUGHPUT_MSGS_PER_SEC"],
            MetricKind::Anomaly => &["TIMESTAMP", "CLIENT_ID", "KIND", "DETAIL"],
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::ConnectionTime => "connection-time",
            MetricKind::RoundTrip => "round-trip",
            MetricKind::BroadcastLatency => "broadcast-latency",
            MetricKind::Throughput => "throughput",
            MetricKind::Anomaly => "anomaly",
        };
        f.write_str(name)
    }
}

/// An immutable output row. The wall-clock timestamp is taken when the
/// record is built, after the measurement it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: String,
    pub body: RecordBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    ConnectionTime {
        client_id: ClientId,
        ms: f64,
    },
    RoundTrip {
        client_id: ClientId,
        ms: f64,
    },
    BroadcastLatency {
        sender_id: ClientId,
        receiver_id: ClientId,
        ms: f64,
    },
    Throughput {
        count: u64,
    },
    Anomaly {
        client_id: ClientId,
        kind: &'static str,
        detail: String,
    },
}

impl Record {
    fn now(body: RecordBody) -> Self {
        Self {
            timestamp: clock::local_timestamp(),
            body,
        }
    }

    pub fn connection_time(client_id: ClientId, ms: f64) -> Self {
        Self::now(RecordBody::ConnectionTime { client_id, ms })
    }

    pub fn round_trip(client_id: ClientId, ms: f64) -> Self {
        Self::now(RecordBody::RoundTrip { client_id, ms })
    }

    pub fn broadcast_latency(sender_id: ClientId, receiver_id: ClientId, ms: f64) -> Self {
        Self::now(RecordBody::BroadcastLatency {
            sender_id,
            receiver_id,
            ms,
        })
    }

    pub fn throughput(count: u64) -> Self {
        Self::now(RecordBody::Throughput { count })
    }

    pub fn anomaly(client_id: ClientId, kind: &'static str, detail: impl Into<String>) -> Self {
        Self::now(RecordBody::Anomaly {
            client_id,
            kind,
            detail: detail.into(),
        })
    }

    pub fn kind(&self) -> MetricKind {
        match self.body {
            RecordBody::ConnectionTime { .. } => MetricKind::ConnectionTime,
            RecordBody::RoundTrip { .. } => MetricKind::RoundTrip,
            RecordBody::BroadcastLatency { .. } => MetricKind::BroadcastLatency,
            RecordBody::Throughput { .. } => MetricKind::Throughput,
            RecordBody::Anomaly { .. } => MetricKind::Anomaly,
        }
    }

    /// Column values in header order. Quoting is left to the csv writer.
    pub fn fields(&self) -> Vec<String> {
        let ts = self.timestamp.clone();
        match &self.body {
            RecordBody::ConnectionTime { client_id, ms } | RecordBody::RoundTrip { client_id, ms } => {
                vec![ts, client_id.to_string(), format!("{ms:.3}")]
            }
            RecordBody::BroadcastLatency {
                sender_id,
                receiver_id,
                ms,
            } => vec![
                ts,
                sender_id.to_string(),
                receiver_id.to_string(),
                format!("{ms:.3}"),
            ],
            RecordBody::Throughput { count } => vec![ts, count.to_string()],
            RecordBody::Anomaly {
                client_id,
                kind,
                detail,
            } => vec![ts, client_id.to_string(), kind.to_string(), detail.clone()],
        }
    }
}

//! Latency samples, throughput ticks and the CSV sink they end up in.

mod record;
mod sink;

pub use record::{MetricKind, Record, RecordBody};
pub use sink::{MetricSink, SinkHandle, SinkOutputs, SinkStats};

//! WebSocket benchmarking harness: simulated client pools driving echo and
//! broadcast servers, recording connection time, round-trip time, broadcast
//! latency and server throughput as CSV.

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod probe;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use config::Config;
pub use orchestrator::{Orchestrator, RunOutcome, RunReport};

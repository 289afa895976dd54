use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::ClientId;
use crate::error::ConfigError;
use crate::transport::ProtocolKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub run: RunConfig,
    #[serde(default)]
    pub ramp_up: RampUpConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub target_url: String,
    #[serde(default)]
    pub protocol: ProtocolKind,
    pub scenario: Scenario,
    pub num_clients: u32,
    pub duration_seconds: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_latency_ceiling_ms")]
    pub latency_ceiling_ms: u64,
    #[serde(default)]
    pub echo_payload: EchoPayload,
    #[serde(default = "default_event_channel")]
    pub event_channel: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    Echo,
    Broadcast,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EchoPayload {
    /// JSON probe carrying sender id and send time.
    #[default]
    Probe,
    /// The fixed string `Ping!`.
    Literal,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RampUpPolicy {
    Burst,
    #[default]
    Paced,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RampUpConfig {
    #[serde(default)]
    pub policy: RampUpPolicy,
    #[serde(default = "default_ramp_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RampUpConfig {
    fn default() -> Self {
        Self {
            policy: RampUpPolicy::default(),
            interval_ms: default_ramp_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BroadcastConfig {
    #[serde(default)]
    pub sender_id: u32,
}

/// One optional file per metric stream. Streams without a path are dropped.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct OutputConfig {
    pub connection_time: Option<PathBuf>,
    pub round_trip: Option<PathBuf>,
    pub broadcast_latency: Option<PathBuf>,
    pub throughput: Option<PathBuf>,
    pub anomalies: Option<PathBuf>,
}

fn default_name() -> String {
    "unnamed".to_string()
}

fn default_probe_interval_ms() -> u64 {
    100
}

fn default_grace_period_ms() -> u64 {
    2000
}

fn default_latency_ceiling_ms() -> u64 {
    60_000
}

fn default_event_channel() -> String {
    "chat message".to_string()
}

fn default_ramp_interval_ms() -> u64 {
    20
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let run = &self.run;
        if run.num_clients == 0 {
            return Err(ConfigError::Invalid("num_clients must be at least 1".into()));
        }
        if run.duration_seconds == 0 {
            return Err(ConfigError::Invalid("duration_seconds must be at least 1".into()));
        }

        let scheme = run.target_url.split("://").next().unwrap_or_default();
        if !run.target_url.contains("://") || !matches!(scheme, "ws" | "http") {
            return Err(ConfigError::Invalid(format!(
                "target_url {} must use ws:// or http://",
                run.target_url
            )));
        }

        match run.scenario {
            Scenario::Echo => {
                if self.output.round_trip.is_none() {
                    return Err(ConfigError::Invalid(
                        "echo runs need output.round_trip".into(),
                    ));
                }
            }
            Scenario::Broadcast => {
                if run.num_clients < 2 {
                    return Err(ConfigError::Invalid(
                        "broadcast runs need at least 2 clients".into(),
                    ));
                }
                if self.broadcast.sender_id >= run.num_clients {
                    return Err(ConfigError::Invalid(format!(
                        "broadcast.sender_id {} is outside 0..{}",
                        self.broadcast.sender_id, run.num_clients
                    )));
                }
                if run.probe_interval_ms == 0 {
                    return Err(ConfigError::Invalid(
                        "broadcast runs need probe_interval_ms above 0".into(),
                    ));
                }
                if self.output.broadcast_latency.is_none() {
                    return Err(ConfigError::Invalid(
                        "broadcast runs need output.broadcast_latency".into(),
                    ));
                }
            }
        }

        if run.protocol == ProtocolKind::EventChannel && run.event_channel.is_empty() {
            return Err(ConfigError::Invalid("event_channel must not be empty".into()));
        }

        Ok(())
    }

    pub fn broadcaster(&self) -> ClientId {
        ClientId(self.broadcast.sender_id)
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_secs(self.run.duration_seconds)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.run.probe_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.run.grace_period_ms)
    }

    pub fn latency_ceiling(&self) -> Duration {
        Duration::from_millis(self.run.latency_ceiling_ms)
    }

    pub fn ramp_interval(&self) -> Duration {
        Duration::from_millis(self.ramp_up.interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.ramp_up.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServerMode {
    Echo,
    Broadcast,
}

/// Arguments of the reference server binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "bench_server")]
#[command(about = "Reference echo/broadcast server for ws-bench", long_about = None)]
#[command(after_help = "example: bench_server echo rust-tungstenite 100")]
pub struct ServerArgs {
    /// Relay behaviour
    #[arg(value_enum)]
    pub mode: ServerMode,

    /// Label used in the throughput file name
    pub server_id: String,

    /// Client load the run is sized for, used in the throughput file name
    pub client_load: u32,

    /// Wire protocol: raw-socket or event-channel
    #[arg(long, default_value = "raw-socket")]
    pub protocol: ProtocolKind,

    /// Address to listen on
    #[arg(long = "listen", default_value = "127.0.0.1:8080")]
    pub listen_addr: SocketAddr,
}

impl ServerArgs {
    pub fn throughput_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "throughput_{}_{}clients.csv",
            self.server_id, self.client_load
        ))
    }
}

//! Builds the client pool, runs it for the configured duration and tears it
//! down in order.

mod ramp;

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::client::{ClientReport, ClientSettings, Role, SimulatedClient};
use crate::config::Config;
use crate::error::RunError;
use crate::metrics::{MetricSink, SinkHandle, SinkOutputs, SinkStats};
use crate::shutdown::Shutdown;
use crate::transport::{LifecycleEvent, TransportConfig};

pub use ramp::ramp_up;

/// Why the countdown ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The configured duration elapsed.
    #[default]
    Completed,
    /// `cancel()` or Ctrl-C.
    Cancelled,
    /// Every client lost its connection before the deadline.
    PoolLost,
}

/// Totals for one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub clients: usize,
    pub probes_sent: u64,
    pub samples: u64,
    pub anomalies: u64,
    pub decode_errors: u64,
    pub lost_connections: usize,
    pub sink: SinkStats,
}

impl RunReport {
    fn absorb(&mut self, report: &ClientReport) {
        self.probes_sent += report.probes_sent;
        self.samples += report.samples;
        self.anomalies += report.anomalies;
        self.decode_errors += report.decode_errors;
        if report.lost_connection {
            self.lost_connections += 1;
        }
    }
}

pub struct Orchestrator {
    config: Config,
    shutdown: Shutdown,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: Shutdown::new(),
        }
    }

    /// Stops the run early, from another task while `run` is in progress.
    /// Returns false, doing nothing, when the run was already cancelled or
    /// has ended.
    pub fn cancel(&self) -> bool {
        self.shutdown.trigger()
    }

    /// Runs once. A cancel issued before the countdown starts ends the run
    /// as soon as the pool is open.
    pub async fn run(&self) -> Result<RunReport, RunError> {
        let config = &self.config;
        let run = &config.run;
        info!(
            "Starting {} - {:?} test over {} for {} clients",
            run.name, run.scenario, run.protocol, run.num_clients
        );
        info!("Test will run for {} seconds", run.duration_seconds);

        let (sink, sink_handle) = MetricSink::spawn(SinkOutputs::from(&config.output));
        let (lifecycle_tx, mut lifecycle_rx) = mpsc::unbounded_channel();

        let transport = TransportConfig {
            url: run.target_url.clone(),
            protocol: run.protocol,
            channel: run.event_channel.clone(),
            connect_timeout: config.connect_timeout(),
        };

        info!("Connecting all clients...");
        let pool = match ramp_up(config, &transport, &sink, lifecycle_tx).await {
            Ok(pool) => pool,
            Err(e) => {
                error!("{}", e);
                sink_handle.close().await;
                return Err(e);
            }
        };

        let settings = ClientSettings {
            probe_interval: config.probe_interval(),
            echo_payload: run.echo_payload,
            latency_ceiling: config.latency_ceiling(),
            close_grace: config.grace_period(),
        };

        let mut clients = JoinSet::new();
        let mut report = RunReport {
            clients: pool.len(),
            ..RunReport::default()
        };
        for opened in pool {
            let id = opened.connection.id();
            let role = Role::assign(run.scenario, config.broadcaster(), id);
            let client = SimulatedClient::new(
                role,
                opened.connection,
                opened.events,
                sink.clone(),
                settings.clone(),
            );
            clients.spawn(client.run(self.shutdown.listener()));
        }
        info!("All {} clients connected. Test starting.", report.clients);

        report.outcome = self
            .countdown(config.run_duration(), report.clients, &mut lifecycle_rx)
            .await;
        match report.outcome {
            RunOutcome::Completed => info!("Test duration finished. Stopping all clients..."),
            RunOutcome::Cancelled => warn!("Interrupted. Stopping all clients..."),
            RunOutcome::PoolLost => warn!("Every client lost its connection. Stopping..."),
        }

        self.teardown(clients, sink_handle, &mut report).await;
        info!(
            "Simulation complete: {} clients, {} probes, {} samples, {} anomalies, {} decode errors, {} connections lost",
            report.clients,
            report.probes_sent,
            report.samples,
            report.anomalies,
            report.decode_errors,
            report.lost_connections
        );
        Ok(report)
    }

    async fn countdown(
        &self,
        duration: Duration,
        clients: usize,
        lifecycle: &mut mpsc::UnboundedReceiver<LifecycleEvent>,
    ) -> RunOutcome {
        let deadline = Instant::now() + duration;
        let mut open = clients;
        let mut cancelled = self.shutdown.listener();

        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => return RunOutcome::Completed,
                _ = cancelled.wait() => return RunOutcome::Cancelled,
                _ = tokio::signal::ctrl_c() => return RunOutcome::Cancelled,
                event = lifecycle.recv() => match event {
                    Some(LifecycleEvent::Closed { id, reason, requested: false }) => {
                        open = open.saturating_sub(1);
                        warn!(
                            "Client {} disconnected: {} ({} still open)",
                            id,
                            reason.as_deref().unwrap_or("stream ended"),
                            open
                        );
                        if open == 0 {
                            return RunOutcome::PoolLost;
                        }
                    }
                    Some(event) => debug!("Lifecycle: {:?}", event),
                    // no connection holds a sender any more
                    None => return RunOutcome::PoolLost,
                },
            }
        }
    }

    async fn teardown(
        &self,
        mut clients: JoinSet<ClientReport>,
        sink_handle: SinkHandle,
        report: &mut RunReport,
    ) {
        let grace = self.config.grace_period();
        let grace_ends = Instant::now() + grace;
        self.shutdown.trigger();

        // every client closes its own connection and waits up to `grace`
        // on each of its tasks
        let drain = async {
            while let Some(joined) = clients.join_next().await {
                match joined {
                    Ok(client) => report.absorb(&client),
                    Err(e) => error!("Client task failed: {}", e),
                }
            }
        };
        if time::timeout(grace * 3, drain).await.is_err() {
            warn!("{} clients did not finish closing", clients.len());
            clients.abort_all();
        }

        time::sleep_until(grace_ends).await;
        report.sink = sink_handle.close().await;
    }
}

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ws_bench::{Config, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ws_bench=info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "bench.toml".to_string());
    info!("Loading config from {}", config_path);

    let config = Config::from_file(&config_path)?;
    info!(
        "Loaded config for {} clients against {}",
        config.run.num_clients, config.run.target_url
    );

    let report = Orchestrator::new(config).run().await?;
    info!("Records written: {}", report.sink.written);

    Ok(())
}

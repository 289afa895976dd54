use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ws_bench::config::ServerArgs;
use ws_bench::metrics::{MetricKind, MetricSink, SinkOutputs};
use ws_bench::server::{Server, ServerOptions};
use ws_bench::shutdown::Shutdown;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ws_bench=info")),
        )
        .init();

    // exits with status 2 and a usage message when arguments are missing
    let args = ServerArgs::parse();

    let throughput_path = args.throughput_path();
    let (sink, sink_handle) = MetricSink::spawn(
        SinkOutputs::new().with(MetricKind::Throughput, Some(throughput_path.clone())),
    );

    let listener = TcpListener::bind(args.listen_addr).await?;
    info!(
        "Websocket server ({}) - {:?} is running on ws://{}",
        args.server_id, args.mode, args.listen_addr
    );
    info!("Logging throughput to file {}", throughput_path.display());

    let shutdown = Shutdown::new();
    let server = Server::new(ServerOptions::new(args.mode, args.protocol));
    let listener_shutdown = shutdown.listener();
    let serving = tokio::spawn(async move { server.serve(listener, sink, listener_shutdown).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.trigger();

    serving.await??;
    sink_handle.close().await;
    Ok(())
}

//! Reference server under test: echo or broadcast relay over either protocol,
//! counting every payload it receives.

mod registry;
mod throughput;

pub use registry::{MemberId, Registry};
pub use throughput::ThroughputCounter;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use rand::distr::Alphanumeric;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::ServerMode;
use crate::metrics::MetricSink;
use crate::shutdown::ShutdownListener;
use crate::transport::event::{self, Packet};
use crate::transport::{Framing, Inbound, ProtocolKind};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub mode: ServerMode,
    pub protocol: ProtocolKind,
    pub channel: String,
    pub tick_interval: Duration,
    /// Engine ping period for event-channel sessions.
    pub ping_interval: Duration,
}

impl ServerOptions {
    pub fn new(mode: ServerMode, protocol: ProtocolKind) -> Self {
        Self {
            mode,
            protocol,
            channel: "chat message".to_string(),
            tick_interval: Duration::from_secs(1),
            ping_interval: event::PING_INTERVAL,
        }
    }
}

struct Shared {
    options: ServerOptions,
    framing: Framing,
    registry: Registry,
    counter: Arc<ThroughputCounter>,
}

pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        let framing = Framing::new(options.protocol, &options.channel);
        Self {
            shared: Arc::new(Shared {
                options,
                framing,
                registry: Registry::new(),
                counter: Arc::new(ThroughputCounter::default()),
            }),
        }
    }

    pub fn members(&self) -> usize {
        self.shared.registry.len()
    }

    /// Accepts connections until shutdown. Throughput ticks go to `sink`.
    pub async fn serve(
        &self,
        listener: TcpListener,
        sink: MetricSink,
        mut shutdown: ShutdownListener,
    ) -> Result<()> {
        let options = &self.shared.options;
        info!(
            "Serving {:?} over {} on {}",
            options.mode,
            options.protocol,
            listener.local_addr()?
        );

        let reporter = tokio::spawn(throughput::report(
            self.shared.counter.clone(),
            sink,
            options.tick_interval,
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!("New connection from {}", peer);
                        let shared = self.shared.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(socket, peer, shared).await {
                                error!("Error handling connection from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }

        reporter.await?;
        Ok(())
    }
}

fn session_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

async fn handle_connection(socket: TcpStream, peer: SocketAddr, shared: Arc<Shared>) -> Result<()> {
    let (outbox, queued) = mpsc::unbounded_channel::<Message>();
    let open = Arc::new(AtomicBool::new(true));

    // join before the handshake completes, so a client that sees its
    // connection open is already part of every later fan-out
    let member = match shared.options.mode {
        ServerMode::Broadcast => Some(shared.registry.join(outbox.clone(), open.clone())),
        ServerMode::Echo => None,
    };

    let result = run_session(socket, peer, &shared, member, outbox, queued, open).await;

    if let Some(id) = member {
        shared.registry.leave(id);
        info!("Client disconnected. Total clients: {}", shared.registry.len());
    } else {
        info!("Client disconnected");
    }
    result
}

async fn run_session(
    socket: TcpStream,
    peer: SocketAddr,
    shared: &Shared,
    member: Option<MemberId>,
    outbox: mpsc::UnboundedSender<Message>,
    mut queued: mpsc::UnboundedReceiver<Message>,
    open: Arc<AtomicBool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let mut ws = accept_async(socket).await?;
    let event_channel = shared.options.protocol == ProtocolKind::EventChannel;
    let ping_interval = shared.options.ping_interval;
    if event_channel {
        event::server_handshake(&mut ws, &session_id(), ping_interval).await?;
    }
    match member {
        Some(_) => info!("Client connected (broadcast). Total clients: {}", shared.registry.len()),
        None => info!("Client connected (echo)"),
    }

    let (mut sink, mut stream) = ws.split();
    let writer = {
        let open = open.clone();
        tokio::spawn(async move {
            while let Some(message) = queued.recv().await {
                // anything queued after the read side ended is dropped
                if !open.load(Ordering::Acquire) {
                    continue;
                }
                if let Err(e) = sink.send(message).await {
                    debug!("Write error to {}: {}", peer, e);
                    open.store(false, Ordering::Release);
                    break;
                }
            }
            let _ = sink.close().await;
        })
    };

    let mut pings = time::interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = pings.tick(), if event_channel => {
                let _ = outbox.send(Packet::Ping.into_message());
                continue;
            }
        };
        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!("Read error from {}: {}", peer, e);
                break;
            }
            None => break,
        };

        match shared.framing.decode(message) {
            Ok(Inbound::Payload(payload)) => {
                shared.counter.hit();
                let relayed = shared.framing.encode(&payload);
                match member {
                    Some(origin) => {
                        shared.registry.fan_out(origin, &relayed);
                    }
                    None => {
                        let _ = outbox.send(relayed);
                    }
                }
            }
            Ok(Inbound::Reply(reply)) => {
                let _ = outbox.send(reply);
            }
            Ok(Inbound::Ignore) => {}
            Ok(Inbound::Closed(_)) => break,
            Err(e) => warn!("Dropping undecodable frame from {}: {}", peer, e),
        }
    }

    open.store(false, Ordering::Release);
    drop(outbox);
    writer.await?;
    Ok(())
}

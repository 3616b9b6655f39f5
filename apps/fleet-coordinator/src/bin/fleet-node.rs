//! Simulated recording node for local runs against a coordinator.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_coordinator::agent::{self, AgentConfig, AgentEvent, SimulatedClock};
use fleet_coordinator::clock::LocalClock;
use fleet_coordinator::telemetry;
use tokio::net::TcpStream;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "fleet-node", author, version, about = "Simulated recording node")]
struct Cli {
    /// Coordinator node listener.
    #[arg(long, env = "FLEET_COORDINATOR_ADDR", default_value = "127.0.0.1:7400")]
    coordinator: SocketAddr,

    #[arg(long, env = "FLEET_NODE_ID")]
    node_id: String,

    /// Declared capability. Repeatable.
    #[arg(long = "capability")]
    capabilities: Vec<String>,

    /// Simulated clock offset from this host, in microseconds.
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    offset_us: i64,

    /// Simulated clock drift in parts per million.
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    drift_ppm: f64,

    #[arg(long, default_value_t = 1000)]
    heartbeat_ms: u64,

    /// Status report period; zero disables reports.
    #[arg(long, default_value_t = 0)]
    status_ms: u64,

    /// Delay before reconnecting after the link drops.
    #[arg(long, default_value_t = 2000)]
    reconnect_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;
    let cli = Cli::parse();
    let base = LocalClock::new();
    let clock = SimulatedClock::new(base, cli.offset_us, cli.drift_ppm);
    let config = AgentConfig {
        heartbeat_interval: Duration::from_millis(cli.heartbeat_ms),
        status_interval: (cli.status_ms > 0).then(|| Duration::from_millis(cli.status_ms)),
        ..AgentConfig::new(cli.node_id.clone()).with_capabilities(cli.capabilities.clone())
    };

    tokio::select! {
        result = run(&cli, config, clock) => result,
        _ = signal::ctrl_c() => {
            info!(target = "fleet::node", node_id = %cli.node_id, "interrupted");
            Ok(())
        }
    }
}

async fn run(cli: &Cli, config: AgentConfig, clock: SimulatedClock) -> Result<()> {
    let reconnect = Duration::from_millis(cli.reconnect_ms);
    loop {
        let stream = match TcpStream::connect(cli.coordinator).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(target = "fleet::node", coordinator = %cli.coordinator, error = %err, "connect failed; retrying");
                tokio::time::sleep(reconnect).await;
                continue;
            }
        };
        stream.set_nodelay(true).context("failed to set nodelay")?;

        match agent::connect(stream, config.clone(), clock).await {
            Ok((handle, mut events)) => {
                while let Some(event) = events.recv().await {
                    match event {
                        AgentEvent::Disconnected => break,
                        AgentEvent::CommandReceived { .. } => {}
                        other => info!(target = "fleet::node", node_id = %cli.node_id, event = ?other, "agent event"),
                    }
                }
                handle.closed().await;
            }
            Err(agent::AgentError::Rejected(reason)) => {
                anyhow::bail!("coordinator rejected {}: {reason}", cli.node_id);
            }
            Err(err) => warn!(target = "fleet::node", error = %err, "handshake failed"),
        }
        tokio::time::sleep(reconnect).await;
    }
}

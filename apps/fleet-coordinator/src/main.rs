use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_coordinator::{Collaborators, CoordinatorConfig, Fleet, http, telemetry};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "fleet-coordinator",
    author,
    version,
    about = "Synchronized start/stop coordinator for recording nodes"
)]
struct Cli {
    /// TOML configuration file; durations are in milliseconds.
    #[arg(long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Address nodes connect to.
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Address of the HTTP control surface.
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Directory receiving one JSON outcome per finished session.
    #[arg(long)]
    persistence_dir: Option<PathBuf>,

    /// Capability every node must declare to be admitted. Repeatable.
    #[arg(long = "require-capability")]
    required_capabilities: Vec<String>,
}

impl Cli {
    fn into_config(self) -> Result<CoordinatorConfig> {
        let mut config = CoordinatorConfig::load(self.config.as_deref())
            .context("failed to load configuration")?;
        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        if let Some(addr) = self.http_addr {
            config.http_addr = Some(addr);
        }
        if let Some(dir) = self.persistence_dir {
            config.persistence_dir = Some(dir);
        }
        config.required_capabilities.extend(self.required_capabilities);
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;
    let config = Cli::parse().into_config()?;
    info!(
        target = "fleet::server",
        listen_addr = %config.listen_addr,
        http_addr = ?config.http_addr,
        persistence_dir = ?config.persistence_dir,
        "starting fleet coordinator"
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind node listener on {}", config.listen_addr))?;
    let http_listener = match config.http_addr {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind http listener on {addr}"))?,
        ),
        None => None,
    };

    let fleet = Fleet::start(config.clone(), Collaborators::from_config(&config));
    fleet.listen(listener);

    match http_listener {
        Some(listener) => {
            http::serve(fleet.clone(), listener, shutdown_signal())
                .await
                .context("http server failed")?;
        }
        None => shutdown_signal().await,
    }

    info!(target = "fleet::server", "shutdown signal received");
    fleet.shutdown().await;
    info!(target = "fleet::server", "coordinator stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

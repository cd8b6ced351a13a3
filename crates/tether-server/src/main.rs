//! # tether-server
//!
//! Standalone broker binary: loads configuration, starts the HTTP/WebSocket
//! listener, and runs until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tether_server::config::ServerConfig;
use tether_server::server::ChannelServer;

/// Tether broker server.
#[derive(Parser, Debug)]
#[command(name = "tether-server", about = "WebSocket message broker")]
struct Cli {
    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides the config file).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides the config file, 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Log filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.json_logs {
        tether_core::logging::init_json_subscriber(&cli.log_level);
    } else {
        tether_core::logging::init_subscriber(&cli.log_level);
    }

    let mut config =
        ServerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);

    let mut server = ChannelServer::new(config.clone());
    if config.metrics {
        let handle = tether_server::metrics::install_recorder()
            .context("Failed to install metrics recorder")?;
        server = server.with_metrics(handle);
    }

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("Tether listening on ws://{addr}{}", config.path);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.stop(handle).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

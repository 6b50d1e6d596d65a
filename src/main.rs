//! Whizard gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!                       ┌───────────────────────────────────────────────────┐
//!                       │                     GATEWAY                       │
//!   Client Request      │  ┌─────────┐   ┌─────────┐   ┌─────────────────┐  │
//!   ────────────────────┼─▶│   net   │──▶│  http   │──▶│     tenant      │  │
//!                       │  │listener │   │ server  │   │ resolve + authz │  │
//!                       │  └─────────┘   └─────────┘   └────────┬────────┘  │
//!                       │                                       ▼           │
//!                       │                 ┌──────────────┐  ┌──────────┐    │
//!                       │                 │ remote_write │◀─│ handlers │    │
//!                       │                 │ relay+fanout │  │ enforce  │    │
//!                       │                 └──────┬───────┘  └────┬─────┘    │
//!                       │                        ▼               ▼          │
//!   Client Response     │                 ┌─────────────────────────────┐   │
//!   ◀───────────────────┼─────────────────│     proxy (transport)       │◀──┼── Backends
//!                       │                 └─────────────────────────────┘   │
//!                       │  config (+ admission watcher) · observability ·   │
//!                       │  lifecycle                                        │
//!                       └───────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use whizard_gateway::config::{default_config, load_config};
use whizard_gateway::lifecycle::{self, Shutdown};
use whizard_gateway::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "whizard-gateway")]
#[command(about = "Multi-tenant gateway for Prometheus-compatible query and remote-write APIs", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => default_config()?,
    };
    if cli.check_config {
        println!("configuration is valid");
        return Ok(());
    }

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.observability.log_level);
    logging::init_logging(level, config.observability.log_format);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "whizard-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        strategy = ?config.tenant.strategy,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    let gateway = lifecycle::start(&config, &shutdown).await?;
    gateway.run().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

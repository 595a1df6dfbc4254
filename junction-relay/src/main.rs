//! JunctionRelay sensor relay.
//!
//! Polls collectors and devices, then streams the sampled values to display
//! devices over serial, MQTT or WebSocket.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use junction_core::RelayConfig;
use junction_relay::RelayRunner;

/// Sensor relay for JunctionRelay displays.
#[derive(Parser, Debug)]
#[command(name = "junction-relay")]
#[command(about = "Polls sensor sources and streams them to display devices")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "junction-relay.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = RelayConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = config
        .logging
        .with_level_override(args.log_level.as_deref());
    junction_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting junction-relay");
    info!("Loaded configuration from {:?}", args.config);

    let runner = RelayRunner::new(config).await?;
    runner.run().await
}

//! index-daemon: Headless folder indexing daemon.
//!
//! Scans the configured folders, keeps their indexes on disk and streams
//! index updates to connected peer devices over WebSocket.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use index_core::DeviceId;
use index_daemon::server::WebSocketServer;
use index_daemon::{Daemon, DaemonConfig};

#[derive(Parser, Debug)]
#[command(name = "index-daemon")]
#[command(about = "Folder indexing and index propagation daemon")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on for incoming connections (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Device ID as 16 hex digits (overrides config; generated if unset)
    #[arg(long)]
    device_id: Option<DeviceId>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,index_daemon=debug"
    } else {
        "info,index_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting index-daemon");

    let mut config = match &args.config {
        Some(path) => {
            info!("Config file: {}", path.display());
            DaemonConfig::load(path)?
        }
        None => DaemonConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(device_id) = args.device_id {
        config.device_id = Some(device_id);
    }
    info!("Listen address: {}", config.listen);

    let listener = WebSocketServer::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;
    let daemon = Daemon::start(config).await?;

    info!("Daemon running. Press Ctrl+C to stop.");
    daemon
        .run(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

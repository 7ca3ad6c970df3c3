//! GPR engine daemon
//!
//! Admits, places and tracks GPU requests across the clusters reported by the
//! inventory feed, and serves the REST API.

use anyhow::Context;
use clap::Parser;
use egs_api::create_router_with_feed;
use egs_core::{DaemonConfig, LoggingConfig};
use egs_scheduler::{GprScheduler, StaticRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// egsd - GPU request admission, selection and lifecycle engine
#[derive(Parser, Debug)]
#[command(name = "egsd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level or filter directive
    #[arg(long)]
    log_level: Option<String>,
}

/// Load the config file, if any, and apply CLI overrides
fn load_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };

    if let Some(address) = &args.address {
        config.api.address = address.clone();
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    Ok(config)
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&logging.level)
        .with_context(|| format!("invalid log level '{}'", logging.level))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match logging.format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install subscriber: {}", e))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config.logging)?;

    info!("Starting egsd v{}", env!("CARGO_PKG_VERSION"));

    // Create scheduler
    let registry = Arc::new(StaticRegistry::from_config(&config.workspaces));
    let scheduler = Arc::new(GprScheduler::new(config.scheduler.clone(), registry));
    if !config.inventory.is_empty() {
        scheduler.inventory_index().seed(&config.inventory).await;
        info!(nodes = config.inventory.len(), "Seeded inventory from config");
    }

    // Background loops
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let (inventory_tx, inventory_rx) =
        mpsc::channel(config.scheduler.inventory_channel_capacity.max(1));

    let tasks = vec![
        tokio::spawn(scheduler.clone().run_dispatcher(shutdown_rx.clone())),
        tokio::spawn(scheduler.clone().run_sweeper(shutdown_rx.clone())),
        tokio::spawn(
            scheduler
                .clone()
                .run_inventory_feed(inventory_rx, shutdown_rx),
        ),
    ];

    // Create API router; pushed inventory goes through the feed loop
    let router = create_router_with_feed(scheduler, inventory_tx);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("invalid API address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("API server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(());
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("egsd stopped");
    Ok(())
}

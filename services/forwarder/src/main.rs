//! tailport
//!
//! Joins the overlay network as a node, opens one listener per forwarding
//! rule and forwards traffic until interrupted.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tailport_forwarder::{Cli, Config, HostNode, ListenerSupervisor, LogFormat, Overlay, ProxyError};

/// Filter directive enabled by --overlay-debug.
const OVERLAY_DEBUG_DIRECTIVE: &str = "tailport_forwarder::overlay=debug";

fn init_tracing(cli: &Cli) -> Result<()> {
    // Prefer RUST_LOG, fall back to --log-level.
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into());
    if cli.overlay_debug {
        filter = filter.add_directive(
            OVERLAY_DEBUG_DIRECTIVE
                .parse()
                .context("invalid overlay debug directive")?,
        );
    }

    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
    }

    Ok(())
}

async fn run(config: Config) -> Result<(), ProxyError> {
    let node = Arc::new(HostNode::new(config.node_config()).map_err(ProxyError::BringUp)?);
    let status = node.bring_up().await.map_err(ProxyError::BringUp)?;
    info!(
        hostname = %status.hostname(),
        addresses = ?status.addresses,
        "Node started successfully"
    );

    let overlay: Arc<dyn Overlay> = node;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = ListenerSupervisor::new(Arc::clone(&overlay), config.rules);
    let running = match supervisor.start(shutdown_rx).await {
        Ok(running) => running,
        Err(e) => {
            overlay.shutdown().await;
            return Err(e);
        }
    };
    let waiter = tokio::spawn(running.wait());

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = waiter.await {
        error!(error = %e, "Supervisor task failed");
    }

    overlay.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    info!(name = %cli.name, ephemeral = cli.ephemeral, "Starting tailport");

    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, hint = e.hint(), "Invalid configuration");
            return Ok(ExitCode::FAILURE);
        }
    };
    info!(
        data_dir = %config.data_dir.display(),
        bind_addr = %config.bind_addr,
        rules = config.rules.len(),
        "Configuration loaded"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, hint = e.hint(), "Forwarding failed");
        return Ok(ExitCode::FAILURE);
    }

    Ok(ExitCode::SUCCESS)
}

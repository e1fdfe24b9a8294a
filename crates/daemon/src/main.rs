//! Fleet daemon
//!
//! Adopts running workloads, registers declared nodes and keeps the
//! registry reconciled until shutdown.

use clap::Parser;
use fleet_common::Error;
use fleet_daemon::config::{default_config_path, DaemonConfig};
use fleet_daemon::{DockerCli, Orchestrator, Reconciler};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "Fleet daemon - container node orchestration")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FLEETD_CONFIG")]
    config: Option<PathBuf>,

    /// Container runtime binary, overrides the config file
    #[arg(long)]
    runtime_binary: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Fleet daemon v{}", env!("CARGO_PKG_VERSION"));

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(binary) = cli.runtime_binary {
        config.runtime.binary = binary;
    }
    info!("Using configuration {}", config_path.display());

    let runtime = Arc::new(DockerCli::new(config.runtime.binary.clone()));
    let orchestrator = Arc::new(Orchestrator::new(runtime, config.orchestrator.clone()));

    // Adopt whatever is already running before registering declared nodes
    let report = orchestrator.load().await?;
    info!("Adopted {} running node(s)", report.loaded.len());

    for descriptor in config.nodes.clone() {
        if orchestrator.registry().contains(&descriptor.name) {
            continue;
        }
        let name = descriptor.name.clone();
        match orchestrator.new_node(descriptor) {
            Ok(_) => info!("Declared node {} registered", name),
            Err(e) => warn!("Skipping declared node {}: {}", name, e),
        }
    }

    let cancel = CancellationToken::new();
    let reconciler_handle = config.reconcile_interval().map(|interval| {
        let reconciler = Reconciler::new(orchestrator.clone(), interval);
        let cancel = cancel.clone();
        tokio::spawn(async move { reconciler.run(cancel).await })
    });

    info!("Daemon started with {} node(s)", orchestrator.nodes().len());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    cancel.cancel();
    if let Some(handle) = reconciler_handle {
        if let Err(e) = handle.await {
            error!("Reconciler task failed: {}", e);
        }
    }

    if config.clean_on_shutdown {
        match orchestrator.clean().await {
            Ok(removed) => info!("Tore down {} node(s)", removed),
            Err(Error::BulkTeardown(failures)) => {
                for failure in &failures {
                    error!("Teardown of {} failed: {}", failure.name, failure.message);
                }
            }
            Err(e) => error!("Cleanup failed: {}", e),
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}

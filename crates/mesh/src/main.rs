//! Fleet mesh server

use clap::Parser;
use fleet_mesh::{MeshConfig, MeshService};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "fleet-mesh")]
#[command(about = "Fleet mesh - service registry and key-value store")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FLEET_MESH_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(short, long, env = "FLEET_MESH_LISTEN")]
    listen: Option<SocketAddr>,

    /// Mesh name, overrides the config file
    #[arg(short, long)]
    name: Option<String>,

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

    info!("Fleet mesh v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => MeshConfig::load(path)?,
        None => MeshConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(name) = cli.name {
        config.name = name;
    }

    let mesh = Arc::new(MeshService::new(config.name.clone(), config.service_id.clone()));
    let listener = tokio::net::TcpListener::bind(config.listen).await?;

    fleet_mesh::serve(listener, mesh, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
    })
    .await?;

    info!("Mesh shutdown complete");
    Ok(())
}

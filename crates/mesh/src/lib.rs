//! Fleet mesh
//!
//! Service registry with name and tag discovery, a key-value store, the
//! HTTP router exposing both and the [`MeshInterface`] client.

pub mod client;
pub mod config;
pub mod routes;
pub mod service;

pub use client::MeshInterface;
pub use config::MeshConfig;
pub use routes::{mesh_router, HealthResponse};
pub use service::{KvStore, MeshService, MeshSnapshot, ServiceTable, RESERVED_SERVICE_NAME};

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Serve `mesh` on `listener` until `shutdown` completes
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    mesh: Arc<MeshService>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = listener.local_addr()?;
    info!("Mesh {} listening on http://{}", mesh.name(), addr);
    axum::serve(listener, mesh_router(mesh))
        .with_graceful_shutdown(shutdown)
        .await
}

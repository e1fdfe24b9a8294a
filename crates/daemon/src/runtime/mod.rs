//! Container runtime seam
//!
//! The orchestrator never talks to a container engine directly. Everything
//! goes through [`ContainerRuntime`], implemented by [`DockerCli`] for real
//! hosts and [`MemoryRuntime`] for tests and embedding.

mod docker;
mod memory;

pub use docker::DockerCli;
pub use memory::{MemoryRuntime, Operation};

use async_trait::async_trait;
use fleet_common::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors reported by a container runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{0}")]
    Failed(String),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

impl From<RuntimeError> for Error {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::NotFound { kind, name } => Error::not_found(kind, name),
            RuntimeError::AlreadyExists { kind, name } => Error::duplicate(kind, name),
            RuntimeError::Failed(msg) => Error::Runtime(msg),
        }
    }
}

/// Published port -> container port
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortMapping {
    pub published: u16,
    pub target: u16,
}

impl PortMapping {
    /// Validate a raw integer mapping
    pub fn new(published: i64, target: i64) -> fleet_common::Result<Self> {
        Ok(Self {
            published: port(published)?,
            target: port(target)?,
        })
    }
}

fn port(value: i64) -> fleet_common::Result<u16> {
    if value <= 0 || value > u16::MAX as i64 {
        return Err(Error::Validation(format!(
            "port {} is outside 1..={}",
            value,
            u16::MAX
        )));
    }
    Ok(value as u16)
}

/// Desired workload handed to the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub network: String,
    pub ports: Vec<PortMapping>,
    pub replicas: u32,
    pub labels: BTreeMap<String, String>,
}

/// Live workload as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Raw `KEY=VALUE` entries
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Desired replica count
    pub replicas: u32,
    /// Replicas currently running
    pub running: u32,
}

/// Image selection for [`ContainerRuntime::list_images`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageFilter {
    pub dangling: Option<bool>,
    pub reference: Option<String>,
}

impl ImageFilter {
    pub fn dangling() -> Self {
        Self {
            dangling: Some(true),
            reference: None,
        }
    }
}

/// Local image entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    pub repository: String,
    pub tag: String,
}

impl ImageSummary {
    pub fn is_dangling(&self) -> bool {
        self.repository == "<none>"
    }
}

/// Operations the orchestrator needs from a container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build `tag` from a build context directory
    async fn build_image(&self, context: &Path, tag: &str) -> RuntimeResult<()>;

    async fn list_images(&self, filter: &ImageFilter) -> RuntimeResult<Vec<ImageSummary>>;

    async fn remove_image(&self, id: &str) -> RuntimeResult<()>;

    /// Remove dangling images, returning how many were removed
    ///
    /// An image that refuses removal (still referenced) is skipped.
    async fn prune_images(&self) -> RuntimeResult<usize> {
        let dangling = self.list_images(&ImageFilter::dangling()).await?;
        let mut removed = 0;
        for image in dangling {
            match self.remove_image(&image.id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove dangling image {}: {}", image.id, e),
            }
        }
        debug!("Pruned {} dangling image(s)", removed);
        Ok(removed)
    }

    /// Create and start a workload
    async fn create_workload(&self, spec: &WorkloadSpec) -> RuntimeResult<Workload>;

    async fn start_workload(&self, name: &str, replicas: u32) -> RuntimeResult<()>;

    async fn stop_workload(&self, name: &str) -> RuntimeResult<()>;

    async fn remove_workload(&self, name: &str) -> RuntimeResult<()>;

    /// Fails with [`RuntimeError::NotFound`] when the workload is absent
    async fn get_workload(&self, name: &str) -> RuntimeResult<Workload>;

    async fn list_workloads(&self) -> RuntimeResult<Vec<Workload>>;

    async fn workload_logs(&self, name: &str, tail: Option<usize>) -> RuntimeResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_validation() {
        assert_eq!(
            PortMapping::new(8080, 80).unwrap(),
            PortMapping {
                published: 8080,
                target: 80
            }
        );
        assert!(matches!(PortMapping::new(0, 80), Err(Error::Validation(_))));
        assert!(matches!(PortMapping::new(8080, -1), Err(Error::Validation(_))));
        assert!(matches!(PortMapping::new(70000, 80), Err(Error::Validation(_))));
    }

    #[test]
    fn test_runtime_error_mapping() {
        let e: Error = RuntimeError::NotFound {
            kind: "workload",
            name: "svc".to_string(),
        }
        .into();
        assert!(e.is_not_found());

        let e: Error = RuntimeError::Failed("daemon down".to_string()).into();
        assert!(matches!(e, Error::Runtime(_)));
    }

    #[test]
    fn test_dangling_detection() {
        let image = ImageSummary {
            id: "sha256:1".to_string(),
            repository: "<none>".to_string(),
            tag: "<none>".to_string(),
        };
        assert!(image.is_dangling());
    }
}

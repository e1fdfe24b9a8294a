//! Fleet daemon library
//!
//! Node lifecycle, the tag-indexed node registry, the orchestrator and its
//! reconciliation loop. The `fleetd` binary is a thin wrapper around these.

pub mod config;
pub mod node;
pub mod orchestrator;
pub mod reconciler;
pub mod runtime;

pub use config::DaemonConfig;
pub use node::{CreateOptions, Node, NodeDescriptor, NodeState};
pub use orchestrator::{LoadReport, NodeRegistry, Orchestrator, OrchestratorConfig};
pub use reconciler::Reconciler;
pub use runtime::{ContainerRuntime, DockerCli, MemoryRuntime};

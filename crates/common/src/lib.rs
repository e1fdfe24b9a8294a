//! Fleet Common Library
//!
//! Shared error taxonomy, the tag-indexed registry, and wire types used by
//! the Fleet orchestrator and the mesh registry.

pub mod error;
pub mod registry;
pub mod types;

// Re-export commonly used types
pub use error::{Error, ErrorBody, ErrorKind, Result, TeardownFailure};
pub use registry::{Registry, TagIndex, Taggable};
pub use types::*;

/// Fleet version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Label carrying a node's tags on its backing workload
pub const TAGS_LABEL: &str = "fleet.tags";

/// Network used when none is given
pub const DEFAULT_NETWORK: &str = "bridge";

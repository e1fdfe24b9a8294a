//! Daemon configuration

use crate::node::NodeDescriptor;
use crate::orchestrator::OrchestratorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Seconds between reconciliation passes; 0 disables the reconciler
    pub reconcile_interval_secs: u64,

    /// Tear down every node when the daemon stops
    pub clean_on_shutdown: bool,

    /// Container runtime configuration
    pub runtime: RuntimeConfig,

    /// Orchestrator configuration
    pub orchestrator: OrchestratorConfig,

    /// Nodes registered at startup if the runtime does not already have them
    pub nodes: Vec<NodeDescriptor>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 30,
            clean_on_shutdown: false,
            runtime: RuntimeConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            nodes: Vec::new(),
        }
    }
}

/// Container runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Path to the docker CLI
    pub binary: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reconciliation period, if enabled
    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0)
            .then(|| Duration::from_secs(self.reconcile_interval_secs))
    }
}

/// Default config location, `~/.fleet/fleetd.toml`
pub fn default_config_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleet")
        .join("fleetd.toml")
}

//! Mesh server configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Mesh server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// HTTP listen address
    pub listen: SocketAddr,

    /// Mesh name reported by `/health`
    pub name: String,

    /// Identity of this mesh instance
    pub service_id: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7000)),
            name: "fleet-mesh".to_string(),
            service_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from file, falling back to defaults if absent
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.listen.to_string(), "127.0.0.1:7000");
        assert!(uuid::Uuid::parse_str(&config.service_id).is_ok());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.toml");
        std::fs::write(&path, "listen = \"0.0.0.0:7100\"\nname = \"edge\"\n").unwrap();

        let config = MeshConfig::load(&path).unwrap();
        assert_eq!(config.listen.port(), 7100);
        assert_eq!(config.name, "edge");
        assert!(!config.service_id.is_empty());
    }
}

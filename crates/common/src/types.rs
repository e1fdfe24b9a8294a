//! Shared wire types for Fleet

use crate::registry::Taggable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Service instance advertised in the mesh, keyed by `(name, service_id)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub service_id: String,
    /// Free-form endpoint description, e.g. `http://10.0.0.4:8080`
    #[serde(default)]
    pub endpoints: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_id: service_id.into(),
            endpoints: String::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: impl Into<String>) -> Self {
        self.endpoints = endpoints.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.name, &self.service_id)
    }
}

impl Taggable for ServiceDescriptor {
    fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }
}

/// Composite `(name, service_id)` key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub name: String,
    pub service_id: String,
}

impl ServiceKey {
    pub fn new(name: &str, service_id: &str) -> Self {
        Self {
            name: name.to_string(),
            service_id: service_id.to_string(),
        }
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.service_id)
    }
}

/// Key-value pair stored in the mesh KV store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: serde_json::Value,
}

/// Acknowledgement returned by idempotent mutations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub message: String,
}

//! Mesh service registry and key-value store
//!
//! Services live in three indices: by `(name, id)`, by name and by tag. All
//! three change together under one write lock, so readers never see a
//! service present in one index and missing from another.

use fleet_common::{Ack, Error, Result, ServiceDescriptor, ServiceKey, TagIndex};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// Service name taken by the `/services/search` route
pub const RESERVED_SERVICE_NAME: &str = "search";

/// Three-way service index
#[derive(Debug, Default)]
pub struct ServiceTable {
    by_name_id: BTreeMap<ServiceKey, ServiceDescriptor>,
    by_name: BTreeMap<String, BTreeSet<String>>,
    by_tag: TagIndex<ServiceKey>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the descriptor stored under its `(name, id)`
    pub fn upsert(&mut self, descriptor: ServiceDescriptor) -> bool {
        let key = descriptor.key();
        let replaced = match self.by_name_id.remove(&key) {
            Some(previous) => {
                self.by_tag.remove_all(&previous.tags, &key);
                true
            }
            None => false,
        };

        self.by_name
            .entry(key.name.clone())
            .or_default()
            .insert(key.service_id.clone());
        self.by_tag.add_all(&descriptor.tags, &key);
        self.by_name_id.insert(key, descriptor);
        replaced
    }

    /// Purge `(name, id)` from every index
    pub fn remove(&mut self, name: &str, service_id: &str) -> Option<ServiceDescriptor> {
        let key = ServiceKey::new(name, service_id);
        let descriptor = self.by_name_id.remove(&key)?;

        if let Some(ids) = self.by_name.get_mut(name) {
            ids.remove(service_id);
            if ids.is_empty() {
                self.by_name.remove(name);
            }
        }
        self.by_tag.remove_all(&descriptor.tags, &key);
        Some(descriptor)
    }

    pub fn get(&self, name: &str, service_id: &str) -> Option<&ServiceDescriptor> {
        self.by_name_id.get(&ServiceKey::new(name, service_id))
    }

    /// Instances under `name`, ordered by id
    pub fn by_name(&self, name: &str) -> Vec<ServiceDescriptor> {
        self.by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|id| self.get(name, id).cloned())
            .collect()
    }

    /// Instances carrying `tag`, ordered by key
    pub fn by_tag(&self, tag: &str) -> Vec<ServiceDescriptor> {
        self.by_tag
            .lookup(tag)
            .iter()
            .filter_map(|key| self.by_name_id.get(key).cloned())
            .collect()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.by_tag.contains_tag(tag)
    }

    /// True if any index still references `(name, id)`
    pub fn references(&self, name: &str, service_id: &str) -> bool {
        let key = ServiceKey::new(name, service_id);
        self.by_name_id.contains_key(&key)
            || self
                .by_name
                .get(name)
                .map_or(false, |ids| ids.contains(service_id))
            || self.by_tag.references(&key)
    }

    pub fn tags(&self) -> Vec<String> {
        self.by_tag.tags()
    }

    pub fn names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_name_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name_id.is_empty()
    }

    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        self.by_name_id.values().cloned().collect()
    }
}

/// Last-write-wins key-value store
#[derive(Debug, Default)]
pub struct KvStore {
    entries: HashMap<String, serde_json::Value>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, returning the previous one
    pub fn set(&mut self, key: &str, value: serde_json::Value) -> Option<serde_json::Value> {
        self.entries.insert(key.to_string(), value)
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Point-in-time copy of the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshSnapshot {
    pub name: String,
    pub service_id: String,
    pub services: Vec<ServiceDescriptor>,
    pub keys: usize,
}

/// Service registry and KV store for one mesh
pub struct MeshService {
    name: String,
    service_id: String,
    table: RwLock<ServiceTable>,
    kv: RwLock<KvStore>,
}

impl MeshService {
    pub fn new(name: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_id: service_id.into(),
            table: RwLock::new(ServiceTable::new()),
            kv: RwLock::new(KvStore::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Register or refresh a service instance
    pub fn register_service(&self, descriptor: ServiceDescriptor) -> Result<ServiceDescriptor> {
        if descriptor.name.trim().is_empty() {
            return Err(Error::Validation("service name must not be empty".to_string()));
        }
        if descriptor.name == RESERVED_SERVICE_NAME {
            return Err(Error::Validation(format!(
                "service name {:?} is reserved",
                RESERVED_SERVICE_NAME
            )));
        }
        if descriptor.service_id.trim().is_empty() {
            return Err(Error::Validation(format!(
                "service {} has no service id",
                descriptor.name
            )));
        }

        let key = descriptor.key();
        let replaced = self.table.write().upsert(descriptor.clone());
        if replaced {
            debug!("Refreshed service {}", key);
        } else {
            info!("Registered service {}", key);
        }
        Ok(descriptor)
    }

    /// Every instance tagged with `tag`
    pub fn search_services(&self, tag: &str) -> Result<Vec<ServiceDescriptor>> {
        let found = self.table.read().by_tag(tag);
        if found.is_empty() {
            return Err(Error::not_found("service tag", tag));
        }
        Ok(found)
    }

    /// Every instance registered under `name`
    pub fn get_services(&self, name: &str) -> Result<Vec<ServiceDescriptor>> {
        let found = self.table.read().by_name(name);
        if found.is_empty() {
            return Err(Error::not_found("service", name));
        }
        Ok(found)
    }

    /// Instances a client can reach under `name`
    pub fn discover_service(&self, name: &str) -> Result<Vec<ServiceDescriptor>> {
        self.get_services(name)
    }

    /// Remove one instance; absent instances are not an error
    pub fn deregister_service(&self, name: &str, service_id: &str) -> Ack {
        match self.table.write().remove(name, service_id) {
            Some(_) => {
                info!("Deregistered service {}/{}", name, service_id);
                Ack {
                    message: format!("deregistered {}/{}", name, service_id),
                }
            }
            None => {
                debug!("Service {}/{} was not registered", name, service_id);
                Ack {
                    message: format!("{}/{} not registered", name, service_id),
                }
            }
        }
    }

    pub fn set_key_value(&self, key: &str, value: serde_json::Value) -> Result<Ack> {
        if key.is_empty() {
            return Err(Error::Validation("key must not be empty".to_string()));
        }
        self.kv.write().set(key, value);
        debug!("Set key {}", key);
        Ok(Ack {
            message: format!("stored {}", key),
        })
    }

    pub fn get_key_value(&self, key: &str) -> Result<serde_json::Value> {
        self.kv
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found("key", key))
    }

    pub fn service_count(&self) -> usize {
        self.table.read().len()
    }

    pub fn tags(&self) -> Vec<String> {
        self.table.read().tags()
    }

    /// True if any index still references `(name, id)`
    pub fn references(&self, name: &str, service_id: &str) -> bool {
        self.table.read().references(name, service_id)
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        let services = self.table.read().descriptors();
        MeshSnapshot {
            name: self.name.clone(),
            service_id: self.service_id.clone(),
            services,
            keys: self.kv.read().len(),
        }
    }
}

impl std::fmt::Debug for MeshService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshService")
            .field("name", &self.name)
            .field("service_id", &self.service_id)
            .field("services", &self.service_count())
            .finish()
    }
}

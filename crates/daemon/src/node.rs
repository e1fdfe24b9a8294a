//! Nodes: named deployable units bound to a container image
//!
//! A node moves through `Unbound -> Created -> Running -> Stopped -> Removed`.
//! Its instance map is a cache of what the runtime last reported; the runtime
//! stays authoritative and the cache is refreshed by reconciliation.

use crate::runtime::{ContainerRuntime, PortMapping, RuntimeError, Workload, WorkloadSpec};
use fleet_common::{Error, Result, Taggable, DEFAULT_NETWORK, TAGS_LABEL};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Unbound,
    Created,
    Running,
    Stopped,
    Removed,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Unbound
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Unbound => write!(f, "unbound"),
            NodeState::Created => write!(f, "created"),
            NodeState::Running => write!(f, "running"),
            NodeState::Stopped => write!(f, "stopped"),
            NodeState::Removed => write!(f, "removed"),
        }
    }
}

impl NodeState {
    /// Coarse state of a live workload
    pub fn of(workload: &Workload) -> Self {
        if workload.running > 0 {
            NodeState::Running
        } else if workload.replicas == 0 {
            NodeState::Stopped
        } else {
            NodeState::Created
        }
    }
}

/// Serializable node definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub image: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_network() -> String {
    DEFAULT_NETWORK.to_string()
}

impl NodeDescriptor {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: BTreeMap::new(),
            network: default_network(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
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

    /// Reject empty identifiers and malformed environment keys
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("node name must not be empty".to_string()));
        }
        if self.image.trim().is_empty() {
            return Err(Error::Validation(format!(
                "node {} has no image reference",
                self.name
            )));
        }
        validate_env(&self.env)
    }
}

/// Tags carried in a workload's `fleet.tags` label
pub(crate) fn workload_tags(workload: &Workload) -> BTreeSet<String> {
    workload
        .labels
        .get(TAGS_LABEL)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn validate_env(env: &BTreeMap<String, String>) -> Result<()> {
    for key in env.keys() {
        if key.is_empty() || key.contains('=') {
            return Err(Error::Validation(format!(
                "invalid environment variable name {:?}",
                key
            )));
        }
    }
    Ok(())
}

/// Options for [`Node::create`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    /// Published port -> container port
    pub ports: BTreeMap<i64, i64>,
    pub replicas: u32,
    /// Overrides merged over the node's default environment
    pub env: BTreeMap<String, String>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            ports: BTreeMap::new(),
            replicas: 1,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct NodeRuntimeState {
    state: NodeState,
    replicas: u32,
    instances: HashMap<String, Workload>,
}

/// A deployable unit bound to one container image
pub struct Node {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    image: String,
    env: BTreeMap<String, String>,
    network: String,
    tags: BTreeSet<String>,
    inner: Mutex<NodeRuntimeState>,
}

impl Node {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, descriptor: NodeDescriptor) -> Result<Self> {
        descriptor.validate()?;
        Ok(Self {
            runtime,
            name: descriptor.name,
            image: descriptor.image,
            env: descriptor.env,
            network: descriptor.network,
            tags: descriptor.tags,
            inner: Mutex::new(NodeRuntimeState {
                replicas: 1,
                ..Default::default()
            }),
        })
    }

    /// Rebuild a node from a live workload without provisioning anything
    pub fn from_workload(runtime: Arc<dyn ContainerRuntime>, workload: &Workload) -> Result<Self> {
        if workload.id.trim().is_empty() {
            return Err(Error::Validation(format!(
                "workload {:?} has no id",
                workload.name
            )));
        }

        let mut env = BTreeMap::new();
        for entry in &workload.env {
            let (key, value) = entry.split_once('=').ok_or_else(|| {
                Error::Validation(format!(
                    "workload {} has malformed env entry {:?}",
                    workload.name, entry
                ))
            })?;
            env.insert(key.to_string(), value.to_string());
        }

        let tags = workload_tags(workload);

        let descriptor = NodeDescriptor {
            name: workload.name.clone(),
            image: workload.image.clone(),
            env,
            network: workload
                .networks
                .first()
                .cloned()
                .unwrap_or_else(default_network),
            tags,
        };
        let node = Self::new(runtime, descriptor)?;

        {
            let mut inner = node.inner.lock();
            inner.state = NodeState::of(workload);
            inner.replicas = workload.replicas.max(1);
            inner.instances.insert(workload.id.clone(), workload.clone());
        }
        Ok(node)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Last known lifecycle state
    pub fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    /// Cached instances keyed by workload id
    pub fn instances(&self) -> HashMap<String, Workload> {
        self.inner.lock().instances.clone()
    }

    pub fn to_descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            name: self.name.clone(),
            image: self.image.clone(),
            env: self.env.clone(),
            network: self.network.clone(),
            tags: self.tags.clone(),
        }
    }

    fn ensure_live(&self, action: &str) -> Result<()> {
        let state = self.state();
        if state == NodeState::Removed {
            return Err(Error::InvalidStateTransition {
                from: state.to_string(),
                to: action.to_string(),
            });
        }
        Ok(())
    }

    /// `Removed` is terminal and is never overwritten
    fn set_state(&self, state: NodeState) {
        let mut inner = self.inner.lock();
        if inner.state != state && inner.state != NodeState::Removed {
            debug!("Node {}: {} -> {}", self.name, inner.state, state);
            inner.state = state;
        }
    }

    /// Cache `workload`; returns false if the node was removed meanwhile
    fn remember(&self, workload: &Workload) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == NodeState::Removed {
            return false;
        }
        inner.state = NodeState::of(workload);
        inner.instances.insert(workload.id.clone(), workload.clone());
        true
    }

    /// Build and tag the node's image, then prune dangling images
    ///
    /// Returns the number of dangling images removed.
    pub async fn build(&self, context: &Path) -> Result<usize> {
        self.ensure_live("build")?;
        info!("Building image {} from {}", self.image, context.display());
        self.runtime
            .build_image(context, &self.image)
            .await
            .map_err(|e| Error::Provisioning(format!("build of {} failed: {}", self.image, e)))?;

        let pruned = self.runtime.prune_images().await?;
        if pruned > 0 {
            info!("Pruned {} dangling image(s) after building {}", pruned, self.image);
        }
        Ok(pruned)
    }

    fn workload_spec(&self, opts: &CreateOptions) -> Result<WorkloadSpec> {
        if opts.replicas == 0 {
            return Err(Error::Validation("replicas must be at least 1".to_string()));
        }
        validate_env(&opts.env)?;

        let ports = opts
            .ports
            .iter()
            .map(|(published, target)| PortMapping::new(*published, *target))
            .collect::<Result<Vec<_>>>()?;

        let mut env = self.env.clone();
        env.extend(opts.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut labels = BTreeMap::new();
        if !self.tags.is_empty() {
            labels.insert(
                TAGS_LABEL.to_string(),
                self.tags.iter().cloned().collect::<Vec<_>>().join(","),
            );
        }

        Ok(WorkloadSpec {
            name: self.name.clone(),
            image: self.image.clone(),
            env,
            network: self.network.clone(),
            ports,
            replicas: opts.replicas,
            labels,
        })
    }

    /// Provision the backing workload
    ///
    /// A workload that already exists under this name is adopted and
    /// returned as-is.
    pub async fn create(&self, opts: &CreateOptions) -> Result<Workload> {
        self.ensure_live("create")?;
        let spec = self.workload_spec(opts)?;

        let workload = match self.runtime.create_workload(&spec).await {
            Ok(workload) => {
                info!("Created workload {} ({})", workload.name, workload.id);
                workload
            }
            Err(RuntimeError::AlreadyExists { .. }) => {
                info!("Workload {} already exists, adopting it", self.name);
                self.runtime
                    .get_workload(&self.name)
                    .await
                    .map_err(|e| Error::Provisioning(e.to_string()))?
            }
            Err(e) => {
                return Err(Error::Provisioning(format!(
                    "create of {} failed: {}",
                    self.name, e
                )))
            }
        };

        if !self.remember(&workload) {
            warn!("Node {} was removed while provisioning", self.name);
            return Err(Error::InvalidStateTransition {
                from: NodeState::Removed.to_string(),
                to: "create".to_string(),
            });
        }
        self.inner.lock().replicas = opts.replicas;
        Ok(workload)
    }

    pub async fn start(&self) -> Result<()> {
        self.ensure_live("start")?;
        let replicas = self.inner.lock().replicas;
        self.runtime.start_workload(&self.name, replicas).await?;
        self.set_state(NodeState::Running);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.ensure_live("stop")?;
        self.runtime.stop_workload(&self.name).await?;
        self.set_state(NodeState::Stopped);
        Ok(())
    }

    /// Current state of the backing workload, read from the runtime
    ///
    /// A removed node reports `Removed` without consulting the runtime; a
    /// workload of the same name belongs to some other node.
    pub async fn status(&self) -> Result<NodeState> {
        if self.state() == NodeState::Removed {
            return Ok(NodeState::Removed);
        }
        let workload = self.runtime.get_workload(&self.name).await?;
        if !self.remember(&workload) {
            return Ok(NodeState::Removed);
        }
        Ok(NodeState::of(&workload))
    }

    /// Deprovision the backing workload; absent is not an error
    pub async fn remove(&self) -> Result<()> {
        match self.runtime.remove_workload(&self.name).await {
            Ok(()) => info!("Removed workload {}", self.name),
            Err(RuntimeError::NotFound { .. }) => {
                debug!("Workload {} already absent", self.name)
            }
            Err(e) => {
                warn!("Failed to remove workload {}: {}", self.name, e);
                return Err(e.into());
            }
        }

        let mut inner = self.inner.lock();
        inner.instances.clear();
        inner.state = NodeState::Removed;
        Ok(())
    }

    pub async fn log(&self, tail: Option<usize>) -> Result<String> {
        Ok(self.runtime.workload_logs(&self.name, tail).await?)
    }

    /// Refresh the cache from a workload seen during reconciliation
    pub fn observe(&self, workload: &Workload) {
        let mut inner = self.inner.lock();
        if inner.state == NodeState::Removed {
            return;
        }
        inner.instances.retain(|id, _| *id == workload.id);
        inner.state = NodeState::of(workload);
        inner.instances.insert(workload.id.clone(), workload.clone());
    }

    /// Forget cached instances whose backing workload has vanished
    pub fn mark_absent(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.instances.is_empty() && inner.state == NodeState::Unbound {
            return false;
        }
        inner.instances.clear();
        if inner.state != NodeState::Removed {
            inner.state = NodeState::Unbound;
        }
        true
    }
}

impl Taggable for Node {
    fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("network", &self.network)
            .field("tags", &self.tags)
            .field("state", &self.state())
            .finish()
    }
}

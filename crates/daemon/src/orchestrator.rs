//! Node orchestration
//!
//! The [`Orchestrator`] owns the runtime handle and a [`NodeRegistry`]. Every
//! registry mutation is a short critical section; slow runtime calls happen
//! with no registry lock held.

use crate::node::{workload_tags, CreateOptions, Node, NodeDescriptor, NodeState};
use crate::runtime::ContainerRuntime;
use fleet_common::{Error, Registry, Result, Taggable, TeardownFailure};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry of nodes that tears down a node's workload before forgetting it
pub struct NodeRegistry {
    nodes: Registry<Arc<Node>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: Registry::new("node"),
        }
    }

    pub fn register(&self, node: Arc<Node>) {
        self.nodes.register(&node.name().to_string(), node);
    }

    /// Register under a name that must not be taken yet
    pub fn claim(&self, node: Arc<Node>) -> Result<()> {
        self.nodes.insert_new(&node.name().to_string(), node)
    }

    /// Drop bookkeeping for `node` only, without touching its workload
    pub fn release(&self, node: &Arc<Node>) -> bool {
        self.nodes
            .remove_if(node.name(), |current| Arc::ptr_eq(current, node))
            .is_some()
    }

    pub fn get(&self, name: &str) -> Result<Arc<Node>> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains(name)
    }

    pub fn find(&self, tag: &str) -> BTreeSet<String> {
        self.nodes.find(tag)
    }

    pub fn find_all<S: AsRef<str>>(&self, tags: &[S]) -> Result<BTreeSet<String>> {
        self.nodes.find_all(tags)
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.names()
    }

    pub fn values(&self) -> Vec<Arc<Node>> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True if a tag set still references `name`
    pub fn indexed(&self, name: &str) -> bool {
        self.nodes.indexed(name)
    }

    /// Tear down the node's workload, then drop its bookkeeping
    ///
    /// If teardown fails the registry is left untouched, so the call can be
    /// retried.
    pub async fn remove(&self, name: &str) -> Result<Arc<Node>> {
        let node = self.nodes.get(name)?;
        node.remove().await?;

        // A node registered under the same name meanwhile is kept
        if self.release(&node) {
            info!("Removed node {}", name);
        } else {
            debug!("Node {} was replaced during teardown", name);
        }
        Ok(node)
    }

    /// Remove every node, continuing past failures
    ///
    /// Runs at most `concurrency` teardowns at once and returns how many
    /// nodes were removed, or every failure collected.
    pub async fn clear(&self, concurrency: usize) -> Result<usize> {
        let names = self.names();
        let results: Vec<(String, Result<Arc<Node>>)> = stream::iter(names)
            .map(|name| async move {
                let result = self.remove(&name).await;
                (name, result)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut removed = 0;
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(_) => removed += 1,
                // Removed concurrently by someone else
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!("Teardown of node {} failed: {}", name, e);
                    failures.push(TeardownFailure {
                        name,
                        message: e.to_string(),
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(removed)
        } else {
            failures.sort_by(|a, b| a.name.cmp(&b.name));
            Err(Error::BulkTeardown(failures))
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Network for nodes that do not name one
    pub default_network: String,

    /// Maximum concurrent teardowns during `clean`
    pub teardown_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_network: fleet_common::DEFAULT_NETWORK.to_string(),
            teardown_concurrency: 4,
        }
    }
}

/// Outcome of [`Orchestrator::load`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Nodes rebuilt from live workloads
    pub loaded: Vec<String>,
    /// Workloads that could not be reconstructed, with the reason
    pub skipped: Vec<(String, String)>,
    /// Registered nodes whose workload no longer exists
    pub stale: Vec<String>,
}

/// Lifecycle manager for a fleet of nodes
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    nodes: NodeRegistry,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: OrchestratorConfig) -> Self {
        Self {
            runtime,
            nodes: NodeRegistry::new(),
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.nodes
    }

    /// Construct and register a node; the name must be free
    pub fn new_node(&self, mut descriptor: NodeDescriptor) -> Result<Arc<Node>> {
        if descriptor.network.trim().is_empty() {
            descriptor.network = self.config.default_network.clone();
        }
        let node = Arc::new(Node::new(self.runtime.clone(), descriptor)?);
        self.nodes.claim(node.clone())?;
        info!("Registered node {} ({})", node.name(), node.image());
        Ok(node)
    }

    /// Register an existing node, replacing any node of the same name
    pub fn add(&self, node: Arc<Node>) -> Arc<Node> {
        self.nodes.register(node.clone());
        node
    }

    /// Claim a name and provision its workload
    ///
    /// The claim is released again if provisioning fails.
    pub async fn deploy(
        &self,
        descriptor: NodeDescriptor,
        opts: &CreateOptions,
    ) -> Result<Arc<Node>> {
        let node = self.new_node(descriptor)?;
        match node.create(opts).await {
            Ok(_) => Ok(node),
            Err(e) => {
                warn!("Provisioning node {} failed, releasing name: {}", node.name(), e);
                self.nodes.release(&node);
                Err(e)
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<Node>> {
        self.nodes.get(name)
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.nodes.remove(name).await.map(|_| ())
    }

    pub fn find(&self, tag: &str) -> BTreeSet<String> {
        self.nodes.find(tag)
    }

    pub fn find_all<S: AsRef<str>>(&self, tags: &[S]) -> Result<BTreeSet<String>> {
        self.nodes.find_all(tags)
    }

    /// Registered node names, sorted
    pub fn nodes(&self) -> Vec<String> {
        self.nodes.names()
    }

    /// Rebuild bookkeeping from the workloads the runtime reports
    pub async fn load(&self) -> Result<LoadReport> {
        let workloads = self.runtime.list_workloads().await?;
        let mut report = LoadReport::default();
        let mut live = HashSet::new();

        for workload in &workloads {
            live.insert(workload.name.clone());

            // Same image and tags already registered: refresh its cache in place.
            // Env and network are not compared; the runtime reports merged env
            // and resolved network ids.
            if let Ok(existing) = self.nodes.get(&workload.name) {
                if existing.state() != NodeState::Removed
                    && existing.image() == workload.image
                    && existing.tags() == &workload_tags(workload)
                {
                    existing.observe(workload);
                    report.loaded.push(workload.name.clone());
                    continue;
                }
            }

            match Node::from_workload(self.runtime.clone(), workload) {
                Ok(node) => {
                    self.nodes.register(Arc::new(node));
                    report.loaded.push(workload.name.clone());
                }
                Err(e) => {
                    warn!("Skipping workload {}: {}", workload.name, e);
                    report.skipped.push((workload.name.clone(), e.to_string()));
                }
            }
        }

        for node in self.nodes.values() {
            if !live.contains(node.name()) && node.mark_absent() {
                warn!("Workload for node {} is gone", node.name());
                report.stale.push(node.name().to_string());
            }
        }

        info!(
            "Loaded {} node(s), skipped {}, stale {}",
            report.loaded.len(),
            report.skipped.len(),
            report.stale.len()
        );
        Ok(report)
    }

    /// Tear down every registered node
    pub async fn clean(&self) -> Result<usize> {
        let removed = self.nodes.clear(self.config.teardown_concurrency).await?;
        info!("Cleaned {} node(s)", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MemoryRuntime, Operation, Workload};
    use std::collections::BTreeMap;

    fn orchestrator() -> (Arc<MemoryRuntime>, Orchestrator) {
        let rt = Arc::new(MemoryRuntime::new());
        let orch = Orchestrator::new(rt.clone(), OrchestratorConfig::default());
        (rt, orch)
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn live(name: &str, tags: &str) -> Workload {
        Workload {
            id: format!("ext-{}", name),
            name: name.to_string(),
            image: "img:1".to_string(),
            env: vec!["A=1".to_string()],
            networks: vec!["bridge".to_string()],
            labels: BTreeMap::from([(fleet_common::TAGS_LABEL.to_string(), tags.to_string())]),
            ports: Vec::new(),
            replicas: 1,
            running: 1,
        }
    }

    #[tokio::test]
    async fn test_register_find_remove_scenario() {
        let (_rt, orch) = orchestrator();
        orch.new_node(NodeDescriptor::new("svc-a", "img:1").with_tags(["batch"]))
            .unwrap();
        assert_eq!(orch.find_all(&["batch"]).unwrap(), set(&["svc-a"]));

        orch.remove("svc-a").await.unwrap();
        assert!(orch.find_all(&["batch"]).unwrap().is_empty());
        assert!(orch.get("svc-a").unwrap_err().is_not_found());
        assert!(!orch.registry().indexed("svc-a"));
    }

    #[tokio::test]
    async fn test_new_node_rejects_duplicate_name() {
        let (_rt, orch) = orchestrator();
        orch.new_node(NodeDescriptor::new("svc-a", "img:1")).unwrap();
        let err = orch
            .new_node(NodeDescriptor::new("svc-a", "img:2"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName { .. }));
        assert_eq!(orch.get("svc-a").unwrap().image(), "img:1");
    }

    #[tokio::test]
    async fn test_new_node_fills_default_network() {
        let (_rt, orch) = orchestrator();
        let node = orch
            .new_node(NodeDescriptor::new("svc-a", "img:1").with_network(""))
            .unwrap();
        assert_eq!(node.network(), "bridge");
    }

    #[tokio::test]
    async fn test_find_all_empty_is_invalid_query() {
        let (_rt, orch) = orchestrator();
        let empty: [&str; 0] = [];
        assert!(matches!(orch.find_all(&empty), Err(Error::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn test_remove_failure_leaves_bookkeeping_intact() {
        let (rt, orch) = orchestrator();
        orch.deploy(
            NodeDescriptor::new("svc-a", "img:1").with_tags(["batch"]),
            &CreateOptions::default(),
        )
        .await
        .unwrap();

        rt.fail_on(Operation::Remove, "svc-a", "device busy");
        assert!(orch.remove("svc-a").await.is_err());
        assert!(orch.get("svc-a").is_ok());
        assert_eq!(orch.find("batch"), set(&["svc-a"]));

        rt.clear_failures();
        orch.remove("svc-a").await.unwrap();
        assert!(orch.nodes().is_empty());
        assert!(!rt.has_workload("svc-a"));
    }

    #[tokio::test]
    async fn test_deploy_rolls_back_claim_on_failure() {
        let (rt, orch) = orchestrator();
        rt.fail_on(Operation::Create, "svc-a", "pull access denied");

        let err = orch
            .deploy(
                NodeDescriptor::new("svc-a", "img:1").with_tags(["batch"]),
                &CreateOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provisioning(_)));
        assert!(!orch.registry().contains("svc-a"));
        assert!(orch.find("batch").is_empty());

        rt.clear_failures();
        let node = orch
            .deploy(NodeDescriptor::new("svc-a", "img:1"), &CreateOptions::default())
            .await
            .unwrap();
        assert_eq!(node.state(), NodeState::Running);
    }

    #[tokio::test]
    async fn test_load_reconstructs_from_runtime() {
        let (rt, orch) = orchestrator();
        rt.insert_workload(live("feed", "feeds,live"));
        rt.insert_workload(live("strat", "strategies"));
        let mut broken = live("broken", "");
        broken.env = vec!["garbage".to_string()];
        rt.insert_workload(broken);

        let report = orch.load().await.unwrap();
        assert_eq!(report.loaded, vec!["feed".to_string(), "strat".to_string()]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "broken");

        assert_eq!(orch.nodes(), vec!["feed".to_string(), "strat".to_string()]);
        assert_eq!(orch.find_all(&["feeds", "live"]).unwrap(), set(&["feed"]));
        assert_eq!(orch.get("feed").unwrap().env()["A"], "1");
    }

    #[tokio::test]
    async fn test_load_marks_vanished_workloads_stale() {
        let (rt, orch) = orchestrator();
        orch.deploy(NodeDescriptor::new("svc-a", "img:1"), &CreateOptions::default())
            .await
            .unwrap();
        rt.drop_workload("svc-a");

        let report = orch.load().await.unwrap();
        assert_eq!(report.stale, vec!["svc-a".to_string()]);
        let node = orch.get("svc-a").unwrap();
        assert!(node.instances().is_empty());
        assert_eq!(node.state(), NodeState::Unbound);

        // Already reconciled
        let report = orch.load().await.unwrap();
        assert!(report.stale.is_empty());
    }

    #[tokio::test]
    async fn test_load_keeps_existing_node_identity() {
        let (_rt, orch) = orchestrator();
        let node = orch
            .deploy(
                NodeDescriptor::new("svc-a", "img:1").with_tags(["batch"]),
                &CreateOptions::default(),
            )
            .await
            .unwrap();

        orch.load().await.unwrap();
        assert!(Arc::ptr_eq(&node, &orch.get("svc-a").unwrap()));
        assert_eq!(orch.find("batch"), set(&["svc-a"]));
    }

    #[tokio::test]
    async fn test_load_keeps_node_deployed_with_env_overrides() {
        let (rt, orch) = orchestrator();
        let opts = CreateOptions {
            env: BTreeMap::from([("MODE".to_string(), "live".to_string())]),
            ..Default::default()
        };
        let node = orch
            .deploy(
                NodeDescriptor::new("svc-a", "img:1").with_env([("MODE", "paper")]),
                &opts,
            )
            .await
            .unwrap();

        // The runtime reports resolved network ids rather than names
        let mut workload = rt.get_workload("svc-a").await.unwrap();
        workload.networks = vec!["q1w2e3r4t5".to_string()];
        rt.insert_workload(workload);

        for _ in 0..2 {
            let report = orch.load().await.unwrap();
            assert_eq!(report.loaded, vec!["svc-a".to_string()]);
        }
        let current = orch.get("svc-a").unwrap();
        assert!(Arc::ptr_eq(&node, &current));
        assert_eq!(current.env()["MODE"], "paper");
        assert_eq!(current.network(), "bridge");
        assert_eq!(current.instances().len(), 1);
    }

    #[tokio::test]
    async fn test_load_replaces_node_when_image_changes() {
        let (rt, orch) = orchestrator();
        let node = orch
            .deploy(NodeDescriptor::new("svc-a", "img:1"), &CreateOptions::default())
            .await
            .unwrap();

        let mut workload = rt.get_workload("svc-a").await.unwrap();
        workload.image = "img:2".to_string();
        rt.insert_workload(workload);

        orch.load().await.unwrap();
        let current = orch.get("svc-a").unwrap();
        assert!(!Arc::ptr_eq(&node, &current));
        assert_eq!(current.image(), "img:2");
    }

    #[tokio::test]
    async fn test_clean_collects_failures_and_continues() {
        let (rt, orch) = orchestrator();
        for name in ["a", "b", "c", "d"] {
            orch.deploy(NodeDescriptor::new(name, "img:1"), &CreateOptions::default())
                .await
                .unwrap();
        }
        rt.fail_on(Operation::Remove, "b", "device busy");
        rt.fail_on(Operation::Remove, "d", "timeout");

        let err = orch.clean().await.unwrap_err();
        match err {
            Error::BulkTeardown(failures) => {
                let names: Vec<&str> = failures.iter().map(|f| f.name.as_str()).collect();
                assert_eq!(names, vec!["b", "d"]);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(orch.nodes(), vec!["b".to_string(), "d".to_string()]);
        assert!(!rt.has_workload("a"));
        assert!(!rt.has_workload("c"));

        rt.clear_failures();
        assert_eq!(orch.clean().await.unwrap(), 2);
        assert!(orch.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_clean_removes_unprovisioned_nodes() {
        let (_rt, orch) = orchestrator();
        orch.new_node(NodeDescriptor::new("idle", "img:1")).unwrap();
        assert_eq!(orch.clean().await.unwrap(), 1);
        assert!(orch.nodes().is_empty());
    }
}

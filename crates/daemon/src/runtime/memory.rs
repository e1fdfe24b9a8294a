//! In-memory container runtime
//!
//! Keeps workloads and images in process. Failures can be injected per
//! operation and name, and workloads can be added or dropped behind the
//! orchestrator's back to simulate external changes.

use super::{
    ContainerRuntime, ImageFilter, ImageSummary, RuntimeError, RuntimeResult, Workload,
    WorkloadSpec,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Runtime operation that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Build,
    Create,
    Start,
    Stop,
    Remove,
}

#[derive(Default)]
struct MemoryState {
    workloads: BTreeMap<String, Workload>,
    images: BTreeMap<String, ImageSummary>,
    failures: HashMap<(Operation, String), String>,
    next_id: u64,
    create_calls: usize,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn injected(&self, op: Operation, name: &str) -> RuntimeResult<()> {
        match self.failures.get(&(op, name.to_string())) {
            Some(msg) => Err(RuntimeError::Failed(msg.clone())),
            None => Ok(()),
        }
    }

    fn workload_mut(&mut self, name: &str) -> RuntimeResult<&mut Workload> {
        self.workloads.get_mut(name).ok_or_else(|| RuntimeError::NotFound {
            kind: "workload",
            name: name.to_string(),
        })
    }
}

/// Container runtime held entirely in memory
#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` on `name` fail with `message` until cleared
    pub fn fail_on(&self, op: Operation, name: &str, message: &str) {
        self.state
            .lock()
            .failures
            .insert((op, name.to_string()), message.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Add a workload as if it had been started outside the orchestrator
    pub fn insert_workload(&self, workload: Workload) {
        self.state
            .lock()
            .workloads
            .insert(workload.name.clone(), workload);
    }

    /// Drop a workload as if it had been terminated externally
    pub fn drop_workload(&self, name: &str) -> Option<Workload> {
        self.state.lock().workloads.remove(name)
    }

    pub fn has_workload(&self, name: &str) -> bool {
        self.state.lock().workloads.contains_key(name)
    }

    pub fn workload_count(&self) -> usize {
        self.state.lock().workloads.len()
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    /// Number of `create_workload` calls, successful or not
    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn build_image(&self, _context: &Path, tag: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.injected(Operation::Build, tag)?;

        let (repository, image_tag) = tag.split_once(':').unwrap_or((tag, "latest"));
        let id = state.next_id("sha256");
        state.images.insert(
            id.clone(),
            ImageSummary {
                id,
                repository: repository.to_string(),
                tag: image_tag.to_string(),
            },
        );

        // Every build leaves an intermediate layer behind
        let intermediate = state.next_id("sha256");
        state.images.insert(
            intermediate.clone(),
            ImageSummary {
                id: intermediate,
                repository: "<none>".to_string(),
                tag: "<none>".to_string(),
            },
        );
        Ok(())
    }

    async fn list_images(&self, filter: &ImageFilter) -> RuntimeResult<Vec<ImageSummary>> {
        let state = self.state.lock();
        Ok(state
            .images
            .values()
            .filter(|img| filter.dangling.map_or(true, |d| img.is_dangling() == d))
            .filter(|img| {
                filter.reference.as_ref().map_or(true, |r| {
                    *r == img.repository || *r == format!("{}:{}", img.repository, img.tag)
                })
            })
            .cloned()
            .collect())
    }

    async fn remove_image(&self, id: &str) -> RuntimeResult<()> {
        self.state
            .lock()
            .images
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound {
                kind: "image",
                name: id.to_string(),
            })
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> RuntimeResult<Workload> {
        let mut state = self.state.lock();
        state.create_calls += 1;
        state.injected(Operation::Create, &spec.name)?;

        if state.workloads.contains_key(&spec.name) {
            return Err(RuntimeError::AlreadyExists {
                kind: "workload",
                name: spec.name.clone(),
            });
        }

        let workload = Workload {
            id: state.next_id("wl"),
            name: spec.name.clone(),
            image: spec.image.clone(),
            env: spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
            networks: vec![spec.network.clone()],
            labels: spec.labels.clone(),
            ports: spec.ports.clone(),
            replicas: spec.replicas,
            running: spec.replicas,
        };
        state.workloads.insert(spec.name.clone(), workload.clone());
        Ok(workload)
    }

    async fn start_workload(&self, name: &str, replicas: u32) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.injected(Operation::Start, name)?;
        let workload = state.workload_mut(name)?;
        workload.replicas = replicas;
        workload.running = replicas;
        Ok(())
    }

    async fn stop_workload(&self, name: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.injected(Operation::Stop, name)?;
        let workload = state.workload_mut(name)?;
        workload.replicas = 0;
        workload.running = 0;
        Ok(())
    }

    async fn remove_workload(&self, name: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.injected(Operation::Remove, name)?;
        state
            .workloads
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound {
                kind: "workload",
                name: name.to_string(),
            })
    }

    async fn get_workload(&self, name: &str) -> RuntimeResult<Workload> {
        let mut state = self.state.lock();
        state.workload_mut(name).map(|w| w.clone())
    }

    async fn list_workloads(&self) -> RuntimeResult<Vec<Workload>> {
        Ok(self.state.lock().workloads.values().cloned().collect())
    }

    async fn workload_logs(&self, name: &str, tail: Option<usize>) -> RuntimeResult<String> {
        let mut state = self.state.lock();
        let workload = state.workload_mut(name)?;
        let lines: Vec<String> = (1..=workload.running)
            .map(|replica| format!("{}.{} | running {}", workload.name, replica, workload.image))
            .collect();
        let skip = tail.map_or(0, |t| lines.len().saturating_sub(t));
        Ok(lines[skip..].join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> WorkloadSpec {
        WorkloadSpec {
            name: name.to_string(),
            image: "img:1".to_string(),
            env: BTreeMap::new(),
            network: "bridge".to_string(),
            ports: Vec::new(),
            replicas: 1,
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_twice_reports_already_exists() {
        let rt = MemoryRuntime::new();
        rt.create_workload(&spec("svc")).await.unwrap();
        let err = rt.create_workload(&spec("svc")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyExists { .. }));
        assert_eq!(rt.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_prune_removes_only_dangling() {
        let rt = MemoryRuntime::new();
        rt.build_image(Path::new("."), "img:1").await.unwrap();
        assert_eq!(rt.image_count(), 2);

        let removed = rt.prune_images().await.unwrap();
        assert_eq!(removed, 1);
        let left = rt.list_images(&ImageFilter::default()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].repository, "img");
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let rt = MemoryRuntime::new();
        rt.create_workload(&spec("svc")).await.unwrap();
        rt.fail_on(Operation::Remove, "svc", "device busy");
        assert!(rt.remove_workload("svc").await.is_err());
        assert!(rt.has_workload("svc"));

        rt.clear_failures();
        rt.remove_workload("svc").await.unwrap();
        assert!(!rt.has_workload("svc"));
    }
}

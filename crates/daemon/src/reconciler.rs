//! Reconciliation loop
//!
//! Periodically rebuilds orchestrator bookkeeping from what the runtime
//! reports, so externally started or terminated workloads are picked up.

use crate::orchestrator::{LoadReport, Orchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Reconciler that keeps the registry in line with the runtime
pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run until `cancel` fires
    ///
    /// A failed pass is logged and retried on the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Reconciler started, interval {:?}", self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            if let Err(e) = self.reconcile_once().await {
                error!("Reconciliation error: {}", e);
            }
        }

        info!("Reconciler stopped");
    }

    /// Single reconciliation pass
    pub async fn reconcile_once(&self) -> fleet_common::Result<LoadReport> {
        let report = self.orchestrator.load().await?;
        for (name, reason) in &report.skipped {
            debug!("Workload {} not adopted: {}", name, reason);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeDescriptor, NodeState};
    use crate::orchestrator::OrchestratorConfig;
    use crate::runtime::{MemoryRuntime, Workload};
    use std::collections::BTreeMap;

    fn external(name: &str) -> Workload {
        Workload {
            id: format!("ext-{}", name),
            name: name.to_string(),
            image: "img:1".to_string(),
            env: Vec::new(),
            networks: vec!["bridge".to_string()],
            labels: BTreeMap::new(),
            ports: Vec::new(),
            replicas: 1,
            running: 1,
        }
    }

    #[tokio::test]
    async fn test_pass_adopts_and_marks_stale() {
        let rt = Arc::new(MemoryRuntime::new());
        let orch = Arc::new(Orchestrator::new(rt.clone(), OrchestratorConfig::default()));
        let node = orch
            .deploy(NodeDescriptor::new("ours", "img:1"), &Default::default())
            .await
            .unwrap();
        rt.insert_workload(external("theirs"));
        rt.drop_workload("ours");

        let reconciler = Reconciler::new(orch.clone(), Duration::from_secs(60));
        let report = reconciler.reconcile_once().await.unwrap();

        assert_eq!(report.loaded, vec!["theirs".to_string()]);
        assert_eq!(report.stale, vec!["ours".to_string()]);
        assert!(orch.get("theirs").is_ok());
        assert_eq!(node.state(), NodeState::Unbound);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let rt = Arc::new(MemoryRuntime::new());
        let orch = Arc::new(Orchestrator::new(rt.clone(), OrchestratorConfig::default()));
        rt.insert_workload(external("late"));

        let reconciler = Reconciler::new(orch.clone(), Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { reconciler.run(cancel).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while orch.get("late").is_err() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

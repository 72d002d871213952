//! Pool-level sequencing: serial masters, bounded-parallel agents.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::node::{NodeState, NodeUpgrader};
use super::topology::{DiscoveredNode, PoolRole};
use crate::error::UpgradeError;

/// Default number of agent nodes replaced at once.
pub const DEFAULT_AGENT_PARALLELISM: usize = 3;

struct WorkerOutcome {
    index: usize,
    node: DiscoveredNode,
    error: Option<UpgradeError>,
}

pub struct PoolUpgrader {
    upgrader: NodeUpgrader,
    max_parallel: usize,
}

impl PoolUpgrader {
    pub fn new(upgrader: NodeUpgrader, max_parallel: usize) -> Self {
        Self {
            upgrader,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Upgrade every node of one pool, returning the first failure.
    pub async fn upgrade_pool(
        &self,
        nodes: &mut Vec<DiscoveredNode>,
        role: &PoolRole,
    ) -> Result<(), UpgradeError> {
        let pending = nodes.iter().filter(|n| !n.state.is_terminal()).count();
        if pending == 0 {
            info!(pool = %role, "All nodes already at target version");
            return Ok(());
        }

        if role.is_master() {
            info!(pool = %role, nodes = pending, "Upgrading master pool one node at a time");
            self.upgrade_serial(nodes).await
        } else {
            info!(
                pool = %role,
                nodes = pending,
                max_parallel = self.max_parallel,
                "Upgrading agent pool"
            );
            self.upgrade_parallel(nodes).await
        }
    }

    /// Discovery order, stopping at the first failure.
    async fn upgrade_serial(&self, nodes: &mut [DiscoveredNode]) -> Result<(), UpgradeError> {
        for node in nodes.iter_mut() {
            self.upgrader.upgrade(node).await?;
        }
        Ok(())
    }

    /// Each worker owns one node and hands it back when done. After the
    /// first failure no new node is started; running workers finish.
    async fn upgrade_parallel(&self, nodes: &mut Vec<DiscoveredNode>) -> Result<(), UpgradeError> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let abort = Arc::new(AtomicBool::new(false));
        let total = nodes.len();

        let mut slots: Vec<Option<DiscoveredNode>> = (0..total).map(|_| None).collect();
        let mut snapshots: Vec<Option<DiscoveredNode>> = (0..total).map(|_| None).collect();
        let mut workers = JoinSet::new();
        let mut task_index = HashMap::new();

        for (index, node) in std::mem::take(nodes).into_iter().enumerate() {
            if node.state.is_terminal() {
                slots[index] = Some(node);
                continue;
            }
            snapshots[index] = Some(node.clone());

            let upgrader = self.upgrader.clone();
            let semaphore = Arc::clone(&semaphore);
            let abort = Arc::clone(&abort);
            let handle = workers.spawn(async move {
                let mut node = node;
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return WorkerOutcome {
                        index,
                        node,
                        error: None,
                    };
                };
                if abort.load(Ordering::SeqCst) {
                    return WorkerOutcome {
                        index,
                        node,
                        error: None,
                    };
                }

                let error = upgrader.upgrade(&mut node).await.err();
                if error.is_some() {
                    abort.store(true, Ordering::SeqCst);
                }
                WorkerOutcome { index, node, error }
            });
            task_index.insert(handle.id(), index);
        }

        let mut first_error = None;
        let mut join_failures = HashMap::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => {
                    slots[outcome.index] = Some(outcome.node);
                    if let Some(err) = outcome.error {
                        record_failure(&mut first_error, err);
                    }
                }
                Err(err) => {
                    abort.store(true, Ordering::SeqCst);
                    if let Some(&index) = task_index.get(&err.id()) {
                        join_failures.insert(index, err.to_string());
                    }
                }
            }
        }

        // Workers that panicked never returned their node.
        for (index, (slot, snapshot)) in slots.iter_mut().zip(snapshots).enumerate() {
            if slot.is_some() {
                continue;
            }
            let Some(mut node) = snapshot else { continue };
            let message = join_failures
                .remove(&index)
                .unwrap_or_else(|| "worker did not return".to_string());
            node.state = NodeState::Failed;
            node.failure = Some(message.clone());
            record_failure(
                &mut first_error,
                UpgradeError::Worker {
                    node: node.name.clone(),
                    message,
                },
            );
            *slot = Some(node);
        }

        *nodes = slots.into_iter().flatten().collect();
        first_error.map_or(Ok(()), Err)
    }
}

fn record_failure(first: &mut Option<UpgradeError>, err: UpgradeError) {
    if first.is_none() {
        *first = Some(err);
    } else {
        warn!(node = err.node().unwrap_or("unknown"), error = %err, "Additional node failure in pool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ContainerService;
    use crate::arm::{MockArmClient, Operation};
    use crate::upgrade::hook::{HookError, NodeHook, NoopHook};
    use crate::upgrade::node::UpgradeContext;
    use crate::upgrade::request::UpgradeRequest;
    use crate::upgrade::topology::ClassificationSource;
    use async_trait::async_trait;
    use std::time::Duration;
    use uuid::Uuid;

    fn agents(count: usize) -> Vec<DiscoveredNode> {
        (0..count)
            .map(|i| {
                DiscoveredNode::new(
                    format!("k8s-agentpool1-12345678-{i}"),
                    "",
                    PoolRole::Agent("agentpool1".to_string()),
                    ClassificationSource::Tags,
                    i,
                )
            })
            .collect()
    }

    fn pool_upgrader(
        client: Arc<MockArmClient>,
        hook: Arc<dyn NodeHook>,
        max_parallel: usize,
    ) -> PoolUpgrader {
        let request = UpgradeRequest::new(
            Uuid::nil(),
            "rg",
            ContainerService::mock("c", "1.7.16", 1, 5, false),
            "12345678",
            ["agentpool1"],
            "0.1.0",
        );
        let upgrader = NodeUpgrader::new(client, hook, Arc::new(UpgradeContext::from(&request)));
        PoolUpgrader::new(upgrader, max_parallel)
    }

    fn agent_role() -> PoolRole {
        PoolRole::Agent("agentpool1".to_string())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_respects_bound() {
        let mut mock = MockArmClient::with_cluster(1, &[("agentpool1", 8)]);
        mock.deploy_delay = Some(Duration::from_millis(30));
        let client = Arc::new(mock);
        let mut nodes = agents(8);

        pool_upgrader(client.clone(), Arc::new(NoopHook), 3)
            .upgrade_pool(&mut nodes, &agent_role())
            .await
            .unwrap();

        assert!(nodes.iter().all(DiscoveredNode::is_upgraded));
        assert!(client.peak_deploys_in_flight() <= 3);
        assert!(client.peak_deploys_in_flight() >= 1);
        let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names[0], "k8s-agentpool1-12345678-0");
        assert_eq!(names[7], "k8s-agentpool1-12345678-7");
    }

    #[tokio::test]
    async fn test_parallel_first_failure_wins() {
        let mut mock = MockArmClient::with_cluster(1, &[("agentpool1", 5)]);
        mock.fail_delete_virtual_machine = true;
        let client = Arc::new(mock);
        let mut nodes = agents(5);

        let err = pool_upgrader(client.clone(), Arc::new(NoopHook), 2)
            .upgrade_pool(&mut nodes, &agent_role())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "DeleteVirtualMachine failed");
        assert_eq!(nodes.len(), 5);
        assert!(nodes.iter().any(|n| n.state == NodeState::Failed));
        assert!(!nodes.iter().any(DiscoveredNode::is_upgraded));
        assert!(client.calls_for(Operation::DeployTemplate).is_empty());
    }

    #[tokio::test]
    async fn test_serial_master_order_and_abort() {
        let mut mock = MockArmClient::with_cluster(3, &[]);
        mock.fail_deploy_template = true;
        let client = Arc::new(mock);
        let mut masters: Vec<DiscoveredNode> = (0..3)
            .map(|i| {
                DiscoveredNode::new(
                    format!("k8s-master-12345678-{i}"),
                    "",
                    PoolRole::Master,
                    ClassificationSource::Tags,
                    i,
                )
            })
            .collect();

        let err = pool_upgrader(client.clone(), Arc::new(NoopHook), 3)
            .upgrade_pool(&mut masters, &PoolRole::Master)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "DeployTemplate failed");
        assert_eq!(masters[0].state, NodeState::Failed);
        assert_eq!(masters[1].state, NodeState::Pending);
        assert_eq!(
            client.calls_for(Operation::DeleteVirtualMachine),
            vec!["k8s-master-12345678-0"]
        );
    }

    #[tokio::test]
    async fn test_skips_upgraded_nodes() {
        let client = Arc::new(MockArmClient::with_cluster(1, &[("agentpool1", 2)]));
        let mut nodes = agents(2);
        nodes[0].state = NodeState::Upgraded;

        pool_upgrader(client.clone(), Arc::new(NoopHook), 3)
            .upgrade_pool(&mut nodes, &agent_role())
            .await
            .unwrap();

        assert_eq!(
            client.calls_for(Operation::DeleteVirtualMachine),
            vec!["k8s-agentpool1-12345678-1"]
        );
    }

    struct PanickingHook;

    #[async_trait]
    impl NodeHook for PanickingHook {
        async fn after_provision(&self, vm_name: &str) -> Result<(), HookError> {
            panic!("readiness probe crashed for {vm_name}");
        }
    }

    #[tokio::test]
    async fn test_panicking_worker_restores_node() {
        let client = Arc::new(MockArmClient::with_cluster(1, &[("agentpool1", 1)]));
        let mut nodes = agents(1);

        let err = pool_upgrader(client, Arc::new(PanickingHook), 3)
            .upgrade_pool(&mut nodes, &agent_role())
            .await
            .unwrap_err();

        assert!(matches!(err, UpgradeError::Worker { .. }));
        assert_eq!(err.node(), Some("k8s-agentpool1-12345678-0"));
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].state, NodeState::Failed);
    }
}

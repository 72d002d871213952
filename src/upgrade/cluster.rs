//! Top-level upgrade coordinator.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use super::hook::{NodeHook, NoopHook};
use super::node::{NodeUpgrader, UpgradeContext};
use super::pool::{DEFAULT_AGENT_PARALLELISM, PoolUpgrader};
use super::request::{UpgradeRequest, UpgradeResult};
use super::template::check_template;
use super::topology::{ClusterTopology, PoolRole, TopologyDiscoverer, has_unversioned, lowest_version};
use super::version::VersionGate;
use crate::arm::ArmClient;
use crate::error::UpgradeError;

/// Runs one cluster upgrade: version gate, discovery, then masters
/// followed by each requested agent pool.
pub struct UpgradeOrchestrator {
    client: Arc<dyn ArmClient>,
    hook: Arc<dyn NodeHook>,
    gate: VersionGate,
    max_parallel: usize,
    topology: Option<ClusterTopology>,
}

impl UpgradeOrchestrator {
    pub fn new(client: Arc<dyn ArmClient>) -> Self {
        Self {
            client,
            hook: Arc::new(NoopHook),
            gate: VersionGate::default(),
            max_parallel: DEFAULT_AGENT_PARALLELISM,
            topology: None,
        }
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn NodeHook>) -> Self {
        self.hook = hook;
        self
    }

    #[must_use]
    pub const fn with_version_gate(mut self, gate: VersionGate) -> Self {
        self.gate = gate;
        self
    }

    #[must_use]
    pub const fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    /// Topology of the last run, including partial progress after a failure.
    pub const fn topology(&self) -> Option<&ClusterTopology> {
        self.topology.as_ref()
    }

    pub async fn run(&mut self, request: &UpgradeRequest) -> Result<UpgradeResult, UpgradeError> {
        let started_at = Utc::now();
        let target = request.target_version();
        self.topology = None;

        self.gate
            .parse_target(target)
            .map_err(|_| UpgradeError::InvalidVersion(target.to_string()))?;
        check_template(request.template())?;

        info!(
            resource_group = request.resource_group(),
            target_version = target,
            agent_pools = ?request.agent_pools(),
            "Starting cluster upgrade"
        );

        let discoverer = TopologyDiscoverer::new(Arc::clone(&self.client), self.gate);
        let topology = self.topology.insert(discoverer.discover(request).await?);

        if let Some(current) = lowest_version(topology, request) {
            self.gate
                .validate(&current, target, has_unversioned(topology, request))
                .map_err(UpgradeError::VersionIncompatible)?;
        }
        for pool in request.agent_pools() {
            if topology.agent_pools.get(pool).is_none_or(Vec::is_empty) {
                warn!(pool = %pool, "Requested agent pool has no VMs");
            }
        }

        let upgrader = NodeUpgrader::new(
            Arc::clone(&self.client),
            Arc::clone(&self.hook),
            Arc::new(UpgradeContext::from(request)),
        );
        let pools = PoolUpgrader::new(upgrader, self.max_parallel);

        pools
            .upgrade_pool(&mut topology.masters, &PoolRole::Master)
            .await?;

        for pool in request.agent_pools() {
            let Some(nodes) = topology.agent_pools.get_mut(pool) else {
                continue;
            };
            pools
                .upgrade_pool(nodes, &PoolRole::Agent(pool.clone()))
                .await?;
        }

        let result = UpgradeResult {
            topology: topology.clone(),
            started_at,
            completed_at: Utc::now(),
        };
        info!(
            upgraded = result.upgraded_count(),
            elapsed_secs = result.duration().num_seconds(),
            "Cluster upgrade complete"
        );
        Ok(result)
    }
}

//! Cluster upgrade core.

pub mod cluster;
pub mod hook;
pub mod node;
pub mod pool;
pub mod request;
pub mod template;
pub mod topology;
pub mod version;

use std::sync::Arc;

use tracing::info;

pub use cluster::UpgradeOrchestrator;
pub use hook::{HookError, NodeHook, NoopHook};
pub use node::{NodeState, NodeUpgrader};
pub use pool::{DEFAULT_AGENT_PARALLELISM, PoolUpgrader};
pub use request::{UpgradeRequest, UpgradeResult};
pub use topology::{ClusterTopology, DiscoveredNode, PoolRole, TopologyDiscoverer};
pub use version::VersionGate;

use crate::arm::ArmClient;
use crate::error::UpgradeError;
use crate::k8s::{KubeNodeHook, build_kube_client};

/// Tuning knobs that are not part of the request itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeOptions {
    /// Cordon and drain each node before deleting its VM, then wait for
    /// the replacement to become Ready.
    pub drain: bool,
    pub max_parallel: usize,
    pub max_minor_skew: u64,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            drain: false,
            max_parallel: DEFAULT_AGENT_PARALLELISM,
            max_minor_skew: VersionGate::DEFAULT_MAX_MINOR_SKEW,
        }
    }
}

/// Build an orchestrator with the hook and limits selected by `options`.
///
/// Connects to Kubernetes only when drain is enabled.
pub async fn build_orchestrator(
    client: Arc<dyn ArmClient>,
    request: &UpgradeRequest,
    options: &UpgradeOptions,
) -> Result<UpgradeOrchestrator, UpgradeError> {
    let hook: Arc<dyn NodeHook> = if options.drain {
        let kube = build_kube_client(request.kube_config())
            .await
            .map_err(|e| UpgradeError::KubernetesApi(format!("{e:#}")))?;
        info!("Node drain enabled");
        Arc::new(KubeNodeHook::new(kube))
    } else {
        Arc::new(NoopHook)
    };

    Ok(UpgradeOrchestrator::new(client)
        .with_hook(hook)
        .with_version_gate(VersionGate::new(options.max_minor_skew))
        .with_max_parallel(options.max_parallel))
}

/// Upgrade every master and the requested agent pools of one cluster.
pub async fn upgrade_cluster(
    client: Arc<dyn ArmClient>,
    request: &UpgradeRequest,
    options: &UpgradeOptions,
) -> Result<UpgradeResult, UpgradeError> {
    build_orchestrator(client, request, options)
        .await?
        .run(request)
        .await
}

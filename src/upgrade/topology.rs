//! Cluster topology discovery from the live VM listing.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::node::NodeState;
use super::request::UpgradeRequest;
use super::version::{NodeVersion, VersionError, VersionGate, parse_version};
use crate::api::MASTER_POOL_NAME;
use crate::arm::{ArmClient, OsDisk, VirtualMachine};
use crate::error::UpgradeError;

const POOL_NAME_TAG: &str = "poolName";
const NAME_SUFFIX_TAG: &str = "resourceNameSuffix";
const ORCHESTRATOR_TAG: &str = "orchestrator";
const VM_NAME_PREFIX: &str = "k8s-";

/// The logical pool a node belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PoolRole {
    Master,
    Agent(String),
}

impl PoolRole {
    pub fn name(&self) -> &str {
        match self {
            Self::Master => MASTER_POOL_NAME,
            Self::Agent(pool) => pool,
        }
    }

    pub const fn is_master(&self) -> bool {
        matches!(self, Self::Master)
    }
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of classifying one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Master,
    Agent(String),
    Unknown,
}

impl Classification {
    pub fn into_role(self) -> Option<PoolRole> {
        match self {
            Self::Master => Some(PoolRole::Master),
            Self::Agent(pool) => Some(PoolRole::Agent(pool)),
            Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationSource {
    Tags,
    NamingConvention,
    /// No VM exists for a slot the cluster model expects.
    Missing,
}

impl fmt::Display for ClassificationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tags => f.write_str("tags"),
            Self::NamingConvention => f.write_str("name"),
            Self::Missing => f.write_str("missing"),
        }
    }
}

/// One existing VM and the metadata needed to replace it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredNode {
    pub name: String,
    pub resource_id: String,
    pub pool: PoolRole,
    pub classified_by: ClassificationSource,
    /// Raw `orchestrator` tag, e.g. `Kubernetes:1.7.9`.
    pub version: Option<String>,
    pub slot: usize,
    pub state: NodeState,
    pub nic_ids: Vec<String>,
    pub os_disk: Option<OsDisk>,
    pub principal_id: Option<String>,
    pub failure: Option<String>,
}

impl DiscoveredNode {
    pub fn new(
        name: impl Into<String>,
        resource_id: impl Into<String>,
        pool: PoolRole,
        classified_by: ClassificationSource,
        slot: usize,
    ) -> Self {
        Self {
            name: name.into(),
            resource_id: resource_id.into(),
            pool,
            classified_by,
            version: None,
            slot,
            state: NodeState::Pending,
            nic_ids: Vec::new(),
            os_disk: None,
            principal_id: None,
            failure: None,
        }
    }

    pub fn is_upgraded(&self) -> bool {
        self.state == NodeState::Upgraded
    }

    /// Returns true if the slot has no VM and only needs a deployment.
    pub fn is_missing(&self) -> bool {
        self.classified_by == ClassificationSource::Missing
    }
}

/// A VM in the resource group that could not be tied to this cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnclassifiedVm {
    pub name: String,
    pub resource_id: String,
}

/// Snapshot of the cluster's VMs, captured once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    pub masters: Vec<DiscoveredNode>,
    pub agent_pools: BTreeMap<String, Vec<DiscoveredNode>>,
    pub unclassified: Vec<UnclassifiedVm>,
}

impl ClusterTopology {
    pub fn nodes(&self) -> impl Iterator<Item = &DiscoveredNode> {
        self.masters
            .iter()
            .chain(self.agent_pools.values().flatten())
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    pub fn upgraded_count(&self) -> usize {
        self.nodes().filter(|n| n.is_upgraded()).count()
    }

    pub fn find(&self, name: &str) -> Option<&DiscoveredNode> {
        self.nodes().find(|n| n.name == name)
    }

    pub fn pool_mut(&mut self, role: &PoolRole) -> Option<&mut Vec<DiscoveredNode>> {
        match role {
            PoolRole::Master => Some(&mut self.masters),
            PoolRole::Agent(pool) => self.agent_pools.get_mut(pool),
        }
    }

    fn insert(&mut self, node: DiscoveredNode) {
        match &node.pool {
            PoolRole::Master => self.masters.push(node),
            PoolRole::Agent(pool) => self
                .agent_pools
                .entry(pool.clone())
                .or_default()
                .push(node),
        }
    }

    fn pools_mut(&mut self) -> impl Iterator<Item = &mut Vec<DiscoveredNode>> {
        std::iter::once(&mut self.masters).chain(self.agent_pools.values_mut())
    }
}

/// Classify a VM by its tags, falling back to the VM naming convention.
pub fn classify(
    vm: &VirtualMachine,
    name_suffix: &str,
) -> (Classification, Option<ClassificationSource>) {
    match classify_by_tags(vm, name_suffix) {
        Some(Classification::Unknown) => return (Classification::Unknown, None),
        Some(classification) => return (classification, Some(ClassificationSource::Tags)),
        None => {}
    }
    match classify_by_name(&vm.name, name_suffix) {
        Classification::Unknown => (Classification::Unknown, None),
        classification => (classification, Some(ClassificationSource::NamingConvention)),
    }
}

fn classify_by_tags(vm: &VirtualMachine, name_suffix: &str) -> Option<Classification> {
    let pool = vm.tag(POOL_NAME_TAG).map(str::trim).filter(|p| !p.is_empty())?;

    // A suffix that names another deployment marks a foreign VM.
    if let Some(suffix) = vm.tag(NAME_SUFFIX_TAG)
        && suffix.trim() != name_suffix
    {
        return Some(Classification::Unknown);
    }

    if pool.eq_ignore_ascii_case(MASTER_POOL_NAME) {
        Some(Classification::Master)
    } else {
        Some(Classification::Agent(pool.to_string()))
    }
}

/// `k8s-master-<suffix>-<n>` or `k8s-<pool>-<suffix>-<n>`.
fn classify_by_name(name: &str, name_suffix: &str) -> Classification {
    let Some(rest) = name.strip_prefix(VM_NAME_PREFIX) else {
        return Classification::Unknown;
    };
    let Some((head, index)) = rest.rsplit_once('-') else {
        return Classification::Unknown;
    };
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return Classification::Unknown;
    }
    let Some(pool) = head.strip_suffix(name_suffix).and_then(|h| h.strip_suffix('-')) else {
        return Classification::Unknown;
    };

    match pool {
        "" => Classification::Unknown,
        MASTER_POOL_NAME => Classification::Master,
        agent => Classification::Agent(agent.to_string()),
    }
}

/// Node index from the trailing `-<n>` of a VM name.
fn parse_slot(name: &str) -> Option<usize> {
    name.rsplit_once('-')?.1.parse().ok()
}

/// Builds a [`ClusterTopology`] from the VMs in the request's resource group.
pub struct TopologyDiscoverer {
    client: Arc<dyn ArmClient>,
    gate: VersionGate,
}

impl TopologyDiscoverer {
    pub fn new(client: Arc<dyn ArmClient>, gate: VersionGate) -> Self {
        Self { client, gate }
    }

    pub async fn discover(&self, request: &UpgradeRequest) -> Result<ClusterTopology, UpgradeError> {
        let resource_group = request.resource_group();
        let vms = self
            .client
            .list_virtual_machines(resource_group)
            .await
            .map_err(UpgradeError::DiscoveryFailed)?;
        debug!(resource_group, count = vms.len(), "Listed virtual machines");

        let mut topology = ClusterTopology::default();
        for pool in request.agent_pools() {
            topology.agent_pools.entry(pool.clone()).or_default();
        }

        let mut pending_slots = Vec::new();
        for vm in &vms {
            let (classification, source) = classify(vm, request.name_suffix());
            let (Some(role), Some(source)) = (classification.into_role(), source) else {
                warn!(vm = %vm.name, "VM does not belong to the cluster, leaving it untouched");
                topology.unclassified.push(UnclassifiedVm {
                    name: vm.name.clone(),
                    resource_id: vm.id.clone(),
                });
                continue;
            };

            let slot = parse_slot(&vm.name);
            let mut node =
                DiscoveredNode::new(&vm.name, &vm.id, role, source, slot.unwrap_or_default());
            if slot.is_none() {
                pending_slots.push(node.name.clone());
            }
            if source == ClassificationSource::NamingConvention {
                info!(vm = %vm.name, pool = %node.pool, "Classified VM by naming convention");
            }

            node.version = vm.tag(ORCHESTRATOR_TAG).map(str::to_string);
            if request.is_in_scope(&node.pool) {
                self.check_version(&mut node, request.target_version())?;
            }
            topology.insert(node);
        }

        assign_free_slots(&mut topology, &pending_slots);
        add_missing_slots(&mut topology, request);

        info!(
            masters = topology.masters.len(),
            agent_pools = topology.agent_pools.len(),
            unclassified = topology.unclassified.len(),
            "Discovered cluster topology"
        );
        Ok(topology)
    }

    fn check_version(&self, node: &mut DiscoveredNode, target: &str) -> Result<(), UpgradeError> {
        let Some(current) = node.version.as_deref() else {
            debug!(node = %node.name, "No orchestrator tag, node will be upgraded");
            return Ok(());
        };

        match self.gate.check_node(current, target) {
            Ok(NodeVersion::AtTarget) => {
                debug!(node = %node.name, version = current, "Node already at target version");
                node.state = NodeState::Upgraded;
                Ok(())
            }
            Ok(NodeVersion::NeedsUpgrade) => Ok(()),
            Err(VersionError::Invalid(raw)) => {
                warn!(node = %node.name, tag = %raw, "Unparseable orchestrator tag, node will be upgraded");
                node.version = None;
                Ok(())
            }
            Err(err) => Err(UpgradeError::VersionIncompatible(err)),
        }
    }
}

/// Give nodes without a numeric name suffix the lowest unused index of their pool.
fn assign_free_slots(topology: &mut ClusterTopology, pending: &[String]) {
    if pending.is_empty() {
        return;
    }
    for pool in topology.pools_mut() {
        let mut used: BTreeSet<usize> = pool
            .iter()
            .filter(|n| !pending.contains(&n.name))
            .map(|n| n.slot)
            .collect();
        for node in pool.iter_mut().filter(|n| pending.contains(&n.name)) {
            let slot = (0..).find(|i| !used.contains(i)).unwrap_or_default();
            used.insert(slot);
            node.slot = slot;
        }
    }
}

/// Add a placeholder for every in-scope slot below the pool's configured
/// count that has no VM, keeping each pool ordered by slot around it.
fn add_missing_slots(topology: &mut ClusterTopology, request: &UpgradeRequest) {
    let cluster = request.cluster();
    let masters = std::iter::once((PoolRole::Master, cluster.master_count()));
    let expected: Vec<(PoolRole, usize)> = masters
        .chain(request.agent_pools().iter().filter_map(|pool| {
            cluster
                .agent_pool(pool)
                .map(|profile| (PoolRole::Agent(pool.clone()), profile.count))
        }))
        .collect();

    for (role, count) in expected {
        let Some(nodes) = topology.pool_mut(&role) else {
            continue;
        };
        let present: BTreeSet<usize> = nodes.iter().map(|n| n.slot).collect();
        for slot in (0..count).filter(|slot| !present.contains(slot)) {
            let name = format!("{VM_NAME_PREFIX}{role}-{}-{slot}", request.name_suffix());
            warn!(vm = %name, pool = %role, slot, "VM missing, it will be redeployed");
            let node = DiscoveredNode::new(
                name,
                String::new(),
                role.clone(),
                ClassificationSource::Missing,
                slot,
            );
            let at = nodes.iter().position(|n| n.slot > slot).unwrap_or(nodes.len());
            nodes.insert(at, node);
        }
    }
}

/// Lowest tagged version among in-scope nodes, as its raw tag.
pub fn lowest_version(topology: &ClusterTopology, request: &UpgradeRequest) -> Option<String> {
    topology
        .nodes()
        .filter(|n| request.is_in_scope(&n.pool))
        .filter_map(|n| {
            let raw = n.version.as_deref()?;
            parse_version(raw).ok().map(|v| (v, raw))
        })
        .min_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, raw)| raw.to_string())
}

/// Returns true if some in-scope node has no known version.
pub fn has_unversioned(topology: &ClusterTopology, request: &UpgradeRequest) -> bool {
    topology
        .nodes()
        .any(|n| request.is_in_scope(&n.pool) && n.version.is_none())
}

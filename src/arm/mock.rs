//! In-memory ARM collaborator with fault injection.
//!
//! Serves a deterministic cluster (masters plus named agent pools) and
//! records every call so tests can assert on cloud side effects.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::client::{ArmClient, StorageClient};
use super::error::{ArmError, Operation};
use super::types::{
    NetworkInterfaceReference, NetworkProfile, OsDiskSpec, RoleAssignment, StorageProfile,
    VirtualHardDisk, VirtualMachine, VirtualMachineIdentity, VirtualMachineProperties,
};
use crate::api::MASTER_POOL_NAME;

pub const MOCK_SUBSCRIPTION_ID: &str = "DEC923E3-1EF1-4745-9516-37906D56DEC4";
pub const MOCK_NAME_SUFFIX: &str = "12345678";
pub const MOCK_ORCHESTRATOR_TAG: &str = "Kubernetes:1.7.9";

/// One recorded collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub operation: Operation,
    pub target: String,
}

type CallLog = Arc<Mutex<Vec<MockCall>>>;

fn record(log: &CallLog, operation: Operation, target: &str) {
    log.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(MockCall {
            operation,
            target: target.to_string(),
        });
}

#[derive(Debug, Clone)]
pub struct MockArmClient {
    pub fail_list_virtual_machines: bool,
    /// Serve the VM listing without any tags.
    pub fail_list_virtual_machines_tags: bool,
    pub fail_get_virtual_machine: bool,
    pub fail_delete_virtual_machine: bool,
    pub fail_delete_network_interface: bool,
    pub fail_get_storage_client: bool,
    pub fail_delete_role_assignment: bool,
    pub fail_deploy_template: bool,
    /// Bind a system-assigned identity to every VM.
    pub should_support_vm_identity: bool,
    /// Answer role-assignment lookups with "not found".
    pub role_assignments_not_found: bool,
    /// Report the replacement VM as failed to provision.
    pub fail_provisioning_state: bool,

    pub name_suffix: String,
    pub orchestrator_tag: String,
    pub deploy_delay: Option<Duration>,

    masters: usize,
    agent_pools: Vec<(String, usize)>,
    node_versions: BTreeMap<String, String>,
    untagged: BTreeSet<String>,
    deleted: BTreeSet<String>,
    foreign: Vec<VirtualMachine>,

    calls: CallLog,
    deploys_in_flight: Arc<AtomicUsize>,
    peak_deploys_in_flight: Arc<AtomicUsize>,
}

impl Default for MockArmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockArmClient {
    /// One master and one agent in `agentpool1`, all tagged `Kubernetes:1.7.9`.
    pub fn new() -> Self {
        Self::with_cluster(1, &[("agentpool1", 1)])
    }

    pub fn with_cluster(masters: usize, agent_pools: &[(&str, usize)]) -> Self {
        Self {
            fail_list_virtual_machines: false,
            fail_list_virtual_machines_tags: false,
            fail_get_virtual_machine: false,
            fail_delete_virtual_machine: false,
            fail_delete_network_interface: false,
            fail_get_storage_client: false,
            fail_delete_role_assignment: false,
            fail_deploy_template: false,
            should_support_vm_identity: false,
            role_assignments_not_found: false,
            fail_provisioning_state: false,
            name_suffix: MOCK_NAME_SUFFIX.to_string(),
            orchestrator_tag: MOCK_ORCHESTRATOR_TAG.to_string(),
            deploy_delay: None,
            masters,
            agent_pools: agent_pools
                .iter()
                .map(|(name, count)| ((*name).to_string(), *count))
                .collect(),
            node_versions: BTreeMap::new(),
            untagged: BTreeSet::new(),
            deleted: BTreeSet::new(),
            foreign: Vec::new(),
            calls: Arc::default(),
            deploys_in_flight: Arc::default(),
            peak_deploys_in_flight: Arc::default(),
        }
    }

    /// Override the `orchestrator` tag of a single VM.
    #[must_use]
    pub fn with_node_version(mut self, vm_name: &str, orchestrator_tag: &str) -> Self {
        self.node_versions
            .insert(vm_name.to_string(), orchestrator_tag.to_string());
        self
    }

    /// List a single VM without tags.
    #[must_use]
    pub fn with_untagged(mut self, vm_name: &str) -> Self {
        self.untagged.insert(vm_name.to_string());
        self
    }

    /// Leave a cluster VM out of the listing, as if an earlier run deleted
    /// it and never redeployed it.
    #[must_use]
    pub fn without_vm(mut self, vm_name: &str) -> Self {
        self.deleted.insert(vm_name.to_string());
        self
    }

    /// Add a VM that does not belong to the cluster.
    #[must_use]
    pub fn with_foreign_vm(mut self, name: &str, tags: &[(&str, &str)]) -> Self {
        let tags: BTreeMap<String, String> = tags
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self.foreign.push(VirtualMachine {
            id: vm_id("rg", name),
            name: name.to_string(),
            location: "westus2".to_string(),
            tags: (!tags.is_empty()).then_some(tags),
            ..Default::default()
        });
        self
    }

    /// Name of the `index`-th VM of a pool.
    pub fn vm_name(&self, pool: &str, index: usize) -> String {
        format!("k8s-{pool}-{}-{index}", self.name_suffix)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Calls that changed (or attempted to change) cloud state.
    pub fn mutating_calls(&self) -> Vec<MockCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.operation.is_mutation())
            .collect()
    }

    pub fn calls_for(&self, operation: Operation) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.target)
            .collect()
    }

    /// Highest number of template deployments observed running at once.
    pub fn peak_deploys_in_flight(&self) -> usize {
        self.peak_deploys_in_flight.load(Ordering::SeqCst)
    }

    fn check(&self, fail: bool, operation: Operation, target: &str) -> Result<(), ArmError> {
        record(&self.calls, operation, target);
        if fail {
            return Err(ArmError::Failed(operation));
        }
        Ok(())
    }

    fn cluster_vm_names(&self) -> Vec<(String, String)> {
        let masters = (0..self.masters).map(|i| (MASTER_POOL_NAME.to_string(), i));
        let agents = self
            .agent_pools
            .iter()
            .flat_map(|(pool, count)| (0..*count).map(move |i| (pool.clone(), i)));

        masters
            .chain(agents)
            .map(|(pool, i)| {
                let name = self.vm_name(&pool, i);
                (pool, name)
            })
            .collect()
    }

    fn listed_vm(&self, resource_group: &str, pool: &str, name: &str) -> VirtualMachine {
        let tags = if self.fail_list_virtual_machines_tags || self.untagged.contains(name) {
            None
        } else {
            let orchestrator = self
                .node_versions
                .get(name)
                .unwrap_or(&self.orchestrator_tag);
            Some(BTreeMap::from([
                ("orchestrator".to_string(), orchestrator.clone()),
                ("poolName".to_string(), pool.to_string()),
                ("resourceNameSuffix".to_string(), self.name_suffix.clone()),
            ]))
        };

        VirtualMachine {
            id: vm_id(resource_group, name),
            name: name.to_string(),
            location: "westus2".to_string(),
            tags,
            ..Default::default()
        }
    }

    fn full_vm(&self, resource_group: &str, name: &str) -> VirtualMachine {
        let provisioning_state = if self.fail_provisioning_state {
            "Failed"
        } else {
            "Succeeded"
        };

        VirtualMachine {
            id: vm_id(resource_group, name),
            name: name.to_string(),
            location: "westus2".to_string(),
            tags: None,
            properties: VirtualMachineProperties {
                provisioning_state: Some(provisioning_state.to_string()),
                storage_profile: Some(StorageProfile {
                    os_disk: Some(OsDiskSpec {
                        name: Some(format!("{name}-osdisk")),
                        vhd: Some(VirtualHardDisk {
                            uri: Some(format!(
                                "https://00k8s{}.blob.core.windows.net/osdisk/{name}-osdisk.vhd",
                                self.name_suffix
                            )),
                        }),
                        managed_disk: None,
                    }),
                }),
                network_profile: Some(NetworkProfile {
                    network_interfaces: vec![NetworkInterfaceReference {
                        id: format!(
                            "/subscriptions/{MOCK_SUBSCRIPTION_ID}/resourceGroups/{resource_group}/providers/Microsoft.Network/networkInterfaces/{name}-nic-0"
                        ),
                    }],
                }),
            },
            identity: self.should_support_vm_identity.then(|| VirtualMachineIdentity {
                principal_id: Some(format!("{name}-principal")),
                kind: Some("SystemAssigned".to_string()),
            }),
        }
    }
}

fn vm_id(resource_group: &str, name: &str) -> String {
    format!(
        "/subscriptions/{MOCK_SUBSCRIPTION_ID}/resourceGroups/{resource_group}/providers/Microsoft.Compute/virtualMachines/{name}"
    )
}

#[async_trait]
impl ArmClient for MockArmClient {
    async fn list_virtual_machines(
        &self,
        resource_group: &str,
    ) -> Result<Vec<VirtualMachine>, ArmError> {
        self.check(
            self.fail_list_virtual_machines,
            Operation::ListVirtualMachines,
            resource_group,
        )?;

        let mut vms: Vec<VirtualMachine> = self
            .cluster_vm_names()
            .iter()
            .filter(|(_, name)| !self.deleted.contains(name))
            .map(|(pool, name)| self.listed_vm(resource_group, pool, name))
            .collect();
        vms.extend(self.foreign.iter().cloned());
        Ok(vms)
    }

    async fn get_virtual_machine(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<VirtualMachine, ArmError> {
        self.check(
            self.fail_get_virtual_machine,
            Operation::GetVirtualMachine,
            name,
        )?;
        Ok(self.full_vm(resource_group, name))
    }

    async fn delete_virtual_machine(
        &self,
        _resource_group: &str,
        name: &str,
    ) -> Result<(), ArmError> {
        self.check(
            self.fail_delete_virtual_machine,
            Operation::DeleteVirtualMachine,
            name,
        )
    }

    async fn delete_network_interface(
        &self,
        _resource_group: &str,
        name: &str,
    ) -> Result<(), ArmError> {
        self.check(
            self.fail_delete_network_interface,
            Operation::DeleteNetworkInterface,
            name,
        )
    }

    async fn delete_managed_disk(&self, _resource_group: &str, name: &str) -> Result<(), ArmError> {
        self.check(false, Operation::DeleteManagedDisk, name)
    }

    async fn get_storage_client(
        &self,
        _resource_group: &str,
        account: &str,
    ) -> Result<Box<dyn StorageClient>, ArmError> {
        self.check(
            self.fail_get_storage_client,
            Operation::GetStorageClient,
            account,
        )?;
        Ok(Box::new(MockStorageClient {
            calls: Arc::clone(&self.calls),
        }))
    }

    async fn list_role_assignments_for_principal(
        &self,
        scope: &str,
        principal_id: &str,
    ) -> Result<Vec<RoleAssignment>, ArmError> {
        self.check(false, Operation::ListRoleAssignmentsForPrincipal, principal_id)?;
        if self.role_assignments_not_found {
            return Err(ArmError::NotFound {
                operation: Operation::ListRoleAssignmentsForPrincipal,
                message: format!("no role assignments for principal {principal_id}"),
            });
        }
        let name = format!("{principal_id}-assignment");
        Ok(vec![RoleAssignment {
            id: format!("{scope}/providers/Microsoft.Authorization/roleAssignments/{name}"),
            name,
        }])
    }

    async fn delete_role_assignment_by_id(
        &self,
        role_assignment_id: &str,
    ) -> Result<(), ArmError> {
        self.check(
            self.fail_delete_role_assignment,
            Operation::DeleteRoleAssignmentByID,
            role_assignment_id,
        )
    }

    async fn deploy_template(
        &self,
        _resource_group: &str,
        deployment_name: &str,
        _template: &Value,
        _parameters: &Value,
    ) -> Result<(), ArmError> {
        self.check(
            self.fail_deploy_template,
            Operation::DeployTemplate,
            deployment_name,
        )?;

        let running = self.deploys_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_deploys_in_flight
            .fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.deploy_delay {
            tokio::time::sleep(delay).await;
        }
        self.deploys_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockStorageClient {
    calls: CallLog,
}

#[async_trait]
impl StorageClient for MockStorageClient {
    async fn delete_blob(&self, container: &str, blob: &str) -> Result<(), ArmError> {
        record(&self.calls, Operation::DeleteBlob, &format!("{container}/{blob}"));
        Ok(())
    }
}

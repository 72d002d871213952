//! Per-node upgrade state machine.
//!
//! Replaces one VM: resolve its attachments, tear it down, deploy the
//! replacement from the template and verify it exists.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::hook::NodeHook;
use super::request::UpgradeRequest;
use super::template::{deployment_name, deployment_parameters};
use super::topology::DiscoveredNode;
use crate::arm::types::resource_name;
use crate::arm::{ArmClient, ArmError, OsDisk, Operation, resource_group_scope};
use crate::error::UpgradeError;

const PROVISIONING_FAILED: &str = "Failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Pending,
    Deprovisioning,
    Deprovisioned,
    Provisioning,
    Validating,
    Upgraded,
    Failed,
}

/// Result of one step of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed,
}

impl NodeState {
    /// Next state after a step. Terminal states never change.
    #[must_use]
    pub const fn transition(self, outcome: StepOutcome) -> Self {
        match (self, outcome) {
            (Self::Upgraded | Self::Failed, _) => self,
            (_, StepOutcome::Failed) => Self::Failed,
            (Self::Pending, StepOutcome::Succeeded) => Self::Deprovisioning,
            (Self::Deprovisioning, StepOutcome::Succeeded) => Self::Deprovisioned,
            (Self::Deprovisioned, StepOutcome::Succeeded) => Self::Provisioning,
            (Self::Provisioning, StepOutcome::Succeeded) => Self::Validating,
            (Self::Validating, StepOutcome::Succeeded) => Self::Upgraded,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Upgraded | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Deprovisioning => "Deprovisioning",
            Self::Deprovisioned => "Deprovisioned",
            Self::Provisioning => "Provisioning",
            Self::Validating => "Validating",
            Self::Upgraded => "Upgraded",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of removing a node's role assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityCleanup {
    Removed(usize),
    /// No identity is bound to the VM.
    Absent,
}

/// Request values every node upgrade needs, shared across workers.
#[derive(Debug, Clone)]
pub struct UpgradeContext {
    pub subscription_id: String,
    pub resource_group: String,
    pub name_suffix: String,
    pub target_version: String,
    pub engine_version: String,
    pub orchestrator_type: String,
    pub use_managed_identity: bool,
    pub template: Value,
    pub parameters: Map<String, Value>,
}

impl From<&UpgradeRequest> for UpgradeContext {
    fn from(request: &UpgradeRequest) -> Self {
        Self {
            subscription_id: request.subscription_id().to_string(),
            resource_group: request.resource_group().to_string(),
            name_suffix: request.name_suffix().to_string(),
            target_version: request.target_version().to_string(),
            engine_version: request.engine_version().to_string(),
            orchestrator_type: request.cluster().orchestrator_type().to_string(),
            use_managed_identity: request.cluster().use_managed_identity(),
            template: request.template().clone(),
            parameters: request.parameters().clone(),
        }
    }
}

/// Drives a single node through the state machine.
#[derive(Clone)]
pub struct NodeUpgrader {
    client: Arc<dyn ArmClient>,
    hook: Arc<dyn NodeHook>,
    ctx: Arc<UpgradeContext>,
}

impl NodeUpgrader {
    pub fn new(
        client: Arc<dyn ArmClient>,
        hook: Arc<dyn NodeHook>,
        ctx: Arc<UpgradeContext>,
    ) -> Self {
        Self { client, hook, ctx }
    }

    /// Replace the node's VM. On error the node is left in `Failed` with
    /// the message recorded in `failure`.
    pub async fn upgrade(&self, node: &mut DiscoveredNode) -> Result<(), UpgradeError> {
        if node.state.is_terminal() {
            debug!(node = %node.name, state = %node.state, "Skipping node in terminal state");
            return Ok(());
        }

        info!(node = %node.name, pool = %node.pool, slot = node.slot, "Upgrading node");

        let result = self.resolve(node).await;
        advance(node, result)?;
        let result = self.deprovision(node).await;
        advance(node, result)?;
        let result = self.provision(node).await;
        advance(node, result)?;
        let result = self.validate(node).await;
        advance(node, result)?;
        advance(node, Ok(()))?;

        node.version = Some(format!(
            "{}:{}",
            self.ctx.orchestrator_type, self.ctx.target_version
        ));
        info!(node = %node.name, pool = %node.pool, "Node upgraded");
        Ok(())
    }

    /// Look up the live VM for its NICs, OS disk and identity, then run the
    /// pre-delete hook.
    async fn resolve(&self, node: &mut DiscoveredNode) -> Result<(), UpgradeError> {
        if node.is_missing() {
            info!(node = %node.name, "No VM for slot, redeploying without teardown");
            return Ok(());
        }

        let vm = self
            .client
            .get_virtual_machine(&self.ctx.resource_group, &node.name)
            .await
            .map_err(|e| node_error(node, e))?;

        node.nic_ids = vm.nic_ids();
        node.os_disk = vm.os_disk();
        node.principal_id = vm.principal_id().map(str::to_string);
        debug!(
            node = %node.name,
            nics = node.nic_ids.len(),
            identity = node.principal_id.is_some(),
            "Resolved node attachments"
        );

        self.hook
            .before_delete(&node.name)
            .await
            .map_err(|e| UpgradeError::HookFailed {
                node: node.name.clone(),
                message: e.to_string(),
            })
    }

    async fn deprovision(&self, node: &DiscoveredNode) -> Result<(), UpgradeError> {
        if node.is_missing() {
            return Ok(());
        }
        let rg = &self.ctx.resource_group;

        info!(node = %node.name, "Deleting virtual machine");
        self.client
            .delete_virtual_machine(rg, &node.name)
            .await
            .map_err(|e| node_error(node, e))?;

        for nic_id in &node.nic_ids {
            let nic = resource_name(nic_id).unwrap_or(nic_id.as_str());
            debug!(node = %node.name, nic, "Deleting network interface");
            self.client
                .delete_network_interface(rg, nic)
                .await
                .map_err(|e| node_error(node, e))?;
        }

        match &node.os_disk {
            Some(OsDisk::Vhd(location)) => {
                debug!(node = %node.name, account = %location.account, blob = %location.blob, "Deleting OS disk blob");
                let storage = self
                    .client
                    .get_storage_client(rg, &location.account)
                    .await
                    .map_err(|e| node_error(node, e))?;
                storage
                    .delete_blob(&location.container, &location.blob)
                    .await
                    .map_err(|e| node_error(node, e))?;
            }
            Some(OsDisk::Managed { name }) => {
                debug!(node = %node.name, disk = %name, "Deleting managed OS disk");
                self.client
                    .delete_managed_disk(rg, name)
                    .await
                    .map_err(|e| node_error(node, e))?;
            }
            None => warn!(node = %node.name, "No OS disk found on VM"),
        }

        if self.ctx.use_managed_identity {
            match self
                .remove_role_assignments(node)
                .await
                .map_err(|e| node_error(node, e))?
            {
                IdentityCleanup::Removed(count) => {
                    info!(node = %node.name, count, "Removed role assignments");
                }
                IdentityCleanup::Absent => {
                    info!(node = %node.name, "No identity bound to VM, skipping role assignment cleanup");
                }
            }
        }

        Ok(())
    }

    async fn remove_role_assignments(&self, node: &DiscoveredNode) -> Result<IdentityCleanup, ArmError> {
        let Some(principal_id) = node.principal_id.as_deref() else {
            return Ok(IdentityCleanup::Absent);
        };

        let scope = resource_group_scope(&self.ctx.subscription_id, &self.ctx.resource_group);
        let assignments = match self
            .client
            .list_role_assignments_for_principal(&scope, principal_id)
            .await
        {
            Ok(assignments) => assignments,
            Err(e) if e.is_not_found() => return Ok(IdentityCleanup::Absent),
            Err(e) => return Err(e),
        };
        if assignments.is_empty() {
            return Ok(IdentityCleanup::Absent);
        }

        for assignment in &assignments {
            match self.client.delete_role_assignment_by_id(&assignment.id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(role_assignment = %assignment.id, "Role assignment already removed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(IdentityCleanup::Removed(assignments.len()))
    }

    async fn provision(&self, node: &DiscoveredNode) -> Result<(), UpgradeError> {
        let name = deployment_name(node.pool.name(), &self.ctx.name_suffix, node.slot);
        let parameters = deployment_parameters(&self.ctx, &node.pool, node.slot);

        info!(node = %node.name, deployment = %name, "Deploying replacement VM");
        self.client
            .deploy_template(&self.ctx.resource_group, &name, &self.ctx.template, &parameters)
            .await
            .map_err(|e| node_error(node, e))
    }

    async fn validate(&self, node: &DiscoveredNode) -> Result<(), UpgradeError> {
        let vm = self
            .client
            .get_virtual_machine(&self.ctx.resource_group, &node.name)
            .await
            .map_err(|e| node_error(node, e))?;

        if vm.provisioning_state() == Some(PROVISIONING_FAILED) {
            return Err(node_error(
                node,
                ArmError::UnexpectedState {
                    operation: Operation::GetVirtualMachine,
                    message: format!("replacement VM {} failed to provision", node.name),
                },
            ));
        }

        self.hook
            .after_provision(&node.name)
            .await
            .map_err(|e| UpgradeError::HookFailed {
                node: node.name.clone(),
                message: e.to_string(),
            })
    }
}

fn node_error(node: &DiscoveredNode, source: ArmError) -> UpgradeError {
    UpgradeError::NodeOperationFailed {
        pool: node.pool.name().to_string(),
        node: node.name.clone(),
        source,
    }
}

/// Apply a step result to the node's state.
fn advance(node: &mut DiscoveredNode, result: Result<(), UpgradeError>) -> Result<(), UpgradeError> {
    match result {
        Ok(()) => {
            node.state = node.state.transition(StepOutcome::Succeeded);
            Ok(())
        }
        Err(err) => {
            node.state = node.state.transition(StepOutcome::Failed);
            node.failure = Some(err.to_string());
            warn!(node = %node.name, pool = %node.pool, error = %err, "Node upgrade failed");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ContainerService;
    use crate::arm::MockArmClient;
    use crate::upgrade::hook::{HookError, NoopHook};
    use crate::upgrade::topology::{ClassificationSource, PoolRole};
    use async_trait::async_trait;
    use uuid::Uuid;

    fn context(managed_identity: bool) -> Arc<UpgradeContext> {
        let request = UpgradeRequest::new(
            Uuid::nil(),
            "rg",
            ContainerService::mock("c", "1.7.16", 1, 1, managed_identity),
            "12345678",
            ["agentpool1"],
            "0.1.0",
        );
        Arc::new(UpgradeContext::from(&request))
    }

    fn master() -> DiscoveredNode {
        DiscoveredNode::new(
            "k8s-master-12345678-0",
            "/subscriptions/x/virtualMachines/k8s-master-12345678-0",
            PoolRole::Master,
            ClassificationSource::Tags,
            0,
        )
    }

    fn upgrader(client: &Arc<MockArmClient>, managed_identity: bool) -> NodeUpgrader {
        NodeUpgrader::new(client.clone(), Arc::new(NoopHook), context(managed_identity))
    }

    #[test]
    fn test_transition_happy_path() {
        let mut state = NodeState::Pending;
        let mut seen = vec![state];
        while !state.is_terminal() {
            state = state.transition(StepOutcome::Succeeded);
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                NodeState::Pending,
                NodeState::Deprovisioning,
                NodeState::Deprovisioned,
                NodeState::Provisioning,
                NodeState::Validating,
                NodeState::Upgraded,
            ]
        );
    }

    #[test]
    fn test_transition_failure_and_terminal_states() {
        assert_eq!(
            NodeState::Provisioning.transition(StepOutcome::Failed),
            NodeState::Failed
        );
        assert_eq!(
            NodeState::Failed.transition(StepOutcome::Succeeded),
            NodeState::Failed
        );
        assert_eq!(
            NodeState::Upgraded.transition(StepOutcome::Failed),
            NodeState::Upgraded
        );
    }

    #[tokio::test]
    async fn test_upgrade_sequence() {
        let client = Arc::new(MockArmClient::new());
        let mut node = master();

        upgrader(&client, false).upgrade(&mut node).await.unwrap();

        assert_eq!(node.state, NodeState::Upgraded);
        assert_eq!(node.version.as_deref(), Some("Kubernetes:1.7.16"));
        let ops: Vec<Operation> = client.calls().iter().map(|c| c.operation).collect();
        assert_eq!(
            ops,
            vec![
                Operation::GetVirtualMachine,
                Operation::DeleteVirtualMachine,
                Operation::DeleteNetworkInterface,
                Operation::GetStorageClient,
                Operation::DeleteBlob,
                Operation::DeployTemplate,
                Operation::GetVirtualMachine,
            ]
        );
        assert_eq!(
            client.calls_for(Operation::DeleteNetworkInterface),
            vec!["k8s-master-12345678-0-nic-0"]
        );
        assert_eq!(
            client.calls_for(Operation::DeployTemplate),
            vec!["master-12345678-0-upgrade"]
        );
    }

    #[tokio::test]
    async fn test_managed_identity_removes_role_assignments() {
        let mut mock = MockArmClient::new();
        mock.should_support_vm_identity = true;
        let client = Arc::new(mock);
        let mut node = master();

        upgrader(&client, true).upgrade(&mut node).await.unwrap();

        assert_eq!(client.calls_for(Operation::DeleteRoleAssignmentByID).len(), 1);
        assert_eq!(node.principal_id.as_deref(), Some("k8s-master-12345678-0-principal"));
    }

    #[tokio::test]
    async fn test_identity_absent_is_benign() {
        let client = Arc::new(MockArmClient::new());
        let without_identity = upgrader(&client, true);
        let mut node = master();
        node.principal_id = None;
        assert_eq!(
            without_identity.remove_role_assignments(&node).await,
            Ok(IdentityCleanup::Absent)
        );

        let mut mock = MockArmClient::new();
        mock.role_assignments_not_found = true;
        let client = Arc::new(mock);
        node.principal_id = Some("p-1".to_string());
        assert_eq!(
            upgrader(&client, true).remove_role_assignments(&node).await,
            Ok(IdentityCleanup::Absent)
        );
        assert!(client.calls_for(Operation::DeleteRoleAssignmentByID).is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_recorded_on_node() {
        let mut mock = MockArmClient::new();
        mock.fail_deploy_template = true;
        let client = Arc::new(mock);
        let mut node = master();

        let err = upgrader(&client, false).upgrade(&mut node).await.unwrap_err();

        assert_eq!(err.to_string(), "DeployTemplate failed");
        assert_eq!(node.state, NodeState::Failed);
        assert_eq!(node.failure.as_deref(), Some("DeployTemplate failed"));
        assert!(client.calls_for(Operation::DeleteVirtualMachine).len() == 1);
    }

    #[tokio::test]
    async fn test_failed_provisioning_state() {
        let mut mock = MockArmClient::new();
        mock.fail_provisioning_state = true;
        let client = Arc::new(mock);
        let mut node = master();

        let err = upgrader(&client, false).upgrade(&mut node).await.unwrap_err();
        assert!(err.to_string().starts_with("GetVirtualMachine failed: unexpected state"));
        assert_eq!(node.state, NodeState::Failed);
    }

    struct RefusingHook;

    #[async_trait]
    impl NodeHook for RefusingHook {
        async fn before_delete(&self, _vm_name: &str) -> Result<(), HookError> {
            Err(HookError::new("pods could not be evicted"))
        }
    }

    #[tokio::test]
    async fn test_hook_failure_stops_before_delete() {
        let client = Arc::new(MockArmClient::new());
        let upgrader = NodeUpgrader::new(client.clone(), Arc::new(RefusingHook), context(false));
        let mut node = master();

        let err = upgrader.upgrade(&mut node).await.unwrap_err();

        assert!(matches!(err, UpgradeError::HookFailed { .. }));
        assert!(client.mutating_calls().is_empty());
        assert_eq!(node.state, NodeState::Failed);
    }

    #[tokio::test]
    async fn test_missing_node_is_only_deployed() {
        let client = Arc::new(MockArmClient::new());
        let upgrader = NodeUpgrader::new(client.clone(), Arc::new(RefusingHook), context(false));
        let mut node = DiscoveredNode::new(
            "k8s-master-12345678-1",
            "",
            PoolRole::Master,
            ClassificationSource::Missing,
            1,
        );

        upgrader.upgrade(&mut node).await.unwrap();

        assert_eq!(node.state, NodeState::Upgraded);
        let ops: Vec<Operation> = client.calls().iter().map(|c| c.operation).collect();
        assert_eq!(ops, vec![Operation::DeployTemplate, Operation::GetVirtualMachine]);
        assert_eq!(
            client.calls_for(Operation::DeployTemplate),
            vec!["master-12345678-1-upgrade"]
        );
    }

    #[tokio::test]
    async fn test_terminal_node_is_skipped() {
        let client = Arc::new(MockArmClient::new());
        let mut node = master();
        node.state = NodeState::Upgraded;

        upgrader(&client, false).upgrade(&mut node).await.unwrap();
        assert!(client.calls().is_empty());
    }
}

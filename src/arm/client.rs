//! The cloud operations the upgrade depends on.

use async_trait::async_trait;
use serde_json::Value;

use super::error::ArmError;
use super::types::{RoleAssignment, VirtualMachine};

/// Azure Resource Manager capabilities consumed by the upgrade.
///
/// Implementations are shared across agent workers, so they must be
/// safe to call concurrently.
#[async_trait]
pub trait ArmClient: Send + Sync {
    async fn list_virtual_machines(
        &self,
        resource_group: &str,
    ) -> Result<Vec<VirtualMachine>, ArmError>;

    async fn get_virtual_machine(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<VirtualMachine, ArmError>;

    async fn delete_virtual_machine(&self, resource_group: &str, name: &str)
    -> Result<(), ArmError>;

    async fn delete_network_interface(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<(), ArmError>;

    async fn delete_managed_disk(&self, resource_group: &str, name: &str) -> Result<(), ArmError>;

    /// Get a data-plane client for the storage account holding VHD blobs.
    async fn get_storage_client(
        &self,
        resource_group: &str,
        account: &str,
    ) -> Result<Box<dyn StorageClient>, ArmError>;

    async fn list_role_assignments_for_principal(
        &self,
        scope: &str,
        principal_id: &str,
    ) -> Result<Vec<RoleAssignment>, ArmError>;

    async fn delete_role_assignment_by_id(&self, role_assignment_id: &str)
    -> Result<(), ArmError>;

    /// Create or update a resource group deployment and wait for it to finish.
    async fn deploy_template(
        &self,
        resource_group: &str,
        deployment_name: &str,
        template: &Value,
        parameters: &Value,
    ) -> Result<(), ArmError>;
}

/// Blob operations on one storage account.
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn delete_blob(&self, container: &str, blob: &str) -> Result<(), ArmError>;
}

/// ARM scope string for a resource group.
pub fn resource_group_scope(subscription_id: &str, resource_group: &str) -> String {
    format!("/subscriptions/{subscription_id}/resourceGroups/{resource_group}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_group_scope() {
        assert_eq!(
            resource_group_scope("sub-1", "rg-prod"),
            "/subscriptions/sub-1/resourceGroups/rg-prod"
        );
    }
}

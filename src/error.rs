//! Custom error types for nodeup.

use thiserror::Error;

use crate::arm::{ArmError, Operation};
use crate::upgrade::version::VersionError;

/// Errors that end an upgrade run.
#[derive(Error, Debug, Clone)]
pub enum UpgradeError {
    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("Invalid deployment template: {0}")]
    InvalidTemplate(String),

    #[error("Error while querying ARM for resources: {0}")]
    VersionIncompatible(VersionError),

    #[error("Error while querying ARM for resources: {0}")]
    DiscoveryFailed(ArmError),

    #[error("{source}")]
    NodeOperationFailed {
        pool: String,
        node: String,
        source: ArmError,
    },

    #[error("Node hook failed for {node}: {message}")]
    HookFailed { node: String, message: String },

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("Upgrade worker for {node} did not finish: {message}")]
    Worker { node: String, message: String },
}

impl UpgradeError {
    /// The cloud operation that failed, if the error came from ARM.
    pub const fn operation(&self) -> Option<Operation> {
        match self {
            Self::DiscoveryFailed(source) | Self::NodeOperationFailed { source, .. } => {
                Some(source.operation())
            }
            _ => None,
        }
    }

    /// The node the error is attributed to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::NodeOperationFailed { node, .. }
            | Self::HookFailed { node, .. }
            | Self::Worker { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Returns true if the error was raised before any cloud mutation.
    pub const fn is_preflight(&self) -> bool {
        matches!(
            self,
            Self::InvalidVersion(_)
                | Self::InvalidTemplate(_)
                | Self::VersionIncompatible(_)
                | Self::DiscoveryFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_failed_display() {
        let err = UpgradeError::DiscoveryFailed(ArmError::Failed(Operation::ListVirtualMachines));
        assert_eq!(
            err.to_string(),
            "Error while querying ARM for resources: ListVirtualMachines failed"
        );
        assert_eq!(err.operation(), Some(Operation::ListVirtualMachines));
        assert!(err.is_preflight());
    }

    #[test]
    fn test_node_operation_failed_is_verbatim() {
        let err = UpgradeError::NodeOperationFailed {
            pool: "master".to_string(),
            node: "k8s-master-12345678-0".to_string(),
            source: ArmError::Failed(Operation::DeleteVirtualMachine),
        };
        assert_eq!(err.to_string(), "DeleteVirtualMachine failed");
        assert_eq!(err.node(), Some("k8s-master-12345678-0"));
        assert_eq!(err.operation(), Some(Operation::DeleteVirtualMachine));
        assert!(!err.is_preflight());
    }

    #[test]
    fn test_error_display_invalid_version() {
        let err = UpgradeError::InvalidVersion("latest".to_string());
        assert_eq!(err.to_string(), "Invalid version format: latest");
        assert_eq!(err.node(), None);
    }

    #[test]
    fn test_invalid_template_is_preflight() {
        let err = UpgradeError::InvalidTemplate("no resources to deploy".to_string());
        assert_eq!(err.to_string(), "Invalid deployment template: no resources to deploy");
        assert!(err.is_preflight());
    }

    #[test]
    fn test_error_display_hook_failed() {
        let err = UpgradeError::HookFailed {
            node: "k8s-agentpool1-12345678-0".to_string(),
            message: "node did not become Ready".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Node hook failed for k8s-agentpool1-12345678-0: node did not become Ready"
        );
    }
}

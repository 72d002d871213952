//! Pluggable per-node hooks around VM replacement.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Work that runs before a node's VM is deleted and after its
/// replacement is provisioned.
///
/// Both hooks receive the VM name.
#[async_trait]
pub trait NodeHook: Send + Sync {
    /// Runs before any destructive step, e.g. cordon and drain.
    async fn before_delete(&self, _vm_name: &str) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs once the replacement VM exists, e.g. wait for the node to be Ready.
    async fn after_provision(&self, _vm_name: &str) -> Result<(), HookError> {
        Ok(())
    }
}

/// Replaces VMs without touching the Kubernetes API.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

#[async_trait]
impl NodeHook for NoopHook {}

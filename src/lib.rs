//! nodeup - in-place node upgrade orchestrator for Kubernetes clusters on Azure VMs.
//!
//! Replaces every master and agent VM of a cluster with one deployed from an
//! updated ARM template:
//! - Version gate (no downgrades, no skipped major/minor versions)
//! - Topology discovery from live VM listings, tolerant of missing tags
//! - Serial master replacement to keep etcd quorum
//! - Bounded-parallel agent pool replacement

pub mod api;
pub mod arm;
pub mod error;
pub mod k8s;
pub mod upgrade;

pub use error::UpgradeError;
pub use upgrade::{
    UpgradeOptions, UpgradeOrchestrator, UpgradeRequest, UpgradeResult, build_orchestrator,
    upgrade_cluster,
};

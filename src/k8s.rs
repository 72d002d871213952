//! Kubernetes API access for node drain and readiness checks.

pub mod client;
pub mod drain;

pub use client::build_kube_client;
pub use drain::KubeNodeHook;

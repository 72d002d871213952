//! Cordon/drain before VM deletion and readiness wait after provisioning.
//!
//! The drained Node object is deleted before its VM goes away so the
//! replacement kubelet registers a fresh, schedulable object.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Api;
use kube::api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::upgrade::hook::{HookError, NodeHook};

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Kubernetes node name for a VM. The kubelet registers the lowercased hostname.
pub fn node_name(vm_name: &str) -> String {
    vm_name.to_lowercase()
}

/// Returns true if the node reports `Ready=True`.
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Returns true if the node is marked unschedulable.
pub fn is_cordoned(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/// Pods a drain must evict: not owned by a DaemonSet, not mirror pods,
/// and not already finished.
pub fn should_evict(pod: &Pod) -> bool {
    let owned_by_daemonset = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"));
    let mirror = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION));
    let finished = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Succeeded" || phase == "Failed");

    !(owned_by_daemonset || mirror || finished)
}

/// Drains nodes through the Kubernetes API around their VM replacement.
pub struct KubeNodeHook {
    client: kube::Client,
    drain_timeout: Duration,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl KubeNodeHook {
    pub const fn new(client: kube::Client) -> Self {
        Self {
            client,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub const fn with_timeouts(mut self, drain: Duration, ready: Duration) -> Self {
        self.drain_timeout = drain;
        self.ready_timeout = ready;
        self
    }

    /// Mark the node unschedulable. Returns false if the node does not exist.
    async fn cordon(&self, name: &str) -> Result<bool, HookError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "spec": { "unschedulable": true } });
        match nodes
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(HookError::new(format!("Failed to cordon node {name}: {e}"))),
        }
    }

    async fn uncordon(&self, name: &str) -> Result<(), HookError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "spec": { "unschedulable": false } });
        nodes
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|e| HookError::new(format!("Failed to uncordon node {name}: {e}")))
    }

    /// Remove the Node object. A missing node counts as removed.
    async fn delete_node(&self, name: &str) -> Result<(), HookError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(node = name, "Deleted node object");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(HookError::new(format!("Failed to delete node {name}: {e}"))),
        }
    }

    async fn evictable_pods(&self, name: &str) -> Result<Vec<Pod>, HookError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={name}")))
            .await
            .map_err(|e| HookError::new(format!("Failed to list pods on {name}: {e}")))?;
        Ok(list.items.into_iter().filter(should_evict).collect())
    }

    /// Evict every evictable pod, retrying blocked evictions until the
    /// drain deadline.
    async fn drain(&self, name: &str) -> Result<(), HookError> {
        let deadline = Instant::now() + self.drain_timeout;

        loop {
            let pods = self.evictable_pods(name).await?;
            if pods.is_empty() {
                info!(node = name, "Node drained");
                return Ok(());
            }

            debug!(node = name, pods = pods.len(), "Evicting pods");
            for pod in &pods {
                let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
                let Some(pod_name) = pod.metadata.name.as_deref() else {
                    continue;
                };
                let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                match api.evict(pod_name, &EvictParams::default()).await {
                    Ok(_) => debug!(node = name, pod = pod_name, namespace, "Evicted pod"),
                    Err(kube::Error::Api(e)) if e.code == 404 => {}
                    Err(e) => {
                        warn!(node = name, pod = pod_name, namespace, error = %e, "Eviction blocked, will retry");
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(HookError::new(format!(
                    "Timed out after {}s draining node {name}, {} pods remaining",
                    self.drain_timeout.as_secs(),
                    pods.len()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl NodeHook for KubeNodeHook {
    async fn before_delete(&self, vm_name: &str) -> Result<(), HookError> {
        let name = node_name(vm_name);
        if !self.cordon(&name).await? {
            warn!(node = %name, "Node not registered in Kubernetes, skipping drain");
            return Ok(());
        }
        info!(node = %name, "Cordoned node");
        self.drain(&name).await?;
        self.delete_node(&name).await
    }

    async fn after_provision(&self, vm_name: &str) -> Result<(), HookError> {
        let name = node_name(vm_name);
        let nodes: Api<Node> = Api::all(self.client.clone());
        let deadline = Instant::now() + self.ready_timeout;

        loop {
            match nodes.get_opt(&name).await {
                Ok(Some(node)) if is_node_ready(&node) => {
                    if is_cordoned(&node) {
                        self.uncordon(&name).await?;
                        info!(node = %name, "Uncordoned node");
                    }
                    info!(node = %name, "Node is Ready");
                    return Ok(());
                }
                Ok(_) => debug!(node = %name, "Waiting for node to become Ready"),
                Err(e) => warn!(node = %name, error = %e, "Failed to get node, will retry"),
            }

            if Instant::now() >= deadline {
                return Err(HookError::new(format!(
                    "Node {name} did not become Ready within {}s",
                    self.ready_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

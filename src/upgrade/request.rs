//! Upgrade inputs and outputs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::topology::{ClusterTopology, PoolRole};
use crate::api::ContainerService;

/// Immutable input of one upgrade run.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    subscription_id: Uuid,
    resource_group: String,
    cluster: ContainerService,
    name_suffix: String,
    agent_pools: BTreeSet<String>,
    engine_version: String,
    template: Value,
    parameters: Map<String, Value>,
    kube_config: Option<PathBuf>,
}

impl UpgradeRequest {
    /// The target version is the cluster's orchestrator version.
    pub fn new<I, S>(
        subscription_id: Uuid,
        resource_group: impl Into<String>,
        cluster: ContainerService,
        name_suffix: impl Into<String>,
        agent_pools: I,
        engine_version: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subscription_id,
            resource_group: resource_group.into(),
            cluster,
            name_suffix: name_suffix.into(),
            agent_pools: agent_pools.into_iter().map(Into::into).collect(),
            engine_version: engine_version.into(),
            template: Value::Object(Map::new()),
            parameters: Map::new(),
            kube_config: None,
        }
    }

    /// Rendered ARM template and its base parameters.
    #[must_use]
    pub fn with_template(mut self, template: Value, parameters: Map<String, Value>) -> Self {
        self.template = template;
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn with_kube_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.kube_config = Some(path.into());
        self
    }

    pub const fn subscription_id(&self) -> &Uuid {
        &self.subscription_id
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    pub const fn cluster(&self) -> &ContainerService {
        &self.cluster
    }

    pub fn name_suffix(&self) -> &str {
        &self.name_suffix
    }

    pub const fn agent_pools(&self) -> &BTreeSet<String> {
        &self.agent_pools
    }

    pub fn target_version(&self) -> &str {
        self.cluster.orchestrator_version()
    }

    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    pub const fn template(&self) -> &Value {
        &self.template
    }

    pub const fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn kube_config(&self) -> Option<&Path> {
        self.kube_config.as_deref()
    }

    /// Masters are always in scope; agent pools only when requested.
    pub fn is_in_scope(&self, role: &PoolRole) -> bool {
        match role {
            PoolRole::Master => true,
            PoolRole::Agent(pool) => self.agent_pools.contains(pool),
        }
    }
}

/// Terminal output of a successful run.
#[derive(Debug, Clone)]
pub struct UpgradeResult {
    pub topology: ClusterTopology,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl UpgradeResult {
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }

    pub fn upgraded_count(&self) -> usize {
        self.topology.upgraded_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> UpgradeRequest {
        UpgradeRequest::new(
            Uuid::nil(),
            "rg",
            ContainerService::mock("c", "1.7.16", 1, 1, false),
            "12345678",
            ["agentpool1"],
            "0.1.0",
        )
    }

    #[test]
    fn test_target_version_comes_from_cluster() {
        assert_eq!(request().target_version(), "1.7.16");
    }

    #[test]
    fn test_scope() {
        let req = request();
        assert!(req.is_in_scope(&PoolRole::Master));
        assert!(req.is_in_scope(&PoolRole::Agent("agentpool1".to_string())));
        assert!(!req.is_in_scope(&PoolRole::Agent("gpu".to_string())));
    }

    #[test]
    fn test_defaults_and_builders() {
        let req = request();
        assert!(req.kube_config().is_none());
        assert!(req.parameters().is_empty());

        let mut params = Map::new();
        params.insert("location".to_string(), serde_json::json!({"value": "westus2"}));
        let req = req
            .with_template(serde_json::json!({"resources": []}), params)
            .with_kube_config("/tmp/kubeconfig");
        assert_eq!(req.kube_config(), Some(Path::new("/tmp/kubeconfig")));
        assert_eq!(req.parameters().len(), 1);
        assert!(req.template().get("resources").is_some());
    }
}

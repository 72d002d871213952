//! Container service configuration model (the cluster "api model").
//!
//! Only the fields the upgrade needs are modelled; unknown fields in the
//! document are ignored on load.

use serde::{Deserialize, Serialize};

/// Pool name used by master VMs in the `poolName` tag.
pub const MASTER_POOL_NAME: &str = "master";

/// Orchestrator type recorded in the `orchestrator` tag of every node.
pub const KUBERNETES: &str = "Kubernetes";

/// A deployed container service (one cluster).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerService {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    pub orchestrator_profile: OrchestratorProfile,
    pub master_profile: MasterProfile,
    #[serde(default)]
    pub agent_pool_profiles: Vec<AgentPoolProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorProfile {
    #[serde(default = "default_orchestrator_type")]
    pub orchestrator_type: String,
    #[serde(default)]
    pub orchestrator_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_config: Option<KubernetesConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    #[serde(default)]
    pub use_managed_identity: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterProfile {
    pub count: usize,
    #[serde(default)]
    pub dns_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_size: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPoolProfile {
    pub name: String,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_size: Option<String>,
}

fn default_orchestrator_type() -> String {
    KUBERNETES.to_string()
}

impl ContainerService {
    /// Parse an api model document.
    pub fn from_json(document: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(document)
    }

    /// The orchestrator version the cluster should run after the upgrade.
    pub fn orchestrator_version(&self) -> &str {
        &self.properties.orchestrator_profile.orchestrator_version
    }

    pub fn orchestrator_type(&self) -> &str {
        &self.properties.orchestrator_profile.orchestrator_type
    }

    /// Override the orchestrator version (e.g. from `--upgrade-version`).
    #[must_use]
    pub fn with_orchestrator_version(mut self, version: impl Into<String>) -> Self {
        self.properties.orchestrator_profile.orchestrator_version = version.into();
        self
    }

    /// Returns true if VMs authenticate to ARM through managed identity.
    pub fn use_managed_identity(&self) -> bool {
        self.properties
            .orchestrator_profile
            .kubernetes_config
            .as_ref()
            .is_some_and(|k| k.use_managed_identity)
    }

    pub const fn master_count(&self) -> usize {
        self.properties.master_profile.count
    }

    pub fn agent_pool(&self, name: &str) -> Option<&AgentPoolProfile> {
        self.properties
            .agent_pool_profiles
            .iter()
            .find(|p| p.name == name)
    }

    /// Build a small cluster definition for tests and local experiments.
    ///
    /// The single agent pool is named `agentpool1`.
    pub fn mock(
        name: &str,
        orchestrator_version: &str,
        master_count: usize,
        agent_count: usize,
        use_managed_identity: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            location: "westus2".to_string(),
            properties: Properties {
                orchestrator_profile: OrchestratorProfile {
                    orchestrator_type: KUBERNETES.to_string(),
                    orchestrator_version: orchestrator_version.to_string(),
                    kubernetes_config: use_managed_identity.then(|| KubernetesConfig {
                        use_managed_identity,
                    }),
                },
                master_profile: MasterProfile {
                    count: master_count,
                    dns_prefix: format!("{name}-dns"),
                    vm_size: Some("Standard_D2_v2".to_string()),
                },
                agent_pool_profiles: vec![AgentPoolProfile {
                    name: "agentpool1".to_string(),
                    count: agent_count,
                    vm_size: Some("Standard_D2_v2".to_string()),
                }],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const API_MODEL: &str = r#"{
        "name": "prod-eastus",
        "location": "eastus",
        "properties": {
            "orchestratorProfile": {
                "orchestratorType": "Kubernetes",
                "orchestratorVersion": "1.8.4",
                "kubernetesConfig": { "useManagedIdentity": true, "networkPolicy": "calico" }
            },
            "masterProfile": { "count": 3, "dnsPrefix": "prod-eastus", "vmSize": "Standard_D4_v2" },
            "agentPoolProfiles": [
                { "name": "agentpool1", "count": 5, "vmSize": "Standard_D8_v3" },
                { "name": "gpu", "count": 2 }
            ],
            "linuxProfile": { "adminUsername": "azureuser" }
        }
    }"#;

    #[test]
    fn test_from_json_ignores_unknown_fields() {
        let cs = ContainerService::from_json(API_MODEL).unwrap();
        assert_eq!(cs.orchestrator_version(), "1.8.4");
        assert_eq!(cs.master_count(), 3);
        assert_eq!(cs.properties.agent_pool_profiles.len(), 2);
        assert!(cs.use_managed_identity());
    }

    #[test]
    fn test_agent_pool_lookup() {
        let cs = ContainerService::from_json(API_MODEL).unwrap();
        assert_eq!(cs.agent_pool("gpu").map(|p| p.count), Some(2));
        assert!(cs.agent_pool("missing").is_none());
    }

    #[test]
    fn test_orchestrator_type_defaults_to_kubernetes() {
        let cs = ContainerService::from_json(
            r#"{"properties": {"orchestratorProfile": {}, "masterProfile": {"count": 1}}}"#,
        )
        .unwrap();
        assert_eq!(cs.orchestrator_type(), KUBERNETES);
        assert!(!cs.use_managed_identity());
        assert!(cs.properties.agent_pool_profiles.is_empty());
    }

    #[test]
    fn test_with_orchestrator_version() {
        let cs = ContainerService::mock("c", "1.7.9", 1, 1, false).with_orchestrator_version("1.7.16");
        assert_eq!(cs.orchestrator_version(), "1.7.16");
    }

    #[test]
    fn test_mock_managed_identity() {
        assert!(ContainerService::mock("c", "1.7.16", 3, 2, true).use_managed_identity());
        assert!(!ContainerService::mock("c", "1.7.16", 3, 2, false).use_managed_identity());
    }
}

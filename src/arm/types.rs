//! ARM resource shapes used by the upgrade.
//!
//! Field names follow the ARM JSON wire format so the REST client can
//! deserialize responses directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A compute virtual machine as returned by ARM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub properties: VirtualMachineProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<VirtualMachineIdentity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_profile: Option<StorageProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_profile: Option<NetworkProfile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_disk: Option<OsDiskSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsDiskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vhd: Option<VirtualHardDisk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_disk: Option<ManagedDiskParameters>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualHardDisk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedDiskParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfile {
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceReference {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// A role assignment binding a principal to a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Location of a page blob backing an unmanaged OS disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocation {
    pub account: String,
    pub container: String,
    pub blob: String,
}

/// The OS disk that must be removed together with its VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsDisk {
    Vhd(BlobLocation),
    Managed { name: String },
}

impl VirtualMachine {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.as_ref()?.get(key).map(String::as_str)
    }

    pub fn provisioning_state(&self) -> Option<&str> {
        self.properties.provisioning_state.as_deref()
    }

    /// Resource IDs of all attached network interfaces.
    pub fn nic_ids(&self) -> Vec<String> {
        self.properties
            .network_profile
            .as_ref()
            .map(|np| np.network_interfaces.iter().map(|n| n.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Resolve the OS disk, preferring the VHD blob for unmanaged disks.
    pub fn os_disk(&self) -> Option<OsDisk> {
        let disk = self.properties.storage_profile.as_ref()?.os_disk.as_ref()?;

        if let Some(location) = disk
            .vhd
            .as_ref()
            .and_then(|v| v.uri.as_deref())
            .and_then(split_blob_uri)
        {
            return Some(OsDisk::Vhd(location));
        }

        disk.managed_disk.as_ref()?;
        let name = disk.name.clone().or_else(|| {
            disk.managed_disk
                .as_ref()
                .and_then(|m| m.id.as_deref())
                .and_then(resource_name)
                .map(str::to_string)
        })?;
        Some(OsDisk::Managed { name })
    }

    /// Principal ID of the system-assigned identity, if one is bound.
    pub fn principal_id(&self) -> Option<&str> {
        self.identity.as_ref()?.principal_id.as_deref()
    }
}

/// Last path segment of an ARM resource ID.
pub fn resource_name(resource_id: &str) -> Option<&str> {
    resource_id
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
}

/// Split `https://<account>.blob.core.windows.net/<container>/<blob>`.
pub fn split_blob_uri(uri: &str) -> Option<BlobLocation> {
    let rest = uri
        .strip_prefix("https://")
        .or_else(|| uri.strip_prefix("http://"))?;
    let (host, path) = rest.split_once('/')?;
    let account = host.split('.').next().filter(|s| !s.is_empty())?;
    let (container, blob) = path.split_once('/')?;
    if container.is_empty() || blob.is_empty() {
        return None;
    }
    Some(BlobLocation {
        account: account.to_string(),
        container: container.to_string(),
        blob: blob.to_string(),
    })
}

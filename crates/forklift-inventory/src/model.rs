//! Inventory resource descriptions
//!
//! The inventory normalizes every source platform to these shapes. Fields
//! that only some platforms report are optional or defaulted; aliases accept
//! the per-platform spelling (`file`/`datastore` on vSphere,
//! `storageDomain` on oVirt).

use forklift_common::crd::{ProviderType, Ref};
use serde::{Deserialize, Serialize};

/// Identity of a provider in the inventory URL space
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProviderKey {
    /// Provider type
    pub type_: ProviderType,
    /// Provider UID (`metadata.uid`)
    pub uid: String,
}

impl ProviderKey {
    /// Build a key
    pub fn new(type_: ProviderType, uid: impl Into<String>) -> Self {
        Self {
            type_,
            uid: uid.into(),
        }
    }

    /// `/providers/<type>/<uid>`
    pub fn root(&self) -> String {
        format!("/providers/{}/{}", self.type_, self.uid)
    }
}

/// Provider as seen by the inventory
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    /// Provider UID
    #[serde(default)]
    pub uid: String,
    /// Provider name
    #[serde(default)]
    pub name: String,
    /// Collector status
    #[serde(default)]
    pub status: String,
    /// Number of VMs discovered
    #[serde(default)]
    pub vm_count: u64,
}

impl ProviderInfo {
    /// Whether the collector finished its initial load and is connected
    pub fn is_ready(&self) -> bool {
        self.status.eq_ignore_ascii_case("ready")
    }
}

/// Risk reported by the inventory for a VM
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Concern {
    /// Label
    #[serde(default, alias = "name")]
    pub label: String,
    /// Critical, Warning or Information
    #[serde(default, alias = "severity")]
    pub category: String,
    /// Details
    #[serde(default)]
    pub assessment: String,
}

/// Virtual disk of a VM
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Disk identifier (the backing file on vSphere)
    #[serde(alias = "file")]
    pub id: String,
    /// Capacity in bytes
    #[serde(default)]
    pub capacity: u64,
    /// Datastore / storage domain / volume type holding the disk
    #[serde(default, alias = "datastore", alias = "storageDomain")]
    pub storage: Ref,
    /// Shared between VMs
    #[serde(default)]
    pub shared: bool,
}

/// Network interface of a VM
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Nic {
    /// MAC address
    #[serde(default)]
    pub mac: String,
    /// Attached network
    #[serde(default)]
    pub network: Ref,
}

/// Source virtual machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    /// ID
    pub id: String,
    /// Name
    #[serde(default)]
    pub name: String,
    /// Inventory path
    #[serde(default)]
    pub path: String,
    /// Platform power state string
    #[serde(default)]
    pub power_state: String,
    /// Firmware (bios/efi)
    #[serde(default)]
    pub firmware: String,
    /// vCPUs
    #[serde(default)]
    pub cpu_count: u32,
    /// Memory in MiB
    #[serde(default, alias = "memoryMB")]
    pub memory_mb: u64,
    /// Changed block tracking enabled (warm prerequisite on vSphere)
    #[serde(default)]
    pub change_tracking_enabled: bool,
    /// NICs
    #[serde(default)]
    pub nics: Vec<Nic>,
    /// Networks referenced by the VM
    #[serde(default)]
    pub networks: Vec<Ref>,
    /// Disks
    #[serde(default)]
    pub disks: Vec<Disk>,
    /// Concerns
    #[serde(default)]
    pub concerns: Vec<Concern>,
    /// Image the VM boots from (OpenStack)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

impl Vm {
    /// Reference to this VM
    pub fn reference(&self) -> Ref {
        Ref::by_id(self.id.clone()).with_name(self.name.clone())
    }

    /// Networks from both `networks` and NIC attachments, deduplicated by key
    pub fn referenced_networks(&self) -> Vec<Ref> {
        let mut seen = Vec::<Ref>::new();
        for r in self.networks.iter().chain(self.nics.iter().map(|n| &n.network)) {
            if !r.is_empty() && !seen.iter().any(|s| s.key() == r.key()) {
                seen.push(r.clone());
            }
        }
        seen
    }

    /// Storage referenced by the VM's disks, deduplicated by key
    pub fn referenced_storage(&self) -> Vec<Ref> {
        let mut seen = Vec::<Ref>::new();
        for d in &self.disks {
            if !d.storage.is_empty() && !seen.iter().any(|s| s.key() == d.storage.key()) {
                seen.push(d.storage.clone());
            }
        }
        seen
    }

    /// Total disk capacity in bytes
    pub fn total_capacity(&self) -> u64 {
        self.disks.iter().map(|d| d.capacity).sum()
    }
}

/// Source network
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    /// ID
    pub id: String,
    /// Name
    #[serde(default)]
    pub name: String,
    /// VLAN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<String>,
}

/// Source storage (datastore, storage domain, volume type)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    /// ID
    pub id: String,
    /// Name
    #[serde(default)]
    pub name: String,
    /// Capacity in bytes
    #[serde(default)]
    pub capacity: u64,
}

/// Collection of a resource family under a provider root
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collection {
    /// VMs
    Vms,
    /// Networks
    Networks,
    /// Datastores and equivalents
    Storage,
}

impl Collection {
    /// URL segment for this collection on a provider type
    pub fn segment(&self, type_: ProviderType) -> &'static str {
        match (self, type_) {
            (Self::Vms, _) => "vms",
            (Self::Networks, ProviderType::OpenShift) => "networkattachmentdefinitions",
            (Self::Networks, _) => "networks",
            (Self::Storage, ProviderType::VSphere) => "datastores",
            (Self::Storage, ProviderType::Ovirt) => "storagedomains",
            (Self::Storage, ProviderType::OpenStack) => "volumetypes",
            (Self::Storage, ProviderType::OpenShift) => "storageclasses",
            (Self::Storage, ProviderType::HyperV | ProviderType::Ova) => "storages",
        }
    }

    /// Kind name used in errors
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Vms => "vm",
            Self::Networks => "network",
            Self::Storage => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsphere_vm_json_parses_with_aliases() {
        let json = r#"{
            "id": "vm-101",
            "name": "db-01",
            "powerState": "poweredOn",
            "memoryMB": 8192,
            "changeTrackingEnabled": true,
            "networks": [{"id": "network-7"}],
            "nics": [{"mac": "00:50:56:aa", "network": {"id": "network-7"}}],
            "disks": [
                {"file": "[ds1] db-01/db-01.vmdk", "capacity": 42949672960, "datastore": {"id": "datastore-12"}},
                {"file": "[ds1] db-01/db-01_1.vmdk", "capacity": 1073741824, "datastore": {"id": "datastore-12"}}
            ]
        }"#;
        let vm: Vm = serde_json::from_str(json).unwrap();
        assert_eq!(vm.memory_mb, 8192);
        assert_eq!(vm.disks[0].id, "[ds1] db-01/db-01.vmdk");
        assert_eq!(vm.referenced_networks().len(), 1);
        assert_eq!(vm.referenced_storage(), vec![Ref::by_id("datastore-12")]);
        assert_eq!(vm.total_capacity(), 42949672960 + 1073741824);
    }

    #[test]
    fn ovirt_disk_uses_storage_domain() {
        let disk: Disk =
            serde_json::from_str(r#"{"id": "d1", "storageDomain": {"id": "sd-1"}}"#).unwrap();
        assert_eq!(disk.storage.id.as_deref(), Some("sd-1"));
    }

    #[test]
    fn collection_segments_follow_provider() {
        assert_eq!(Collection::Storage.segment(ProviderType::VSphere), "datastores");
        assert_eq!(Collection::Storage.segment(ProviderType::Ovirt), "storagedomains");
        assert_eq!(Collection::Networks.segment(ProviderType::OpenStack), "networks");
        assert_eq!(
            ProviderKey::new(ProviderType::Ovirt, "abc").root(),
            "/providers/ovirt/abc"
        );
    }
}

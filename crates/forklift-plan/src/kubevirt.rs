//! KubeVirt and CDI manifests for target VMs
//!
//! Manifests are built as [`DynamicObject`]s so the controller does not
//! depend on generated KubeVirt types. Names derive from the target VM name
//! and the disk index, so a repeated create recognizes the existing object.

use std::collections::BTreeMap;

use forklift_common::crd::{DestinationStorage, NetworkPair, NetworkType, Ref};
use forklift_common::{Reason, MIGRATION_LABEL, PLAN_LABEL, VM_LABEL};
use forklift_inventory::Vm;
use forklift_populator::{dns_name, label_value};
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use serde_json::{json, Value};

use crate::error::PlanError;

/// CDI DataVolume
pub fn data_volume_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("cdi.kubevirt.io", "v1beta1", "DataVolume"))
}

/// KubeVirt VirtualMachine
pub fn virtual_machine_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("kubevirt.io", "v1", "VirtualMachine"))
}

/// Multus NetworkAttachmentDefinition
pub fn network_attachment_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "k8s.cni.cncf.io",
        "v1",
        "NetworkAttachmentDefinition",
    ))
}

/// Labels tying a target object to its plan, migration and source VM
pub fn owner_labels(plan: &str, migration: &str, vm: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (PLAN_LABEL.to_string(), label_value(plan)),
        (MIGRATION_LABEL.to_string(), label_value(migration)),
        (VM_LABEL.to_string(), label_value(vm)),
    ])
}

/// Name of the DataVolume backing disk `index` of a target VM
pub fn data_volume_name(target: &str, index: usize) -> String {
    dns_name(&format!("{target}-disk-{index}"))
}

/// Inputs of [`data_volume`]
#[derive(Clone, Debug)]
pub struct DataVolumeRequest<'a> {
    /// Object name
    pub name: &'a str,
    /// Target namespace
    pub namespace: &'a str,
    /// Size in bytes
    pub capacity: u64,
    /// Mapped storage class and modes
    pub storage: &'a DestinationStorage,
    /// Labels
    pub labels: &'a BTreeMap<String, String>,
    /// Source disk ID, kept as an annotation
    pub disk: &'a str,
}

/// Blank DataVolume a populator or converter fills
pub fn data_volume(request: &DataVolumeRequest<'_>) -> Result<DynamicObject, PlanError> {
    let mut storage = json!({
        "storageClassName": request.storage.storage_class,
        "resources": { "requests": { "storage": request.capacity.to_string() } },
    });
    if let Some(mode) = &request.storage.access_mode {
        storage["accessModes"] = json!([mode]);
    }
    if let Some(mode) = &request.storage.volume_mode {
        storage["volumeMode"] = json!(mode);
    }
    into_object(json!({
        "apiVersion": "cdi.kubevirt.io/v1beta1",
        "kind": "DataVolume",
        "metadata": {
            "name": request.name,
            "namespace": request.namespace,
            "labels": request.labels,
            "annotations": {
                "forklift.konveyor.io/disk-source": request.disk,
                "cdi.kubevirt.io/storage.bind.immediate.requested": "true",
            },
        },
        "spec": {
            "source": { "blank": {} },
            "storage": storage,
        },
    }))
}

/// Inputs of [`virtual_machine`]
#[derive(Clone, Debug)]
pub struct VmRequest<'a> {
    /// Target VM name
    pub name: &'a str,
    /// Target namespace
    pub namespace: &'a str,
    /// Source VM as described by the inventory
    pub source: &'a Vm,
    /// DataVolume names in source disk order
    pub volumes: &'a [String],
    /// Frozen network mapping
    pub networks: &'a [NetworkPair],
    /// Start the VM once created
    pub running: bool,
    /// Labels
    pub labels: &'a BTreeMap<String, String>,
}

/// VirtualMachine referencing the populated volumes and mapped networks
pub fn virtual_machine(request: &VmRequest<'_>) -> Result<DynamicObject, PlanError> {
    let source = request.source;
    let mut interfaces = Vec::new();
    let mut networks = Vec::new();
    let mut pod_attached = false;

    for (i, nic) in source.nics.iter().enumerate() {
        let pair = find_network(request.networks, &nic.network).ok_or_else(|| {
            PlanError::permanent(
                Reason::NetworkNotMapped,
                format!("network {} of NIC {} is not mapped", nic.network, nic.mac),
            )
        })?;
        let name = format!("net-{i}");
        match pair.destination.type_ {
            NetworkType::Ignored => continue,
            NetworkType::Pod => {
                if pod_attached {
                    return Err(PlanError::permanent(
                        Reason::CreateVmFailed,
                        "more than one NIC is mapped to the pod network",
                    ));
                }
                pod_attached = true;
                interfaces.push(json!({ "name": name, "masquerade": {}, "macAddress": nic.mac }));
                networks.push(json!({ "name": name, "pod": {} }));
            }
            NetworkType::Multus => {
                let nad = pair.destination.name.as_deref().unwrap_or_default();
                let ns = pair
                    .destination
                    .namespace
                    .as_deref()
                    .unwrap_or(request.namespace);
                interfaces.push(json!({ "name": name, "bridge": {}, "macAddress": nic.mac }));
                networks.push(json!({
                    "name": name,
                    "multus": { "networkName": format!("{ns}/{nad}") },
                }));
            }
        }
    }

    let disks: Vec<Value> = request
        .volumes
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let mut disk = json!({ "name": format!("vol-{i}"), "disk": { "bus": "virtio" } });
            if i == 0 {
                disk["bootOrder"] = json!(1);
            }
            disk
        })
        .collect();
    let volumes: Vec<Value> = request
        .volumes
        .iter()
        .enumerate()
        .map(|(i, dv)| json!({ "name": format!("vol-{i}"), "dataVolume": { "name": dv } }))
        .collect();

    let firmware = if source.firmware.eq_ignore_ascii_case("efi") {
        json!({ "bootloader": { "efi": { "secureBoot": false } } })
    } else {
        json!({ "bootloader": { "bios": {} } })
    };

    into_object(json!({
        "apiVersion": "kubevirt.io/v1",
        "kind": "VirtualMachine",
        "metadata": {
            "name": request.name,
            "namespace": request.namespace,
            "labels": request.labels,
        },
        "spec": {
            "running": request.running,
            "template": {
                "metadata": { "labels": request.labels },
                "spec": {
                    "domain": {
                        "cpu": { "cores": source.cpu_count.max(1) },
                        "memory": { "guest": format!("{}Mi", source.memory_mb.max(1)) },
                        "firmware": firmware,
                        "devices": { "disks": disks, "interfaces": interfaces },
                    },
                    "networks": networks,
                    "volumes": volumes,
                },
            },
        },
    }))
}

fn find_network<'a>(pairs: &'a [NetworkPair], network: &Ref) -> Option<&'a NetworkPair> {
    pairs.iter().find(|p| p.source.matches(network))
}

fn into_object(value: Value) -> Result<DynamicObject, PlanError> {
    serde_json::from_value(value)
        .map_err(|e| PlanError::permanent(Reason::Serialization, format!("invalid manifest: {e}")))
}

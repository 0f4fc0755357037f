//! Populator worker identity and specification
//!
//! A worker is identified by its (migration, vm, disk) triple. The name and
//! labels derived from the triple are deterministic so a restarted
//! controller finds the worker it created before.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use forklift_adapter::DiskHandle;
use forklift_common::crd::ProviderType;
use forklift_common::{DISK_LABEL, MIGRATION_LABEL, POPULATOR_LABEL, VM_LABEL};

use crate::error::PopulatorError;

/// Annotation holding the unsanitized disk ID
pub const DISK_ANNOTATION: &str = "forklift.konveyor.io/disk-id";

/// Mount point of the provider secret inside a worker
pub const SECRET_PATH: &str = "/etc/secret";

/// Block device path of the target volume inside a worker
pub const VOLUME_PATH: &str = "/dev/block";

const MAX_NAME: usize = 63;

/// Populator implementation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// Array-side copy offload from a vSphere datastore
    VsphereXcopy,
    /// VDDK read from vSphere
    VsphereDirect,
    /// oVirt imageio transfer
    OvirtImageTransfer,
    /// OpenStack Glance image download
    OpenstackGlance,
    /// Extraction from an OVA archive
    OvaExtract,
}

impl WorkerKind {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VsphereXcopy => "vsphere-xcopy",
            Self::VsphereDirect => "vsphere-direct",
            Self::OvirtImageTransfer => "ovirt-image-transfer",
            Self::OpenstackGlance => "openstack-glance",
            Self::OvaExtract => "ova-extract",
        }
    }

    /// Worker-specific arguments
    fn extra_args(&self) -> &'static [&'static str] {
        match self {
            Self::VsphereXcopy => &["--offload"],
            Self::VsphereDirect => &["--transport=vddk"],
            Self::OvirtImageTransfer => &["--transport=imageio"],
            Self::OpenstackGlance => &["--transport=glance"],
            Self::OvaExtract => &["--transport=file"],
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Choose the worker for a source type and target storage class
///
/// `storage_offload` is true when the target storage class supports
/// array-side copy from the source datastore.
pub fn select_worker(
    source: ProviderType,
    storage_offload: bool,
) -> Result<WorkerKind, PopulatorError> {
    match source {
        ProviderType::VSphere if storage_offload => Ok(WorkerKind::VsphereXcopy),
        ProviderType::VSphere => Ok(WorkerKind::VsphereDirect),
        ProviderType::Ovirt => Ok(WorkerKind::OvirtImageTransfer),
        ProviderType::OpenStack => Ok(WorkerKind::OpenstackGlance),
        ProviderType::Ova => Ok(WorkerKind::OvaExtract),
        other => Err(PopulatorError::UnsupportedSource(other)),
    }
}

/// Identity of one disk within one migration
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskKey {
    /// Migration name
    pub migration: String,
    /// Source VM ID
    pub vm: String,
    /// Source disk ID
    pub disk: String,
}

impl DiskKey {
    /// Build a key
    pub fn new(
        migration: impl Into<String>,
        vm: impl Into<String>,
        disk: impl Into<String>,
    ) -> Self {
        Self {
            migration: migration.into(),
            vm: vm.into(),
            disk: disk.into(),
        }
    }

    /// Deterministic worker name
    pub fn worker_name(&self) -> String {
        dns_name(&format!(
            "populate-{}-{}-{}",
            self.migration, self.vm, self.disk
        ))
    }

    /// Labels identifying the triple
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MIGRATION_LABEL.to_string(), label_value(&self.migration)),
            (VM_LABEL.to_string(), label_value(&self.vm)),
            (DISK_LABEL.to_string(), label_value(&self.disk)),
        ])
    }

    /// Selector matching this triple's workers
    pub fn selector(&self) -> String {
        selector(&self.labels())
    }
}

impl fmt::Display for DiskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.migration, self.vm, self.disk)
    }
}

/// Selector over every worker of a migration, optionally one VM
pub fn scope_selector(migration: &str, vm: Option<&str>) -> String {
    let mut labels = BTreeMap::from([(MIGRATION_LABEL.to_string(), label_value(migration))]);
    if let Some(vm) = vm {
        labels.insert(VM_LABEL.to_string(), label_value(vm));
    }
    labels.insert(POPULATOR_LABEL.to_string(), String::new());
    selector(&labels)
}

fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{k}={v}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Everything needed to start a worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Triple
    pub key: DiskKey,
    /// Worker name
    pub name: String,
    /// Namespace (the plan's target namespace)
    pub namespace: String,
    /// Implementation
    pub kind: WorkerKind,
    /// Container image
    pub image: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Container arguments
    pub args: Vec<String>,
    /// Provider secret mounted at [`SECRET_PATH`]
    pub secret: String,
    /// Target claim attached at [`VOLUME_PATH`]
    pub claim: String,
}

/// Inputs of [`WorkerSpec::build`]
#[derive(Clone, Debug)]
pub struct WorkerRequest<'a> {
    /// Triple
    pub key: DiskKey,
    /// Namespace
    pub namespace: &'a str,
    /// Implementation
    pub kind: WorkerKind,
    /// Container image
    pub image: &'a str,
    /// Source descriptor from the adapter
    pub handle: &'a DiskHandle,
    /// Provider secret name
    pub secret: &'a str,
    /// Target claim name
    pub claim: &'a str,
    /// Owning custom resource (the Migration)
    pub owner_name: &'a str,
}

impl WorkerSpec {
    /// Derive the worker specification
    pub fn build(request: WorkerRequest<'_>) -> Self {
        let WorkerRequest {
            key,
            namespace,
            kind,
            image,
            handle,
            secret,
            claim,
            owner_name,
        } = request;

        let mut args = vec![
            format!("--source-url={}", handle.url),
            format!("--secret-path={SECRET_PATH}"),
            format!("--disk-id={}", handle.disk_id),
            format!("--volume-path={VOLUME_PATH}"),
            format!("--cr-name={owner_name}"),
            format!("--cr-namespace={namespace}"),
        ];
        args.extend(kind.extra_args().iter().map(|a| a.to_string()));
        if let Some(snapshot) = &handle.snapshot {
            args.push(format!("--snapshot={snapshot}"));
        }
        args.extend(
            handle
                .options
                .iter()
                .map(|(k, v)| format!("--{}={v}", kebab(k))),
        );

        let mut labels = key.labels();
        labels.insert(POPULATOR_LABEL.to_string(), kind.as_str().to_string());
        let annotations = BTreeMap::from([(DISK_ANNOTATION.to_string(), key.disk.clone())]);

        Self {
            name: key.worker_name(),
            key,
            namespace: namespace.to_string(),
            kind,
            image: image.to_string(),
            labels,
            annotations,
            args,
            secret: secret.to_string(),
            claim: claim.to_string(),
        }
    }
}

/// Observed phase of a worker
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Scheduled, not yet running
    #[default]
    Pending,
    /// Running
    Running,
    /// Exited zero
    Succeeded,
    /// Exited non-zero
    Failed,
    /// Unknown to the runtime
    Unknown,
}

impl WorkerPhase {
    /// Parse a core/v1 Pod phase
    pub fn from_pod_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") | None => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            Some(_) => Self::Unknown,
        }
    }
}

/// A worker as observed in the cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Worker {
    /// Name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Phase
    pub phase: WorkerPhase,
    /// Container restarts
    pub restarts: u32,
    /// Creation time
    pub created: Option<DateTime<Utc>>,
    /// Termination message of the last failed run
    pub message: Option<String>,
    /// Address for metrics scraping
    pub ip: Option<String>,
}

/// Lowercase DNS-1123 name, shortened with a stable hash suffix when too long
pub fn dns_name(raw: &str) -> String {
    let mut name = String::with_capacity(raw.len());
    let mut dash = false;
    for c in raw.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            name.push(c);
            dash = false;
        } else if !dash {
            name.push('-');
            dash = true;
        }
    }
    let name = name.trim_matches('-').to_string();
    if name.len() <= MAX_NAME {
        return name;
    }
    let suffix = format!("{:08x}", fnv1a(raw));
    let keep = MAX_NAME - suffix.len() - 1;
    format!("{}-{suffix}", name[..keep].trim_end_matches('-'))
}

/// Label-safe value: alphanumerics, `-`, `_` and `.`, at most 63 characters
pub fn label_value(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if cleaned.len() <= MAX_NAME {
        return cleaned.to_string();
    }
    let suffix = format!("{:08x}", fnv1a(raw));
    let keep = MAX_NAME - suffix.len() - 1;
    format!("{}-{suffix}", &cleaned[..keep])
}

fn fnv1a(raw: &str) -> u32 {
    raw.bytes().fold(0x811c_9dc5u32, |hash, b| {
        (hash ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}

fn kebab(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use forklift_adapter::DiskSourceKind;
    use rstest::rstest;

    #[rstest]
    #[case::vsphere_offload(ProviderType::VSphere, true, WorkerKind::VsphereXcopy)]
    #[case::vsphere(ProviderType::VSphere, false, WorkerKind::VsphereDirect)]
    #[case::ovirt(ProviderType::Ovirt, false, WorkerKind::OvirtImageTransfer)]
    #[case::ovirt_ignores_offload(ProviderType::Ovirt, true, WorkerKind::OvirtImageTransfer)]
    #[case::openstack(ProviderType::OpenStack, false, WorkerKind::OpenstackGlance)]
    #[case::ova(ProviderType::Ova, false, WorkerKind::OvaExtract)]
    fn worker_selection(
        #[case] source: ProviderType,
        #[case] offload: bool,
        #[case] expected: WorkerKind,
    ) {
        assert_eq!(select_worker(source, offload).unwrap(), expected);
    }

    #[test]
    fn hyperv_has_no_populator() {
        assert!(matches!(
            select_worker(ProviderType::HyperV, false),
            Err(PopulatorError::UnsupportedSource(ProviderType::HyperV))
        ));
    }

    #[test]
    fn names_are_dns_safe_and_deterministic() {
        let key = DiskKey::new("mig-1", "vm-42", "[ds1] db/db.vmdk");
        assert_eq!(key.worker_name(), "populate-mig-1-vm-42-ds1-db-db-vmdk");
        assert_eq!(key.worker_name(), key.clone().worker_name());
    }

    #[test]
    fn long_names_keep_a_stable_suffix() {
        let key = DiskKey::new("m", "vm", "x".repeat(200));
        let name = key.worker_name();
        assert!(name.len() <= 63);
        assert_eq!(name, DiskKey::new("m", "vm", "x".repeat(200)).worker_name());
        assert_ne!(name, DiskKey::new("m", "vm", "x".repeat(201)).worker_name());
    }

    #[test]
    fn labels_are_sanitized() {
        let labels = DiskKey::new("mig-1", "vm-42", "[ds1] db/db.vmdk").labels();
        assert_eq!(labels[DISK_LABEL], "ds1__db_db.vmdk");
        assert_eq!(labels[VM_LABEL], "vm-42");
    }

    #[test]
    fn story_spec_carries_contract_arguments() {
        let handle = DiskHandle {
            kind: DiskSourceKind::Vddk,
            url: "https://vcenter/sdk".into(),
            disk_id: "[ds1] db/db.vmdk".into(),
            snapshot: Some("snapshot-3".into()),
            options: BTreeMap::from([("vddkInitImage".to_string(), "quay.io/vddk:8".to_string())]),
        };
        let spec = WorkerSpec::build(WorkerRequest {
            key: DiskKey::new("mig-1", "vm-42", "[ds1] db/db.vmdk"),
            namespace: "target",
            kind: WorkerKind::VsphereDirect,
            image: "quay.io/forklift/populator:latest",
            handle: &handle,
            secret: "vsphere-creds",
            claim: "mig-1-vm-42-disk-0",
            owner_name: "mig-1",
        });

        assert_eq!(spec.name, "populate-mig-1-vm-42-ds1-db-db-vmdk");
        for arg in [
            "--source-url=https://vcenter/sdk",
            "--secret-path=/etc/secret",
            "--disk-id=[ds1] db/db.vmdk",
            "--volume-path=/dev/block",
            "--cr-name=mig-1",
            "--cr-namespace=target",
            "--transport=vddk",
            "--snapshot=snapshot-3",
            "--vddk-init-image=quay.io/vddk:8",
        ] {
            assert!(spec.args.contains(&arg.to_string()), "missing {arg}");
        }
        assert_eq!(spec.labels[POPULATOR_LABEL], "vsphere-direct");
        assert_eq!(spec.annotations[DISK_ANNOTATION], "[ds1] db/db.vmdk");
    }

    #[test]
    fn scope_selector_narrows_to_vm() {
        assert_eq!(
            scope_selector("mig-1", Some("vm-42")),
            "forklift.konveyor.io/populator,migration=mig-1,vmID=vm-42"
        );
        assert_eq!(
            scope_selector("mig-1", None),
            "forklift.konveyor.io/populator,migration=mig-1"
        );
    }

    #[rstest]
    #[case::running(Some("Running"), WorkerPhase::Running)]
    #[case::absent(None, WorkerPhase::Pending)]
    #[case::failed(Some("Failed"), WorkerPhase::Failed)]
    #[case::odd(Some("Evicted"), WorkerPhase::Unknown)]
    fn pod_phase(#[case] raw: Option<&str>, #[case] expected: WorkerPhase) {
        assert_eq!(WorkerPhase::from_pod_phase(raw), expected);
    }
}

//! Migration CRD types
//!
//! A `Migration` is one execution attempt of a Plan. Its status holds the
//! mapping snapshot taken at start and the per-VM state the executor drives.

use chrono::{DateTime, Utc};
use forklift_itinerary::{Flag, Mode, Phase, Progress};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::mapping::{NetworkPair, StoragePair};
use super::provider::ProviderType;
use super::types::{find_condition, Condition, ObjectRef, Ref};

// =============================================================================
// Spec
// =============================================================================

/// Migration of a plan
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Migration",
    plural = "migrations",
    namespaced,
    status = "MigrationStatus",
    printcolumn = r#"{"name":"Plan","type":"string","jsonPath":".spec.plan.name"}"#,
    printcolumn = r#"{"name":"Running","type":"string","jsonPath":".status.conditions[?(@.type==\"Running\")].status"}"#,
    printcolumn = r#"{"name":"Succeeded","type":"string","jsonPath":".status.conditions[?(@.type==\"Succeeded\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSpec {
    /// The plan being executed
    pub plan: ObjectRef,

    /// Warm cutover time; defaults to one hour after start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutover: Option<DateTime<Utc>>,

    /// VMs to cancel
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancel: Vec<Ref>,
}

impl MigrationSpec {
    /// Whether a VM is in the cancel list
    pub fn is_canceled(&self, vm: &Ref) -> bool {
        self.cancel.iter().any(|c| c.matches(vm))
    }
}

// =============================================================================
// Snapshot of plan inputs
// =============================================================================

/// Resolved network/storage mapping, frozen when the migration starts
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MappingSnapshot {
    /// Migration mode
    pub mode: Mode,
    /// Source provider type
    pub source_type: ProviderType,
    /// Network pairs
    #[serde(default)]
    pub network: Vec<NetworkPair>,
    /// Storage pairs
    #[serde(default)]
    pub storage: Vec<StoragePair>,
    /// Target namespace
    #[serde(default)]
    pub target_namespace: String,
    /// Transfer network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_network: Option<ObjectRef>,
}

// =============================================================================
// VM status
// =============================================================================

/// Source power state
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PowerState {
    /// Running
    On,
    /// Stopped
    Off,
    /// Not known
    #[default]
    Unknown,
}

/// Phase of a pipeline step record
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum StepPhase {
    /// Not reached
    #[default]
    Pending,
    /// In progress
    Running,
    /// Done
    Completed,
    /// Failed
    Failed,
}

/// Record of one itinerary step for a VM
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    /// Itinerary phase
    pub name: Phase,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Step phase
    #[serde(default)]
    pub phase: StepPhase,
    /// When the step started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// When the step completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    /// Unit progress (bytes or percent depending on step)
    #[serde(default)]
    pub progress: Progress,
    /// Error message if the step failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Transfer state of one disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskStatus {
    /// Source disk ID
    pub id: String,
    /// Capacity in bytes
    #[serde(default)]
    pub capacity: u64,
    /// Source storage (datastore / storage domain)
    #[serde(default)]
    pub storage: Ref,
    /// Target DataVolume name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<String>,
    /// Bytes transferred in the current round
    #[serde(default)]
    pub transferred: u64,
    /// Bytes expected in the current round
    #[serde(default)]
    pub total: u64,
    /// Percent (0-100) in the current round
    #[serde(default)]
    pub percent: u32,
    /// Worker currently serving this disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Whether the current round finished
    #[serde(default)]
    pub done: bool,
    /// Changed-block baseline the next round is computed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
}

/// Kind of helper resource owned by a VM's migration
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum HelperKind {
    /// Target VirtualMachine
    VirtualMachine,
    /// Target DataVolume
    DataVolume,
    /// Target PersistentVolumeClaim
    PersistentVolumeClaim,
    /// Disk populator worker pod
    PopulatorWorker,
    /// Guest conversion pod
    ConversionPod,
    /// Image format converter pod
    ImageConverter,
    /// Hook job
    HookJob,
    /// Hook playbook ConfigMap
    HookConfigMap,
    /// Source snapshot
    Snapshot,
}

/// A helper resource created for a VM
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct HelperRef {
    /// Kind
    pub kind: HelperKind,
    /// Name (snapshot ID for snapshots)
    pub name: String,
}

/// Warm migration bookkeeping
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WarmStatus {
    /// Completed precopy rounds
    #[serde(default)]
    pub precopies: Vec<Precopy>,
    /// Next precopy round
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_precopy_at: Option<DateTime<Utc>>,
    /// Snapshot currently being created or shipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_snapshot: Option<String>,
    /// Snapshot the current deltas are relative to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_snapshot: Option<String>,
    /// Baseline pinned for the final round
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_baseline: Option<String>,
}

/// One precopy round
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Precopy {
    /// Snapshot shipped
    pub snapshot: String,
    /// Round start
    pub start: DateTime<Utc>,
    /// Round end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// Changed bytes shipped
    #[serde(default)]
    pub delta_bytes: u64,
}

/// Error descriptor for a VM
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmError {
    /// Phase the error happened in
    pub phase: Phase,
    /// Stable reason code
    pub reason: String,
    /// Messages, oldest first
    #[serde(default)]
    pub reasons: Vec<String>,
}

/// Per-VM, per-migration status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    /// Source VM ID
    pub id: String,
    /// Source VM name
    #[serde(default)]
    pub name: String,
    /// Target VM name
    #[serde(default)]
    pub target_name: String,
    /// Current phase
    #[serde(default)]
    pub phase: Phase,
    /// Flags the itinerary was filtered with
    #[serde(default)]
    pub flags: Flag,
    /// Step records
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline: Vec<StepStatus>,
    /// Step progress high-water mark
    #[serde(default)]
    pub progress: Progress,
    /// Conditions (Succeeded/Failed/Canceled)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskStatus>,
    /// Helper resources owned on this VM's behalf
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub helpers: Vec<HelperRef>,
    /// Power state at start
    #[serde(default)]
    pub restore_power_state: PowerState,
    /// Warm bookkeeping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm: Option<WarmStatus>,
    /// Transient failures in the current step
    #[serde(default)]
    pub retries: u32,
    /// Earliest time the current step may be retried
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the current phase was entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_started: Option<DateTime<Utc>>,
    /// Error descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VmError>,
    /// Started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// Completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
}

impl VmStatus {
    /// A fresh, not-yet-admitted VM
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Reference to the source VM
    pub fn vm_ref(&self) -> Ref {
        Ref::by_id(self.id.clone()).with_name(self.name.clone())
    }

    /// Whether the VM reached a terminal phase
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Whether the VM has been admitted and is not terminal
    pub fn is_running(&self) -> bool {
        self.phase != Phase::Pending && !self.phase.is_terminal()
    }

    /// Whether the VM migrated successfully
    pub fn succeeded(&self) -> bool {
        self.phase == Phase::Completed
    }

    /// Step record for a phase
    pub fn step(&self, phase: Phase) -> Option<&StepStatus> {
        self.pipeline.iter().find(|s| s.name == phase)
    }

    /// Mutable step record for a phase
    pub fn step_mut(&mut self, phase: Phase) -> Option<&mut StepStatus> {
        self.pipeline.iter_mut().find(|s| s.name == phase)
    }

    /// Record a helper resource, ignoring duplicates
    pub fn add_helper(&mut self, kind: HelperKind, name: impl Into<String>) {
        let helper = HelperRef {
            kind,
            name: name.into(),
        };
        if !self.helpers.contains(&helper) {
            self.helpers.push(helper);
        }
    }

    /// Forget a helper resource
    pub fn remove_helper(&mut self, kind: HelperKind, name: &str) {
        self.helpers.retain(|h| !(h.kind == kind && h.name == name));
    }

    /// Helpers of a kind
    pub fn helpers_of(&self, kind: HelperKind) -> impl Iterator<Item = &HelperRef> {
        self.helpers.iter().filter(move |h| h.kind == kind)
    }

    /// Disk by ID
    pub fn disk_mut(&mut self, id: &str) -> Option<&mut DiskStatus> {
        self.disks.iter_mut().find(|d| d.id == id)
    }

    /// Whether a condition of the given type is present
    pub fn has_condition(&self, type_: &str) -> bool {
        find_condition(&self.conditions, type_).is_some()
    }
}

// =============================================================================
// Status
// =============================================================================

/// Migration status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    /// The generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions (Running/Succeeded/Failed/Canceled)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,

    /// Completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,

    /// Effective cutover (warm only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutover: Option<DateTime<Utc>>,

    /// Frozen plan inputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<MappingSnapshot>,

    /// Per-VM status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vms: Vec<VmStatus>,
}

impl MigrationStatus {
    /// Whether the migration has started and not completed
    pub fn is_running(&self) -> bool {
        self.started.is_some() && self.completed.is_none()
    }

    /// VM status by source reference
    pub fn find_vm(&self, vm: &Ref) -> Option<&VmStatus> {
        self.vms.iter().find(|v| v.vm_ref().matches(vm))
    }
}

impl Migration {
    /// Whether this migration is running
    pub fn is_running(&self) -> bool {
        self.status.as_ref().is_some_and(MigrationStatus::is_running)
    }

    /// Whether this migration finished
    pub fn is_completed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.completed.is_some())
    }
}

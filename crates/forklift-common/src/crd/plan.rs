//! Plan CRD types
//!
//! A `Plan` is declarative intent: a set of source VMs, the provider pair,
//! and the network/storage mappings that decide where their NICs and disks
//! land on the destination cluster.

use chrono::{DateTime, Utc};
use forklift_itinerary::{Mode, Phase, Progress};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::mapping::ProviderPair;
use super::types::{Condition, ObjectRef, Ref};

/// Hook attached to a VM at a step
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookRef {
    /// Step name; must be `PreHook` or `PostHook`
    pub step: String,
    /// The Hook resource
    pub hook: ObjectRef,
}

/// A VM selected for migration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanVm {
    /// Source VM reference
    #[serde(flatten)]
    pub vm: Ref,

    /// Hooks for this VM
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookRef>,

    /// Name of the target VM; defaults to the source name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
}

/// Mapping references
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanMaps {
    /// NetworkMap
    pub network: ObjectRef,
    /// StorageMap
    pub storage: ObjectRef,
}

fn default_true() -> bool {
    true
}

/// Migration plan
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Plan",
    plural = "plans",
    namespaced,
    status = "PlanStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Executing","type":"string","jsonPath":".status.conditions[?(@.type==\"Executing\")].status"}"#,
    printcolumn = r#"{"name":"Succeeded","type":"string","jsonPath":".status.conditions[?(@.type==\"Succeeded\")].status"}"#,
    printcolumn = r#"{"name":"Failed","type":"string","jsonPath":".status.conditions[?(@.type==\"Failed\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Namespace the target VMs are created in
    #[serde(default)]
    pub target_namespace: String,

    /// Provider pair
    pub provider: ProviderPair,

    /// Mapping references
    pub map: PlanMaps,

    /// VMs to migrate
    #[serde(default)]
    pub vms: Vec<PlanVm>,

    /// Warm migration (legacy flag; `type` wins when set)
    #[serde(default)]
    pub warm: bool,

    /// Migration type
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<Mode>,

    /// Network used for disk transfer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_network: Option<ObjectRef>,

    /// Archive the plan
    #[serde(default)]
    pub archived: bool,

    /// Delete target VMs and volumes of VMs that did not migrate
    #[serde(default)]
    pub delete_vm_on_fail_migration: bool,

    /// Skip guest conversion
    #[serde(default)]
    pub skip_guest_conversion: bool,

    /// Inspect source VMs before touching them
    #[serde(default = "default_true")]
    pub run_preflight_inspection: bool,
}

impl PlanSpec {
    /// Effective migration mode
    pub fn mode(&self) -> Mode {
        match self.type_ {
            Some(mode) => mode,
            None if self.warm => Mode::Warm,
            None => Mode::Cold,
        }
    }

    /// Find the plan entry for a VM
    pub fn find_vm(&self, vm: &Ref) -> Option<&PlanVm> {
        self.vms.iter().find(|v| v.vm.matches(vm))
    }
}

/// Per-VM summary mirrored into plan status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanVmSummary {
    /// Source VM ID
    pub id: String,
    /// Source VM name
    #[serde(default)]
    pub name: String,
    /// Current phase
    pub phase: Phase,
    /// Step progress
    pub progress: Progress,
}

/// Summary of the running or last migration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanMigrationSummary {
    /// Migration name
    pub name: String,
    /// Started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// Completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    /// Per-VM summary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vms: Vec<PlanVmSummary>,
}

/// Plan status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    /// The generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Running or last migration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<PlanMigrationSummary>,

    /// Plan progress: sum of completed steps over sum of total steps
    #[serde(default)]
    pub progress: Progress,

    /// Mode recorded when the first migration started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_mode: Option<Mode>,

    /// When archive was first requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_requested: Option<DateTime<Utc>>,
}

//! Phase enumeration for per-VM migration

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A phase in a VM's itinerary.
///
/// Serialized as the bare variant name, which is the string form shown in
/// VM status.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash,
    PartialOrd, Ord,
)]
pub enum Phase {
    /// Not yet admitted by the scheduler
    #[default]
    Pending,
    /// Admitted; helper bookkeeping initialized
    Started,
    /// Run the pre-migration hook
    PreHook,
    /// Inspect the source VM before touching it
    PreflightInspection,
    /// Record the source power state for later restore
    StorePowerState,
    /// Ask the source to power the VM off
    PowerOffSource,
    /// Wait until the source reports the VM off
    WaitForPowerOff,
    /// Create target volumes
    CreateDataVolumes,
    /// Transfer disks through populator workers
    CopyDisks,
    /// Launch the guest conversion worker
    CreateGuestConversionPod,
    /// Wait for guest conversion to finish
    ConvertGuest,
    /// Transfer disks through the guest converter
    CopyDisksVirtV2V,
    /// Convert downloaded OpenStack images to the target format
    ConvertOpenstackSnapshot,
    /// Create the target VirtualMachine
    CreateVM,
    /// Run the post-migration hook
    PostHook,
    /// Terminal: migrated
    Completed,
    /// Warm: take the baseline snapshot
    CreateInitialSnapshot,
    /// Warm: wait for the baseline snapshot
    WaitForInitialSnapshot,
    /// Warm: record and ship the baseline extents
    StoreInitialSnapshotDeltas,
    /// Warm: take a precopy snapshot
    CreateSnapshot,
    /// Warm: wait for the precopy snapshot
    WaitForSnapshot,
    /// Warm: record and ship changed blocks since the previous snapshot
    StoreSnapshotDeltas,
    /// Warm: remove the previous snapshot
    RemovePreviousSnapshot,
    /// Warm: wait for the previous snapshot to disappear
    WaitForPreviousSnapshotRemoval,
    /// Warm: idle between precopies until the next round or cutover
    CopyingPaused,
    /// Warm: pin the last precopy snapshot as the final baseline
    AddFinalCheckpoint,
    /// Warm: take the final snapshot
    CreateFinalSnapshot,
    /// Warm: wait for the final snapshot
    WaitForFinalSnapshot,
    /// Warm: record and ship the final changed blocks
    StoreFinalSnapshotDeltas,
    /// Warm: remove the final snapshot
    RemoveFinalSnapshot,
    /// Terminal: failed
    Failed,
    /// Terminal: canceled by the user
    Canceled,
}

impl Phase {
    /// Every phase, in declaration order
    pub const ALL: [Phase; 32] = [
        Phase::Pending,
        Phase::Started,
        Phase::PreHook,
        Phase::PreflightInspection,
        Phase::StorePowerState,
        Phase::PowerOffSource,
        Phase::WaitForPowerOff,
        Phase::CreateDataVolumes,
        Phase::CopyDisks,
        Phase::CreateGuestConversionPod,
        Phase::ConvertGuest,
        Phase::CopyDisksVirtV2V,
        Phase::ConvertOpenstackSnapshot,
        Phase::CreateVM,
        Phase::PostHook,
        Phase::Completed,
        Phase::CreateInitialSnapshot,
        Phase::WaitForInitialSnapshot,
        Phase::StoreInitialSnapshotDeltas,
        Phase::CreateSnapshot,
        Phase::WaitForSnapshot,
        Phase::StoreSnapshotDeltas,
        Phase::RemovePreviousSnapshot,
        Phase::WaitForPreviousSnapshotRemoval,
        Phase::CopyingPaused,
        Phase::AddFinalCheckpoint,
        Phase::CreateFinalSnapshot,
        Phase::WaitForFinalSnapshot,
        Phase::StoreFinalSnapshotDeltas,
        Phase::RemoveFinalSnapshot,
        Phase::Failed,
        Phase::Canceled,
    ];

    /// The string form used in status
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Started => "Started",
            Phase::PreHook => "PreHook",
            Phase::PreflightInspection => "PreflightInspection",
            Phase::StorePowerState => "StorePowerState",
            Phase::PowerOffSource => "PowerOffSource",
            Phase::WaitForPowerOff => "WaitForPowerOff",
            Phase::CreateDataVolumes => "CreateDataVolumes",
            Phase::CopyDisks => "CopyDisks",
            Phase::CreateGuestConversionPod => "CreateGuestConversionPod",
            Phase::ConvertGuest => "ConvertGuest",
            Phase::CopyDisksVirtV2V => "CopyDisksVirtV2V",
            Phase::ConvertOpenstackSnapshot => "ConvertOpenstackSnapshot",
            Phase::CreateVM => "CreateVM",
            Phase::PostHook => "PostHook",
            Phase::Completed => "Completed",
            Phase::CreateInitialSnapshot => "CreateInitialSnapshot",
            Phase::WaitForInitialSnapshot => "WaitForInitialSnapshot",
            Phase::StoreInitialSnapshotDeltas => "StoreInitialSnapshotDeltas",
            Phase::CreateSnapshot => "CreateSnapshot",
            Phase::WaitForSnapshot => "WaitForSnapshot",
            Phase::StoreSnapshotDeltas => "StoreSnapshotDeltas",
            Phase::RemovePreviousSnapshot => "RemovePreviousSnapshot",
            Phase::WaitForPreviousSnapshotRemoval => "WaitForPreviousSnapshotRemoval",
            Phase::CopyingPaused => "CopyingPaused",
            Phase::AddFinalCheckpoint => "AddFinalCheckpoint",
            Phase::CreateFinalSnapshot => "CreateFinalSnapshot",
            Phase::WaitForFinalSnapshot => "WaitForFinalSnapshot",
            Phase::StoreFinalSnapshotDeltas => "StoreFinalSnapshotDeltas",
            Phase::RemoveFinalSnapshot => "RemoveFinalSnapshot",
            Phase::Failed => "Failed",
            Phase::Canceled => "Canceled",
        }
    }

    /// Whether the VM is done with this migration
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Canceled)
    }

    /// Phases during which disk data is moving and admission applies
    pub fn is_disk_transfer(&self) -> bool {
        matches!(
            self,
            Phase::CreateDataVolumes
                | Phase::CopyDisks
                | Phase::CopyDisksVirtV2V
                | Phase::ConvertOpenstackSnapshot
                | Phase::StoreInitialSnapshotDeltas
                | Phase::StoreSnapshotDeltas
                | Phase::StoreFinalSnapshotDeltas
        )
    }

    /// Human readable description of the step
    pub fn description(&self) -> &'static str {
        match self {
            Phase::Pending => "Waiting for admission.",
            Phase::Started => "Initialize migration.",
            Phase::PreHook => "Run pre-migration hook.",
            Phase::PreflightInspection => "Inspect the source VM.",
            Phase::StorePowerState => "Store the source power state.",
            Phase::PowerOffSource => "Power off the source VM.",
            Phase::WaitForPowerOff => "Wait for the source VM to power off.",
            Phase::CreateDataVolumes => "Create target volumes.",
            Phase::CopyDisks => "Transfer disks.",
            Phase::CreateGuestConversionPod => "Create the guest conversion worker.",
            Phase::ConvertGuest => "Convert the guest.",
            Phase::CopyDisksVirtV2V => "Copy disks through the converter.",
            Phase::ConvertOpenstackSnapshot => "Convert OpenStack images.",
            Phase::CreateVM => "Create the target VM.",
            Phase::PostHook => "Run post-migration hook.",
            Phase::Completed => "Migration completed.",
            Phase::CreateInitialSnapshot => "Create the baseline snapshot.",
            Phase::WaitForInitialSnapshot => "Wait for the baseline snapshot.",
            Phase::StoreInitialSnapshotDeltas => "Transfer the baseline snapshot.",
            Phase::CreateSnapshot => "Create a precopy snapshot.",
            Phase::WaitForSnapshot => "Wait for the precopy snapshot.",
            Phase::StoreSnapshotDeltas => "Transfer precopy changes.",
            Phase::RemovePreviousSnapshot => "Remove the previous snapshot.",
            Phase::WaitForPreviousSnapshotRemoval => "Wait for snapshot removal.",
            Phase::CopyingPaused => "Wait for the next precopy or cutover.",
            Phase::AddFinalCheckpoint => "Pin the final baseline.",
            Phase::CreateFinalSnapshot => "Create the final snapshot.",
            Phase::WaitForFinalSnapshot => "Wait for the final snapshot.",
            Phase::StoreFinalSnapshotDeltas => "Transfer the final changes.",
            Phase::RemoveFinalSnapshot => "Remove the final snapshot.",
            Phase::Failed => "Migration failed.",
            Phase::Canceled => "Migration canceled.",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown phase: {s}"))
    }
}

//! Per-VM migration itineraries
//!
//! The itinerary decides which phase follows the current one, given the
//! migration mode and a flag bitmap describing the VM. Everything here is
//! pure: no I/O, no clocks, no shared state. Side effects belong to the
//! executor that runs each phase.

#![deny(missing_docs)]

mod flag;
mod phase;
mod pipeline;

pub use flag::{Flag, Predicate};
pub use phase::Phase;
pub use pipeline::{ItineraryError, Next, Pipeline, Progress, Step};

use std::sync::OnceLock;

/// Migration mode
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    serde::Deserialize,
    serde::Serialize,
    schemars::JsonSchema,
    PartialEq,
    Eq,
    Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Source powered off for the whole transfer
    #[default]
    Cold,
    /// Incremental snapshot shipping until cutover
    Warm,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cold => write!(f, "cold"),
            Self::Warm => write!(f, "warm"),
        }
    }
}

/// The cold itinerary
pub fn cold() -> Pipeline {
    Pipeline {
        name: "cold",
        steps: vec![
            Step::always(Phase::Started),
            Step::all(Phase::PreHook, Flag::HAS_PRE_HOOK),
            Step::all(Phase::PreflightInspection, Flag::RUN_PREFLIGHT),
            Step::always(Phase::StorePowerState),
            Step::always(Phase::PowerOffSource),
            Step::always(Phase::WaitForPowerOff),
            Step::always(Phase::CreateDataVolumes),
            Step::all(Phase::CopyDisks, Flag::CDI_DISK_COPY),
            Step::all(Phase::CreateGuestConversionPod, Flag::REQUIRES_CONVERSION),
            Step::all(Phase::ConvertGuest, Flag::REQUIRES_CONVERSION),
            Step::all(Phase::CopyDisksVirtV2V, Flag::VIRT_V2V_DISK_COPY),
            Step::all(Phase::ConvertOpenstackSnapshot, Flag::OPENSTACK_IMAGE),
            Step::always(Phase::CreateVM),
            Step::all(Phase::PostHook, Flag::HAS_POST_HOOK),
            Step::always(Phase::Completed),
        ],
    }
}

/// The warm itinerary
///
/// `CopyingPaused → CreateSnapshot` is the precopy loop. It is taken by the
/// executor, never returned by [`Pipeline::next`].
pub fn warm() -> Pipeline {
    Pipeline {
        name: "warm",
        steps: vec![
            Step::always(Phase::Started),
            Step::all(Phase::PreHook, Flag::HAS_PRE_HOOK),
            Step::all(Phase::PreflightInspection, Flag::RUN_PREFLIGHT),
            Step::always(Phase::StorePowerState),
            Step::always(Phase::CreateDataVolumes),
            Step::all(Phase::CreateInitialSnapshot, Flag::NEEDS_SNAPSHOT),
            Step::all(Phase::WaitForInitialSnapshot, Flag::NEEDS_SNAPSHOT),
            Step::all(Phase::StoreInitialSnapshotDeltas, Flag::NEEDS_SNAPSHOT),
            Step::all(Phase::CreateSnapshot, Flag::NEEDS_SNAPSHOT),
            Step::all(Phase::WaitForSnapshot, Flag::NEEDS_SNAPSHOT),
            Step::all(Phase::StoreSnapshotDeltas, Flag::NEEDS_SNAPSHOT),
            Step::all(Phase::RemovePreviousSnapshot, Flag::NEEDS_SNAPSHOT),
            Step::all(Phase::WaitForPreviousSnapshotRemoval, Flag::NEEDS_SNAPSHOT),
            Step::always(Phase::CopyingPaused),
            Step::always(Phase::PowerOffSource),
            Step::always(Phase::WaitForPowerOff),
            Step::all(Phase::AddFinalCheckpoint, Flag::NEEDS_SNAPSHOT),
            Step::all(Phase::CreateFinalSnapshot, Flag::NEEDS_SNAPSHOT),
            Step::all(Phase::WaitForFinalSnapshot, Flag::NEEDS_SNAPSHOT),
            Step::all(Phase::StoreFinalSnapshotDeltas, Flag::NEEDS_SNAPSHOT),
            Step::all(Phase::CopyDisksVirtV2V, Flag::VIRT_V2V_DISK_COPY),
            Step::all(Phase::CreateGuestConversionPod, Flag::REQUIRES_CONVERSION),
            Step::all(Phase::ConvertGuest, Flag::REQUIRES_CONVERSION),
            Step::all(Phase::RemoveFinalSnapshot, Flag::NEEDS_SNAPSHOT),
            Step::always(Phase::CreateVM),
            Step::all(Phase::PostHook, Flag::HAS_POST_HOOK),
            Step::always(Phase::Completed),
        ],
    }
}

/// The itinerary for a migration mode
pub fn itinerary(mode: Mode) -> &'static Pipeline {
    static COLD: OnceLock<Pipeline> = OnceLock::new();
    static WARM: OnceLock<Pipeline> = OnceLock::new();
    match mode {
        Mode::Cold => COLD.get_or_init(cold),
        Mode::Warm => WARM.get_or_init(warm),
    }
}

/// `Next` for a VM: the step after `current` under `flags`
pub fn next(mode: Mode, current: Phase, flags: Flag) -> Result<Next, ItineraryError> {
    itinerary(mode).next(current, &flags)
}

/// `Progress` for a VM at `current` under `flags`
pub fn progress(mode: Mode, current: Phase, flags: Flag) -> Result<Progress, ItineraryError> {
    itinerary(mode).progress(current, &flags)
}

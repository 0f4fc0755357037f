//! Custom Resource Definitions for forklift
//!
//! This module contains all CRD definitions used by the forklift operator.

mod hook;
mod mapping;
mod migration;
mod plan;
mod provider;
mod types;

pub use hook::{Hook, HookSpec, HookStatus, HookStep};
pub use mapping::{
    DestinationNetwork, DestinationStorage, MapStatus, NetworkMap, NetworkMapSpec, NetworkPair,
    NetworkType, OffloadPlugin, ProviderPair, StorageMap, StorageMapSpec, StoragePair,
    XcopyConfig,
};
pub use migration::{
    DiskStatus, HelperKind, HelperRef, MappingSnapshot, Migration, MigrationSpec,
    MigrationStatus, PowerState, Precopy, StepPhase, StepStatus, VmError, VmStatus, WarmStatus,
};
pub use plan::{
    HookRef, Plan, PlanMaps, PlanMigrationSummary, PlanSpec, PlanStatus, PlanVm, PlanVmSummary,
};
pub use provider::{
    Provider, ProviderPhase, ProviderSettings, ProviderSpec, ProviderStatus, ProviderType,
    SdkEndpoint,
};
pub use types::{
    find_condition, has_blocker, is_condition_true, remove_condition, same_conditions,
    set_condition, Category, Condition, ConditionStatus, ObjectRef, Ref,
};

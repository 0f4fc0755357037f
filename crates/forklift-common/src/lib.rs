//! Common types for forklift: CRDs, errors, conditions, and utilities

#![deny(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod error;
pub mod events;
pub mod filebacked;
pub mod metrics;
pub mod retry;
pub mod settings;
pub mod telemetry;

pub use error::{Error, Reason, TraceExt, Traced};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of all forklift resources
pub const API_GROUP: &str = "forklift.konveyor.io";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "forklift-controller";

/// Finalizer that runs plan cleanup before the plan disappears
pub const PLAN_FINALIZER: &str = "forklift.konveyor.io/plan-cleanup";

/// Label carrying the owning plan name
pub const PLAN_LABEL: &str = "plan";
/// Label carrying the owning migration name
pub const MIGRATION_LABEL: &str = "migration";
/// Label carrying the source VM ID
pub const VM_LABEL: &str = "vmID";
/// Label carrying the source disk ID
pub const DISK_LABEL: &str = "diskID";
/// Label marking populator worker pods
pub const POPULATOR_LABEL: &str = "forklift.konveyor.io/populator";
/// Label marking guest conversion pods
pub const CONVERSION_LABEL: &str = "forklift.konveyor.io/conversion";
/// Label carrying the hook step of a hook job
pub const HOOK_STEP_LABEL: &str = "step";

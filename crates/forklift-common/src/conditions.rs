//! Condition types shared by Plan, Migration, VM and Provider status
//!
//! Types are matched by name; reasons for error conditions come from
//! [`crate::error::Reason`].

/// Resource validated and usable
pub const READY: &str = "Ready";
/// A migration of the plan is running
pub const EXECUTING: &str = "Executing";
/// At least one VM is not terminal
pub const RUNNING: &str = "Running";
/// Every VM completed
pub const SUCCEEDED: &str = "Succeeded";
/// At least one VM failed and none is running
pub const FAILED: &str = "Failed";
/// Every VM was canceled, or one VM was canceled (VM scope)
pub const CANCELED: &str = "Canceled";
/// The plan was archived
pub const ARCHIVED: &str = "Archived";
/// Validation produced a blocker
pub const BLOCKED: &str = "Blocked";
/// Provider connection test result
pub const CONNECTION_TEST_SUCCEEDED: &str = "ConnectionTestSucceeded";

/// Prefix for per-check validation conditions on a plan
pub const VALIDATION_PREFIX: &str = "Validation.";

/// Reason used on truthy conditions
pub const REASON_COMPLETED: &str = "Completed";
/// Reason when the plan passed validation
pub const REASON_VALIDATED: &str = "Validated";
/// Reason when a migration started
pub const REASON_STARTED: &str = "Started";
/// Reason when the archive timeout elapsed with leftovers
pub const REASON_ARCHIVE_TIMEOUT: &str = "ArchiveTimeout";

/// Build the validation condition type for a check, e.g. `Validation.VMNotFound`
pub fn validation_type(reason: &str) -> String {
    format!("{VALIDATION_PREFIX}{reason}")
}

/// Whether a condition type is a validation check
pub fn is_validation_type(type_: &str) -> bool {
    type_.starts_with(VALIDATION_PREFIX)
}

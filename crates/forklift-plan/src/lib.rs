//! Plan controller for forklift
//!
//! Reconciles `Plan` resources and the `Migration` resources that run them:
//! - Validation of the plan against inventory, mappings and providers
//! - A bounded scheduler admitting VMs into their itineraries
//! - Per-VM step execution for cold and warm migrations
//! - Cleanup of helper objects, archival, and plan deletion

#![deny(missing_docs)]

pub mod archive;
pub mod cleanup;
pub mod client;
pub mod controller;
pub mod conversion;
pub mod deltas;
pub mod error;
pub mod executor;
pub mod hook;
pub mod kubevirt;
pub mod scheduler;
pub mod source;
pub mod status;
pub mod target;
pub mod validation;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod testing;

pub use controller::{error_policy, reconcile, reconcile_at, Context};
pub use error::PlanError;

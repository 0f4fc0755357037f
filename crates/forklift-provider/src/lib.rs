//! Provider controller for forklift
//!
//! Decides whether a Provider can be used by a plan: settings and
//! credentials are validated, the endpoint is checked, and the inventory
//! reports whether its collector reached the provider.

#![deny(missing_docs)]

pub mod controller;
pub mod credentials;
mod error;

pub use controller::{error_policy, reconcile, Context, KubeClient, KubeClientImpl};
pub use credentials::merged_settings;
pub use error::ProviderError;

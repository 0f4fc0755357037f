//! Inventory service client for forklift
//!
//! The inventory is an HTTP service exposing JSON descriptions of source
//! provider resources under `/providers/<type>/<uid>/...`. The controller
//! consumes it read-only through [`Inventory`]; [`InventoryClient`] adds a
//! TTL cache shared by every caller in the process.

#![deny(missing_docs)]

mod cache;
mod client;
mod config;
mod error;
mod model;

pub use cache::TtlCache;
pub use client::{Inventory, InventoryClient};
pub use config::InventoryConfig;
pub use error::InventoryError;
pub use model::{Collection, Concern, Disk, Network, Nic, ProviderInfo, ProviderKey, Storage, Vm};

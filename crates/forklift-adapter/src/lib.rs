//! Source adapters for forklift
//!
//! A [`SourceAdapter`] is the uniform interface the plan executor uses to
//! drive a source platform. Each platform advertises what it can do through
//! [`Capabilities`]; operations outside that set fail with
//! [`AdapterError::Unsupported`], which the executor treats as permanent.
//! Adapters are built by [`create_adapter`] from a Provider resource.

#![deny(missing_docs)]

mod capabilities;
mod control;
mod error;
pub mod provider;

use std::collections::BTreeMap;

use async_trait::async_trait;
use forklift_common::crd::{PowerState, ProviderType, Ref};
use forklift_inventory::Vm;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

pub use capabilities::Capabilities;
pub use control::{ControlPath, HttpProviderControl, ProviderControl};
pub use error::AdapterError;
pub use provider::{create_adapter, create_adapter_with_control};

/// Live description of a source VM
#[derive(Clone, Debug, PartialEq)]
pub struct Inspection {
    /// Inventory view of the VM
    pub vm: Vm,
    /// Power state reported by the platform right now
    pub power_state: PowerState,
    /// Whether changed-block tracking can serve warm precopies
    pub checkpointable: bool,
}

/// State of a snapshot on the source
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotState {
    /// Still being created
    Creating,
    /// Usable
    Ready,
    /// Removal in progress
    Removing,
    /// Does not exist (never created or removed)
    Gone,
    /// The platform reported a failure
    Failed(String),
}

impl SnapshotState {
    fn parse(state: &str, message: Option<&str>) -> Self {
        match state.to_lowercase().as_str() {
            "ready" | "ok" | "success" | "completed" => Self::Ready,
            "removing" | "deleting" => Self::Removing,
            "gone" | "removed" | "deleted" => Self::Gone,
            "failed" | "error" => Self::Failed(message.unwrap_or("unknown error").to_string()),
            _ => Self::Creating,
        }
    }
}

/// Run of changed bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Offset in bytes
    pub start: u64,
    /// Length in bytes
    pub length: u64,
}

/// Changed blocks of one disk between a baseline and a snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskChanges {
    /// Disk ID
    #[serde(default)]
    pub disk: String,
    /// Baseline token for the next precopy, if the platform issues one
    #[serde(default)]
    pub change_id: Option<String>,
    /// Changed runs
    #[serde(default)]
    pub extents: Vec<Extent>,
}

impl DiskChanges {
    /// Total changed bytes
    pub fn delta_bytes(&self) -> u64 {
        self.extents.iter().map(|e| e.length).sum()
    }
}

/// How a populator reaches the disk's bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskSourceKind {
    /// VMware VDDK over NBD
    Vddk,
    /// oVirt imageio
    ImageIo,
    /// Glance image download
    Glance,
    /// File on an NFS share
    File,
    /// File on an SMB share
    Smb,
}

/// Descriptor a populator worker uses to read a disk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskHandle {
    /// Transport
    pub kind: DiskSourceKind,
    /// Endpoint URL
    pub url: String,
    /// Disk ID on the source
    pub disk_id: String,
    /// Snapshot the read is pinned to
    #[serde(default)]
    pub snapshot: Option<String>,
    /// Transport-specific options passed to the worker
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Uniform interface to a source platform
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Platform type
    fn provider_type(&self) -> ProviderType;

    /// Advertised capabilities
    fn capabilities(&self) -> Capabilities;

    /// Every VM on the source
    async fn list_vms(&self) -> Result<Vec<Vm>, AdapterError>;

    /// Describe one VM
    async fn inspect(&self, vm: &Ref) -> Result<Inspection, AdapterError>;

    /// Current power state
    async fn power_state(&self, vm: &Ref) -> Result<PowerState, AdapterError>;

    /// Request power off; completion is observed through [`Self::power_state`]
    async fn power_off(&self, _vm: &Ref) -> Result<(), AdapterError> {
        Err(AdapterError::unsupported("PowerOff"))
    }

    /// Request power on
    async fn power_on(&self, _vm: &Ref) -> Result<(), AdapterError> {
        Err(AdapterError::unsupported("PowerOn"))
    }

    /// Start a snapshot and return its ID
    async fn create_snapshot(&self, _vm: &Ref, _name: &str) -> Result<String, AdapterError> {
        Err(AdapterError::unsupported("Snapshot"))
    }

    /// State of a snapshot
    async fn snapshot_state(
        &self,
        _vm: &Ref,
        _snapshot: &str,
    ) -> Result<SnapshotState, AdapterError> {
        Err(AdapterError::unsupported("Snapshot"))
    }

    /// Start removing a snapshot; removing a missing snapshot succeeds
    async fn remove_snapshot(&self, _vm: &Ref, _snapshot: &str) -> Result<(), AdapterError> {
        Err(AdapterError::unsupported("RemoveSnapshot"))
    }

    /// Changed blocks of `disk` between `baseline` (None for the first
    /// precopy) and `snapshot`
    async fn changes(
        &self,
        _vm: &Ref,
        _disk: &str,
        _baseline: Option<String>,
        _snapshot: &str,
    ) -> Result<DiskChanges, AdapterError> {
        Err(AdapterError::unsupported("Changes"))
    }

    /// Reader descriptor for a disk, optionally pinned to a snapshot
    async fn open_disk(
        &self,
        vm: &Ref,
        disk: &str,
        snapshot: Option<String>,
    ) -> Result<DiskHandle, AdapterError>;

    /// Release platform sessions
    async fn close(&self) {}
}

//! oVirt / Red Hat Virtualization
//!
//! Disks are read through imageio and copied by CDI; guests need no
//! conversion. Incremental backup checkpoints serve warm precopies.

use async_trait::async_trait;
use forklift_common::crd::{PowerState, ProviderType, Ref};
use forklift_inventory::Vm;
use std::collections::BTreeMap;

use super::{power_from, Base};
use crate::{
    AdapterError, Capabilities, DiskChanges, DiskHandle, DiskSourceKind, Inspection,
    SnapshotState, SourceAdapter,
};

fn parse_power(state: &str) -> PowerState {
    power_from(state, &["up", "powering_up"], &["down"])
}

/// oVirt adapter
pub struct OvirtAdapter {
    base: Base,
}

impl OvirtAdapter {
    pub(crate) fn new(base: Base) -> Self {
        Self { base }
    }
}

#[async_trait]
impl SourceAdapter for OvirtAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Ovirt
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::LIST_VMS
            | Capabilities::INSPECT
            | Capabilities::POWER_OFF
            | Capabilities::POWER_ON
            | Capabilities::SNAPSHOT
            | Capabilities::REMOVE_SNAPSHOT
            | Capabilities::CHANGES
            | Capabilities::OPEN_DISK
    }

    async fn list_vms(&self) -> Result<Vec<Vm>, AdapterError> {
        self.base.list_vms().await
    }

    async fn inspect(&self, vm: &Ref) -> Result<Inspection, AdapterError> {
        let found = self.base.vm(vm).await?;
        let power_state = self.power_state(&found.reference()).await?;
        Ok(Inspection {
            vm: found,
            power_state,
            checkpointable: true,
        })
    }

    async fn power_state(&self, vm: &Ref) -> Result<PowerState, AdapterError> {
        self.base.live_power_state(vm, parse_power).await
    }

    async fn power_off(&self, vm: &Ref) -> Result<(), AdapterError> {
        self.base.set_power(vm, "stop").await
    }

    async fn power_on(&self, vm: &Ref) -> Result<(), AdapterError> {
        self.base.set_power(vm, "start").await
    }

    async fn create_snapshot(&self, vm: &Ref, name: &str) -> Result<String, AdapterError> {
        self.base.create_snapshot(vm, name, false).await
    }

    async fn snapshot_state(
        &self,
        vm: &Ref,
        snapshot: &str,
    ) -> Result<SnapshotState, AdapterError> {
        self.base.snapshot_state(vm, snapshot).await
    }

    async fn remove_snapshot(&self, vm: &Ref, snapshot: &str) -> Result<(), AdapterError> {
        self.base.remove_snapshot(vm, snapshot).await
    }

    async fn changes(
        &self,
        vm: &Ref,
        disk: &str,
        baseline: Option<String>,
        snapshot: &str,
    ) -> Result<DiskChanges, AdapterError> {
        self.base.changes(vm, disk, baseline, snapshot).await
    }

    async fn open_disk(
        &self,
        vm: &Ref,
        disk: &str,
        snapshot: Option<String>,
    ) -> Result<DiskHandle, AdapterError> {
        let found = self.base.vm(vm).await?;
        let mut options = BTreeMap::new();
        options.insert("vmId".to_string(), found.id.clone());
        Ok(DiskHandle {
            kind: DiskSourceKind::ImageIo,
            url: format!("{}/disks/{disk}", self.base.url.trim_end_matches('/')),
            disk_id: disk.to_string(),
            snapshot,
            options,
        })
    }
}

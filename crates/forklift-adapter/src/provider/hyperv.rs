//! Microsoft Hyper-V
//!
//! Disks are VHDX files on an SMB share which virt-v2v reads and converts in
//! one pass. Hyper-V offers no snapshot or change tracking API here.

use async_trait::async_trait;
use forklift_common::crd::{PowerState, ProviderType, Ref};
use forklift_inventory::Vm;
use std::collections::BTreeMap;

use super::{power_from, Base};
use crate::{AdapterError, Capabilities, DiskHandle, DiskSourceKind, Inspection, SourceAdapter};

fn parse_power(state: &str) -> PowerState {
    power_from(state, &["Running"], &["Off"])
}

/// Hyper-V adapter
pub struct HyperVAdapter {
    base: Base,
}

impl HyperVAdapter {
    pub(crate) fn new(base: Base) -> Self {
        Self { base }
    }
}

#[async_trait]
impl SourceAdapter for HyperVAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::HyperV
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::LIST_VMS
            | Capabilities::INSPECT
            | Capabilities::POWER_OFF
            | Capabilities::POWER_ON
            | Capabilities::OPEN_DISK
            | Capabilities::REQUIRES_CONVERSION
            | Capabilities::CONVERTER_COPIES_DISKS
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
            checkpointable: false,
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

    async fn open_disk(
        &self,
        vm: &Ref,
        disk: &str,
        snapshot: Option<String>,
    ) -> Result<DiskHandle, AdapterError> {
        let found = self.base.vm(vm).await?;
        let mut options = BTreeMap::new();
        options.insert("vmName".to_string(), found.name.clone());
        Ok(DiskHandle {
            kind: DiskSourceKind::Smb,
            url: format!(
                "{}/{}",
                self.base.url.trim_end_matches('/'),
                disk.trim_start_matches('/')
            ),
            disk_id: disk.to_string(),
            snapshot,
            options,
        })
    }
}

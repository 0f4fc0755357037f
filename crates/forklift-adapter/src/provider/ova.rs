//! OVA archives on an NFS share
//!
//! An appliance is never running, so power control succeeds without doing
//! anything and the reported state is always off.

use async_trait::async_trait;
use forklift_common::crd::{PowerState, ProviderType, Ref};
use forklift_inventory::Vm;
use std::collections::BTreeMap;

use super::Base;
use crate::{AdapterError, Capabilities, DiskHandle, DiskSourceKind, Inspection, SourceAdapter};

/// OVA adapter
pub struct OvaAdapter {
    base: Base,
}

impl OvaAdapter {
    pub(crate) fn new(base: Base) -> Self {
        Self { base }
    }
}

#[async_trait]
impl SourceAdapter for OvaAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Ova
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
        Ok(Inspection {
            vm: self.base.vm(vm).await?,
            power_state: PowerState::Off,
            checkpointable: false,
        })
    }

    async fn power_state(&self, _vm: &Ref) -> Result<PowerState, AdapterError> {
        Ok(PowerState::Off)
    }

    async fn power_off(&self, _vm: &Ref) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn power_on(&self, _vm: &Ref) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn open_disk(
        &self,
        vm: &Ref,
        disk: &str,
        snapshot: Option<String>,
    ) -> Result<DiskHandle, AdapterError> {
        let found = self.base.vm(vm).await?;
        let mut options = BTreeMap::new();
        options.insert("ovaPath".to_string(), found.path.clone());
        Ok(DiskHandle {
            kind: DiskSourceKind::File,
            url: self.base.url.clone(),
            disk_id: disk.to_string(),
            snapshot,
            options,
        })
    }
}

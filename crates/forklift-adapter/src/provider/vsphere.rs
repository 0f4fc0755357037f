//! VMware vSphere
//!
//! Disks are read through VDDK. Warm migration relies on changed block
//! tracking: a VM is checkpointable only when CBT is enabled, and the first
//! precopy asks for changes since `*` (everything allocated).

use async_trait::async_trait;
use forklift_common::crd::{PowerState, ProviderSettings, ProviderType, Ref, SdkEndpoint};
use forklift_inventory::Vm;
use std::collections::BTreeMap;
use tracing::instrument;

use super::{power_from, Base};
use crate::{
    AdapterError, Capabilities, DiskChanges, DiskHandle, DiskSourceKind, Inspection,
    SnapshotState, SourceAdapter,
};

const INITIAL_CHANGE_ID: &str = "*";

fn parse_power(state: &str) -> PowerState {
    power_from(state, &["poweredOn"], &["poweredOff"])
}

/// vSphere adapter
pub struct VSphereAdapter {
    base: Base,
    vddk_options: BTreeMap<String, String>,
}

impl VSphereAdapter {
    pub(crate) fn new(base: Base, settings: &ProviderSettings) -> Self {
        let mut vddk_options = BTreeMap::new();
        if let Some(image) = &settings.vddk_init_image {
            vddk_options.insert("vddkInitImage".to_string(), image.clone());
        }
        if let Some(size) = settings.vddk_buf_size {
            vddk_options.insert("vddkBufSizeIn64K".to_string(), size.to_string());
        }
        if let Some(count) = settings.vddk_buf_count {
            vddk_options.insert("vddkBufCount".to_string(), count.to_string());
        }
        let endpoint = match settings.sdk_endpoint {
            SdkEndpoint::VCenter => "vcenter",
            SdkEndpoint::Esxi => "esxi",
        };
        vddk_options.insert("sdkEndpoint".to_string(), endpoint.to_string());
        Self { base, vddk_options }
    }

    fn disk<'a>(vm: &'a Vm, disk: &str) -> Result<&'a forklift_inventory::Disk, AdapterError> {
        vm.disks
            .iter()
            .find(|d| d.id == disk)
            .ok_or_else(|| AdapterError::Control {
                operation: "open disk".into(),
                status: Some(404),
                message: format!("disk {disk} not found on vm {}", vm.id),
            })
    }
}

#[async_trait]
impl SourceAdapter for VSphereAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::VSphere
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
            | Capabilities::REQUIRES_CONVERSION
    }

    async fn list_vms(&self) -> Result<Vec<Vm>, AdapterError> {
        self.base.list_vms().await
    }

    #[instrument(skip(self), fields(vm = %vm))]
    async fn inspect(&self, vm: &Ref) -> Result<Inspection, AdapterError> {
        let found = self.base.vm(vm).await?;
        let power_state = self.power_state(&found.reference()).await?;
        Ok(Inspection {
            checkpointable: found.change_tracking_enabled,
            vm: found,
            power_state,
        })
    }

    async fn power_state(&self, vm: &Ref) -> Result<PowerState, AdapterError> {
        self.base.live_power_state(vm, parse_power).await
    }

    async fn power_off(&self, vm: &Ref) -> Result<(), AdapterError> {
        self.base.set_power(vm, "off").await
    }

    async fn power_on(&self, vm: &Ref) -> Result<(), AdapterError> {
        self.base.set_power(vm, "on").await
    }

    async fn create_snapshot(&self, vm: &Ref, name: &str) -> Result<String, AdapterError> {
        self.base.create_snapshot(vm, name, true).await
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
        let baseline = baseline.unwrap_or_else(|| INITIAL_CHANGE_ID.to_string());
        self.base.changes(vm, disk, Some(baseline), snapshot).await
    }

    async fn open_disk(
        &self,
        vm: &Ref,
        disk: &str,
        snapshot: Option<String>,
    ) -> Result<DiskHandle, AdapterError> {
        let found = self.base.vm(vm).await?;
        let source = Self::disk(&found, disk)?;
        let mut options = self.vddk_options.clone();
        options.insert("vmMoref".to_string(), found.id.clone());
        options.insert("path".to_string(), source.id.clone());
        Ok(DiskHandle {
            kind: DiskSourceKind::Vddk,
            url: self.base.url.clone(),
            disk_id: source.id.clone(),
            snapshot,
            options,
        })
    }
}

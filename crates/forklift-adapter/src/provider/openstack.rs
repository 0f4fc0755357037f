//! OpenStack
//!
//! Volumes are exported as Glance images and imported by CDI; there is no
//! changed-block API so only cold migration is offered.

use async_trait::async_trait;
use forklift_common::crd::{PowerState, ProviderSettings, ProviderType, Ref};
use forklift_inventory::Vm;
use std::collections::BTreeMap;

use super::{power_from, Base};
use crate::{
    AdapterError, Capabilities, DiskHandle, DiskSourceKind, Inspection, SnapshotState,
    SourceAdapter,
};

fn parse_power(state: &str) -> PowerState {
    power_from(state, &["ACTIVE"], &["SHUTOFF", "STOPPED"])
}

/// OpenStack adapter
pub struct OpenStackAdapter {
    base: Base,
    identity: BTreeMap<String, String>,
}

impl OpenStackAdapter {
    pub(crate) fn new(base: Base, settings: &ProviderSettings) -> Self {
        let identity = [
            ("domainName", &settings.domain_name),
            ("projectName", &settings.project_name),
            ("regionName", &settings.region_name),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
        .collect();
        Self { base, identity }
    }
}

#[async_trait]
impl SourceAdapter for OpenStackAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenStack
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::LIST_VMS
            | Capabilities::INSPECT
            | Capabilities::POWER_OFF
            | Capabilities::POWER_ON
            | Capabilities::SNAPSHOT
            | Capabilities::REMOVE_SNAPSHOT
            | Capabilities::OPEN_DISK
            | Capabilities::IMAGE_BASED
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
        self.base.set_power(vm, "os-stop").await
    }

    async fn power_on(&self, vm: &Ref) -> Result<(), AdapterError> {
        self.base.set_power(vm, "os-start").await
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

    /// The image is the snapshot when one was taken, otherwise the
    /// instance's boot image
    async fn open_disk(
        &self,
        vm: &Ref,
        disk: &str,
        snapshot: Option<String>,
    ) -> Result<DiskHandle, AdapterError> {
        let found = self.base.vm(vm).await?;
        let image = snapshot
            .clone()
            .or_else(|| found.image_id.clone())
            .ok_or_else(|| AdapterError::Control {
                operation: "open disk".into(),
                status: None,
                message: format!("vm {} has no image for disk {disk}", found.id),
            })?;
        let mut options = self.identity.clone();
        options.insert("imageId".to_string(), image);
        Ok(DiskHandle {
            kind: DiskSourceKind::Glance,
            url: self.base.url.clone(),
            disk_id: disk.to_string(),
            snapshot,
            options,
        })
    }
}

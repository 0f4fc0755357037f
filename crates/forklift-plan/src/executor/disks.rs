//! Target volumes and populator-driven disk copies

use std::time::Duration;

use forklift_adapter::DiskHandle;
use forklift_common::crd::{DiskStatus, HelperKind, StoragePair, VmStatus};
use forklift_common::events::{actions, reasons};
use forklift_common::metrics;
use forklift_common::Reason;
use forklift_populator::{
    select_worker, DiskKey, Ensured, PopulatorError, TransferPhase, WorkerRequest, WorkerSpec,
};
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use super::{source_secret_name, Outcome, Run};
use crate::conversion::{image_converter_name, image_converter_pod, scratch_volume_name};
use crate::error::PlanError;
use crate::kubevirt::{data_volume, data_volume_name, DataVolumeRequest};
use crate::target::{ObjectKind, PodState, TargetObject};

pub(super) const TRANSFER_POLL: Duration = Duration::from_secs(10);
const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

impl Run<'_> {
    pub(super) fn storage_pair(&self, disk: &DiskStatus) -> Result<&StoragePair, PlanError> {
        self.snapshot
            .storage
            .iter()
            .find(|pair| pair.source.matches(&disk.storage))
            .ok_or_else(|| {
                PlanError::permanent(
                    Reason::StorageNotMapped,
                    format!("Storage of disk '{}' is not mapped.", disk.id),
                )
            })
    }

    pub(super) fn claim_of<'d>(&self, disk: &'d DiskStatus) -> Result<&'d str, PlanError> {
        disk.data_volume.as_deref().ok_or_else(|| {
            PlanError::permanent(
                Reason::Internal,
                format!("disk '{}' has no target volume", disk.id),
            )
        })
    }

    pub(super) async fn create_data_volumes(
        &self,
        vm: &mut VmStatus,
    ) -> Result<Outcome, PlanError> {
        let labels = self.labels(vm);
        let mut created = Vec::with_capacity(vm.disks.len());
        for (index, disk) in vm.disks.iter().enumerate() {
            let pair = self.storage_pair(disk)?;
            let name = data_volume_name(&vm.target_name, index);
            let manifest = data_volume(&DataVolumeRequest {
                name: &name,
                namespace: &self.namespace,
                capacity: disk.capacity,
                storage: &pair.destination,
                labels: &labels,
                disk: &disk.id,
            })?;
            self.ctx
                .target
                .create(&TargetObject::DataVolume(manifest))
                .await?;
            created.push(name);
        }
        for (disk, name) in vm.disks.iter_mut().zip(&created) {
            disk.data_volume = Some(name.clone());
        }
        for name in created {
            vm.add_helper(HelperKind::DataVolume, name);
        }
        info!(volumes = vm.disks.len(), "created target volumes");
        Ok(Outcome::Done)
    }

    pub(super) async fn copy_disks(&self, vm: &mut VmStatus) -> Result<Outcome, PlanError> {
        let reference = vm.vm_ref();
        for index in 0..vm.disks.len() {
            if vm.disks[index].done {
                continue;
            }
            if vm.disks[index].worker.is_none() {
                let disk = &vm.disks[index];
                let claim = self.claim_of(disk)?.to_string();
                let handle = self.adapter().open_disk(&reference, &disk.id, None).await?;
                let worker = self.start_worker(&vm.id, disk, &claim, &handle).await?;
                vm.add_helper(HelperKind::PopulatorWorker, &worker);
                vm.disks[index].worker = Some(worker);
                continue;
            }
            let vm_id = vm.id.clone();
            if self.poll_disk(&vm_id, &mut vm.disks[index]).await? {
                vm.disks[index].done = true;
            }
        }
        if vm.disks.iter().all(|d| d.done) {
            Ok(Outcome::Done)
        } else {
            Ok(Outcome::Wait(TRANSFER_POLL))
        }
    }

    /// Refresh a disk's transfer; true once the copy finished
    pub(super) async fn poll_disk(
        &self,
        vm_id: &str,
        disk: &mut DiskStatus,
    ) -> Result<bool, PlanError> {
        let key = DiskKey::new(&self.name, vm_id, &disk.id);
        let transfer = match self
            .ctx
            .populators
            .poll(&self.namespace, &key, disk.capacity)
            .await
        {
            Ok(transfer) => transfer,
            Err(PopulatorError::WorkerMissing { name }) => {
                warn!(worker = %name, disk = %disk.id, "populator worker vanished; restarting it");
                disk.worker = None;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        // Status outlives the coordinator's memory across restarts
        disk.transferred = disk.transferred.max(transfer.transferred);
        disk.total = transfer.total;
        disk.percent = match disk.total {
            0 => transfer.percent,
            total => transfer
                .percent
                .max(((disk.transferred.min(total) as u128 * 100) / total as u128) as u32),
        };
        metrics::record_disk_progress(&self.name, vm_id, &disk.id, disk.transferred);

        match transfer.phase {
            TransferPhase::Completed => {
                debug!(disk = %disk.id, "disk transfer completed");
                Ok(true)
            }
            TransferPhase::Pending | TransferPhase::Running => Ok(false),
            TransferPhase::Failed {
                message,
                permanent: true,
            } => Err(PlanError::permanent(
                Reason::TransferFailed,
                format!("Transfer of disk '{}' failed: {message}", disk.id),
            )),
            TransferPhase::Failed { message, .. } => {
                self.ctx.populators.retire(&self.namespace, &key).await?;
                disk.worker = None;
                Err(PlanError::transient(
                    Reason::TransferFailed,
                    format!("Transfer of disk '{}' failed: {message}", disk.id),
                ))
            }
        }
    }

    /// Ensure the populator worker for a disk; returns its name
    pub(super) async fn start_worker(
        &self,
        vm_id: &str,
        disk: &DiskStatus,
        claim: &str,
        handle: &DiskHandle,
    ) -> Result<String, PlanError> {
        let offload = self
            .storage_pair(disk)?
            .offload_plugin
            .as_ref()
            .is_some_and(|p| p.vsphere_xcopy_config.is_some());
        let kind = select_worker(self.snapshot.source_type, offload)?;
        let secret = source_secret_name(&self.name);
        let mut spec = WorkerSpec::build(WorkerRequest {
            key: DiskKey::new(&self.name, vm_id, &disk.id),
            namespace: &self.namespace,
            kind,
            image: &self.ctx.settings.populator_image,
            handle,
            secret: &secret,
            claim,
            owner_name: &self.name,
        });
        if let Some(network) = &self.snapshot.transfer_network {
            spec.annotations.insert(
                NETWORKS_ANNOTATION.to_string(),
                format!("{}/{}", network.namespace_or(&self.namespace), network.name),
            );
        }
        let ensured = self.ctx.populators.ensure(&spec).await?;
        let worker = ensured.worker().name.clone();
        if let Ensured::Adopted(_) = ensured {
            self.publish(
                EventType::Normal,
                reasons::WORKER_ADOPTED,
                actions::MIGRATE,
                format!("Adopted populator worker '{worker}' for disk '{}'.", disk.id),
            )
            .await;
        }
        Ok(worker)
    }

    /// Import each image into a scratch volume, then convert it to raw
    pub(super) async fn convert_images(&self, vm: &mut VmStatus) -> Result<Outcome, PlanError> {
        let reference = vm.vm_ref();
        let labels = self.labels(vm);
        let vm_id = vm.id.clone();
        for index in 0..vm.disks.len() {
            if vm.disks[index].done {
                continue;
            }
            let target = self.claim_of(&vm.disks[index])?.to_string();
            let scratch = scratch_volume_name(&target);
            let converter = image_converter_name(&self.name, &vm_id, &vm.disks[index].id);

            match self.ctx.target.pod_state(&self.namespace, &converter).await? {
                Some(PodState::Succeeded) => {
                    let key = DiskKey::new(&self.name, &vm_id, &vm.disks[index].id);
                    self.ctx.populators.retire(&self.namespace, &key).await?;
                    self.ctx
                        .target
                        .delete(ObjectKind::DataVolume, &self.namespace, &scratch)
                        .await?;
                    vm.remove_helper(HelperKind::DataVolume, &scratch);
                    let disk = &mut vm.disks[index];
                    disk.done = true;
                    disk.worker = None;
                    disk.percent = 100;
                    disk.transferred = disk.capacity;
                    continue;
                }
                Some(PodState::Failed { message, .. }) => {
                    return Err(PlanError::permanent(
                        Reason::ConversionFailed,
                        format!(
                            "Image conversion of disk '{}' failed: {message}",
                            vm.disks[index].id
                        ),
                    ));
                }
                Some(_) => continue,
                None => {}
            }

            if vm.disks[index].worker.is_some() {
                if !self.poll_disk(&vm_id, &mut vm.disks[index]).await? {
                    continue;
                }
                let pod = image_converter_pod(
                    &converter,
                    &self.namespace,
                    &self.ctx.settings.virt_v2v_image,
                    &scratch,
                    &target,
                    labels.clone(),
                );
                self.ctx.target.create(&TargetObject::Pod(pod)).await?;
                vm.add_helper(HelperKind::ImageConverter, &converter);
                continue;
            }

            let disk = &vm.disks[index];
            let pair = self.storage_pair(disk)?;
            let manifest = data_volume(&DataVolumeRequest {
                name: &scratch,
                namespace: &self.namespace,
                capacity: disk.capacity,
                storage: &pair.destination,
                labels: &labels,
                disk: &disk.id,
            })?;
            self.ctx
                .target
                .create(&TargetObject::DataVolume(manifest))
                .await?;
            let handle = self.adapter().open_disk(&reference, &disk.id, None).await?;
            let worker = self.start_worker(&vm_id, disk, &scratch, &handle).await?;
            vm.add_helper(HelperKind::DataVolume, &scratch);
            vm.add_helper(HelperKind::PopulatorWorker, &worker);
            vm.disks[index].worker = Some(worker);
        }
        if vm.disks.iter().all(|d| d.done) {
            Ok(Outcome::Done)
        } else {
            Ok(Outcome::Wait(TRANSFER_POLL))
        }
    }
}

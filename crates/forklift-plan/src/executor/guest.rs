//! Guest conversion with virt-v2v

use std::time::Duration;

use forklift_common::crd::{HelperKind, VmStatus};
use forklift_common::Reason;
use forklift_itinerary::{Flag, Phase};
use tracing::{debug, info};

use super::{source_secret_name, Outcome, Run};
use crate::conversion::{apply_progress, conversion_pod, conversion_pod_name, ConversionRequest};
use crate::error::PlanError;
use crate::target::{PodState, TargetObject};

const CONVERSION_POLL: Duration = Duration::from_secs(10);

impl Run<'_> {
    pub(super) async fn create_conversion_pod(
        &self,
        vm: &mut VmStatus,
    ) -> Result<Outcome, PlanError> {
        let name = conversion_pod_name(&self.name, &vm.id);
        let volumes: Vec<String> = vm
            .disks
            .iter()
            .filter_map(|d| d.data_volume.clone())
            .collect();
        let secret = source_secret_name(&self.name);
        let pod = conversion_pod(&ConversionRequest {
            name: name.clone(),
            namespace: &self.namespace,
            image: &self.ctx.settings.virt_v2v_image,
            source_type: self.snapshot.source_type,
            vm_name: &vm.name,
            source_url: &self.resolved.source.spec.url,
            secret: &secret,
            volumes: &volumes,
            copy_disks: vm.flags.contains(Flag::VIRT_V2V_DISK_COPY),
            labels: self.labels(vm),
        });
        self.ctx.target.create(&TargetObject::Pod(pod)).await?;
        vm.add_helper(HelperKind::ConversionPod, &name);
        info!(pod = %name, "created guest conversion pod");
        Ok(Outcome::Done)
    }

    /// Follow the conversion pod through `ConvertGuest` or `CopyDisksVirtV2V`
    ///
    /// When the converter copies the disks, `ConvertGuest` hands over to
    /// `CopyDisksVirtV2V` as soon as copy progress shows up, and the copy
    /// step reports progress per disk until the pod exits.
    pub(super) async fn convert_guest(&self, vm: &mut VmStatus) -> Result<Outcome, PlanError> {
        let name = conversion_pod_name(&self.name, &vm.id);
        let copying = vm.phase == Phase::CopyDisksVirtV2V;
        match self.ctx.target.pod_state(&self.namespace, &name).await? {
            None => Err(PlanError::permanent(
                Reason::ConversionFailed,
                "Guest conversion pod not found.",
            )),
            Some(PodState::Succeeded) => {
                for disk in vm.disks.iter_mut() {
                    disk.done = true;
                    disk.percent = 100;
                    disk.transferred = disk.capacity;
                }
                debug!(pod = %name, "guest conversion pod succeeded");
                Ok(Outcome::Done)
            }
            Some(PodState::Failed { exit_code, message }) => {
                debug!(pod = %name, ?exit_code, %message, "guest conversion pod failed");
                Err(PlanError::permanent(
                    Reason::ConversionFailed,
                    "Guest conversion failed. See pod logs for details.",
                ))
            }
            Some(PodState::Pending) => Ok(Outcome::Wait(CONVERSION_POLL)),
            Some(PodState::Running) => {
                let Some(metrics) = self.ctx.target.pod_metrics(&self.namespace, &name).await?
                else {
                    return Ok(Outcome::Wait(CONVERSION_POLL));
                };
                let progressed = apply_progress(&mut vm.disks, &metrics);
                if !copying && progressed && vm.flags.contains(Flag::VIRT_V2V_DISK_COPY) {
                    return Ok(Outcome::Done);
                }
                Ok(Outcome::Wait(CONVERSION_POLL))
            }
        }
    }
}

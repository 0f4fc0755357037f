//! CreateVM step

use forklift_common::crd::{HelperKind, PowerState, VmStatus};
use tracing::info;

use super::{Outcome, Run};
use crate::error::PlanError;
use crate::kubevirt::{virtual_machine, VmRequest};
use crate::target::TargetObject;

impl Run<'_> {
    pub(super) async fn create_vm(&self, vm: &mut VmStatus) -> Result<Outcome, PlanError> {
        let source = self.source(vm)?;
        let volumes: Vec<String> = vm
            .disks
            .iter()
            .filter_map(|d| d.data_volume.clone())
            .collect();
        let labels = self.labels(vm);
        let manifest = virtual_machine(&VmRequest {
            name: &vm.target_name,
            namespace: &self.namespace,
            source: &source.vm,
            volumes: &volumes,
            networks: &self.snapshot.network,
            running: vm.restore_power_state == PowerState::On,
            labels: &labels,
        })?;
        self.ctx
            .target
            .create(&TargetObject::VirtualMachine(manifest))
            .await?;
        let name = vm.target_name.clone();
        vm.add_helper(HelperKind::VirtualMachine, name);
        info!(target = %vm.target_name, "created target VirtualMachine");
        Ok(Outcome::Done)
    }
}

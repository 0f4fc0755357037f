//! Steps that act on the source VM

use std::time::Duration;

use forklift_common::crd::{PowerState, VmStatus};
use forklift_common::Reason;
use forklift_itinerary::Mode;
use tracing::{debug, info};

use super::{Outcome, Run};
use crate::error::PlanError;

const POWER_POLL: Duration = Duration::from_secs(3);

impl Run<'_> {
    pub(super) async fn preflight(&self, vm: &mut VmStatus) -> Result<Outcome, PlanError> {
        let inspection = self.adapter().inspect(&vm.vm_ref()).await?;
        if self.mode() == Mode::Warm && !inspection.checkpointable {
            return Err(PlanError::permanent(
                Reason::WarmNotSupported,
                format!(
                    "VM '{}' cannot be checkpointed; change tracking is required for warm \
                     migration.",
                    vm.name
                ),
            ));
        }
        debug!(power = ?inspection.power_state, "preflight inspection passed");
        Ok(Outcome::Done)
    }

    pub(super) async fn store_power_state(&self, vm: &mut VmStatus) -> Result<Outcome, PlanError> {
        vm.restore_power_state = self.adapter().power_state(&vm.vm_ref()).await?;
        debug!(power = ?vm.restore_power_state, "stored source power state");
        Ok(Outcome::Done)
    }

    pub(super) async fn power_off(&self, vm: &mut VmStatus) -> Result<Outcome, PlanError> {
        let reference = vm.vm_ref();
        if self.adapter().power_state(&reference).await? == PowerState::Off {
            return Ok(Outcome::Done);
        }
        self.adapter().power_off(&reference).await.map_err(|e| {
            if e.is_retryable() {
                PlanError::transient(Reason::PowerOffFailed, e.to_string())
            } else {
                PlanError::permanent(Reason::PowerOffFailed, e.to_string())
            }
        })?;
        info!("requested source power off");
        Ok(Outcome::Done)
    }

    pub(super) async fn wait_for_power_off(&self, vm: &mut VmStatus) -> Result<Outcome, PlanError> {
        match self.adapter().power_state(&vm.vm_ref()).await? {
            PowerState::Off => Ok(Outcome::Done),
            _ => Ok(Outcome::Wait(POWER_POLL)),
        }
    }
}

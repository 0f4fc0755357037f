//! PreHook and PostHook steps

use std::time::Duration;

use forklift_common::crd::{HelperKind, HookStep, VmStatus};
use forklift_common::Reason;
use kube::ResourceExt;
use tracing::info;

use super::{Outcome, Run};
use crate::error::PlanError;
use crate::hook::{config_map, hook_name, job, outcome, HookOutcome, HookRequest};
use crate::target::TargetObject;

const HOOK_POLL: Duration = Duration::from_secs(5);

impl Run<'_> {
    pub(super) async fn run_hook(
        &self,
        vm: &mut VmStatus,
        step: HookStep,
    ) -> Result<Outcome, PlanError> {
        let retry = self.ctx.settings.hook_retry;
        let name = hook_name(&self.name, &vm.id, step);

        if let Some(state) = self.ctx.target.job_state(&self.namespace, &name).await? {
            return match outcome(&state, retry) {
                HookOutcome::Running => Ok(Outcome::Wait(HOOK_POLL)),
                HookOutcome::Succeeded => {
                    info!(hook = %name, %step, "hook succeeded");
                    Ok(Outcome::Done)
                }
                HookOutcome::Failed(message) => Err(PlanError::permanent(
                    Reason::HookFailed,
                    format!("Hook {step} failed: {message}"),
                )),
            };
        }

        let source = self.source(vm)?;
        let plan_ns = self.plan.namespace().unwrap_or_default();
        let reference = source
            .plan
            .hooks
            .iter()
            .find(|h| h.step.parse::<HookStep>().ok() == Some(step))
            .ok_or_else(|| {
                PlanError::permanent(Reason::HookNotFound, format!("no {step} hook for the VM"))
            })?;
        let hook = self
            .resolved
            .hook(&reference.hook, &plan_ns)
            .ok_or_else(|| {
                PlanError::permanent(
                    Reason::HookNotFound,
                    format!("Hook '{}' not found.", reference.hook.name),
                )
            })?;

        let request = HookRequest {
            name: name.clone(),
            namespace: &self.namespace,
            step,
            hook: &hook.spec,
            default_image: &self.ctx.settings.hook_default_image,
            vm: &source.vm,
            plan: &self.plan.spec,
            labels: self.labels(vm),
        };
        self.ctx
            .target
            .create(&TargetObject::ConfigMap(config_map(&request)?))
            .await?;
        vm.add_helper(HelperKind::HookConfigMap, &name);
        self.ctx
            .target
            .create(&TargetObject::Job(job(&request, retry)))
            .await?;
        vm.add_helper(HelperKind::HookJob, &name);
        info!(hook = %name, %step, "started hook job");
        Ok(Outcome::Wait(HOOK_POLL))
    }
}

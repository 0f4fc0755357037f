//! Per-VM step execution
//!
//! Each reconcile runs one tick over the active Migration: the scheduler
//! decides which VMs move, and every moving VM runs its current step until
//! the step has to wait. Step handlers live in the submodules, grouped the
//! way the itinerary groups its phases.

mod disks;
mod guest;
mod hooks;
mod source;
mod start;
mod virtual_machine;
mod warm;

pub use start::{source_secret_name, start};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use forklift_adapter::SourceAdapter;
use forklift_common::conditions::{CANCELED, FAILED, REASON_COMPLETED, SUCCEEDED};
use forklift_common::crd::{
    set_condition, Category, Condition, HookStep, MappingSnapshot, Migration, MigrationStatus,
    Plan, PowerState, ProviderType, StepPhase, StepStatus, VmError, VmStatus, WarmStatus,
};
use forklift_common::events::{actions, reasons};
use forklift_common::metrics::{self, VmOutcome};
use forklift_common::retry::backoff_delay;
use forklift_common::{Error, Reason};
use forklift_itinerary::{itinerary, Flag, Mode, Next, Phase};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::cleanup::Cleaner;
use crate::controller::Context;
use crate::error::PlanError;
use crate::kubevirt::owner_labels;
use crate::scheduler::{effective_cutover, schedule, Decision};
use crate::validation::{Resolved, ResolvedVm};

/// Steps run for one VM within a single tick
const MAX_STEPS_PER_TICK: usize = 32;
/// Requeue while a cancel waits on cleanup
const CANCEL_RETRY: Duration = Duration::from_secs(5);

/// What a step handler asks the executor to do next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The step finished; move to the next one
    Done,
    /// Try again after the delay
    Wait(Duration),
    /// Continue at a phase outside the normal order
    Jump(Phase),
}

/// Mutable state shared by the VMs of one tick
pub(crate) struct Tick {
    /// Transfer slots still free
    pub slots: usize,
    /// Effective warm cutover
    pub cutover: Option<DateTime<Utc>>,
}

/// One tick over one Migration
pub(crate) struct Run<'a> {
    pub ctx: &'a Context,
    pub plan: &'a Plan,
    pub migration: &'a Migration,
    pub resolved: &'a Resolved,
    pub snapshot: MappingSnapshot,
    pub name: String,
    pub namespace: String,
    pub now: DateTime<Utc>,
}

pub(crate) fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::days(365))
}

fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or_default()
}

/// Advance every VM of a started Migration by one tick
///
/// Returns the shortest wait any VM asked for.
pub async fn execute(
    plan: &Plan,
    migration: &Migration,
    resolved: &Resolved,
    ctx: &Context,
    status: &mut MigrationStatus,
    now: DateTime<Utc>,
) -> Result<Option<Duration>, PlanError> {
    let snapshot = status.snapshot.clone().ok_or_else(|| {
        Error::internal_with_context("executor", "migration started without a mapping snapshot")
    })?;
    let plan_schedule = schedule(&migration.spec, status, ctx.settings.max_vm_inflight);
    let cutover = match snapshot.mode {
        Mode::Warm => {
            let c = effective_cutover(
                &migration.spec,
                status,
                ctx.settings.cutover_default_delay,
                now,
            );
            status.cutover = c;
            c
        }
        Mode::Cold => None,
    };

    let run = Run {
        ctx,
        plan,
        migration,
        resolved,
        name: migration.name_any(),
        namespace: snapshot.target_namespace.clone(),
        snapshot,
        now,
    };
    let mut tick = Tick {
        slots: plan_schedule.free_slots,
        cutover,
    };
    debug!(
        vms = status.vms.len(),
        free_slots = tick.slots,
        "executing migration tick"
    );

    let mut hint: Option<Duration> = None;
    for (index, decision) in plan_schedule.decisions {
        let Some(vm) = status.vms.get_mut(index) else {
            continue;
        };
        let wait = match decision {
            Decision::Done | Decision::Hold => None,
            Decision::Cancel => run.cancel(vm).await,
            Decision::Admit => {
                run.admit(vm).await;
                run.advance(vm, &mut tick).await
            }
            Decision::Advance => run.advance(vm, &mut tick).await,
        };
        hint = match (hint, wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
    Ok(hint)
}

impl Run<'_> {
    pub(crate) fn adapter(&self) -> &Arc<dyn SourceAdapter> {
        &self.resolved.adapter
    }

    /// Inventory and plan entry of a VM
    pub(crate) fn source(&self, vm: &VmStatus) -> Result<&ResolvedVm, PlanError> {
        self.resolved.vm(&vm.id).ok_or_else(|| {
            PlanError::permanent(
                Reason::VmNotFound,
                format!("VM '{}' is no longer part of the plan.", vm.name),
            )
        })
    }

    pub(crate) fn labels(&self, vm: &VmStatus) -> BTreeMap<String, String> {
        owner_labels(&self.plan.name_any(), &self.name, &vm.id)
    }

    fn mode(&self) -> Mode {
        self.snapshot.mode
    }

    async fn publish(&self, type_: EventType, reason: &str, action: &str, note: String) {
        self.ctx
            .events
            .publish(&self.migration.object_ref(&()), type_, reason, action, Some(note))
            .await;
    }

    /// Flags describing how this VM migrates
    fn flags(&self, vm: &VmStatus) -> Flag {
        let caps = self.adapter().capabilities();
        let mut flags = Flag::NONE;
        if caps.requires_conversion()
            && (!self.plan.spec.skip_guest_conversion || caps.converter_copies_disks())
        {
            flags |= Flag::REQUIRES_CONVERSION;
        }
        if caps.converter_copies_disks() {
            flags |= Flag::VIRT_V2V_DISK_COPY;
        } else if caps.image_based() {
            flags |= Flag::OPENSTACK_IMAGE;
        } else {
            flags |= Flag::CDI_DISK_COPY;
        }
        if self.snapshot.source_type == ProviderType::VSphere {
            flags |= Flag::VSPHERE;
        }
        if self.mode() == Mode::Warm {
            flags |= Flag::NEEDS_SNAPSHOT;
        }
        if self.plan.spec.run_preflight_inspection {
            flags |= Flag::RUN_PREFLIGHT;
        }
        if let Ok(source) = self.source(vm) {
            for hook in &source.plan.hooks {
                match hook.step.parse::<HookStep>() {
                    Ok(HookStep::PreHook) => flags |= Flag::HAS_PRE_HOOK,
                    Ok(HookStep::PostHook) => flags |= Flag::HAS_POST_HOOK,
                    Err(_) => {}
                }
            }
        }
        flags
    }

    /// Build the VM's pipeline and enter its first step
    #[instrument(skip(self, vm), fields(vm = %vm.id))]
    async fn admit(&self, vm: &mut VmStatus) {
        let flags = self.flags(vm);
        vm.flags = flags;
        vm.pipeline = itinerary(self.mode())
            .steps(&flags)
            .into_iter()
            .map(|phase| StepStatus {
                name: phase,
                description: phase.description().to_string(),
                ..Default::default()
            })
            .collect();
        vm.started = Some(self.now);
        if self.mode() == Mode::Warm {
            vm.warm.get_or_insert_with(WarmStatus::default);
        }
        info!(steps = vm.pipeline.len(), flags = flags.0, "admitted VM");
        match itinerary(self.mode()).first(&flags) {
            Next::Step(first) => self.transition(vm, first).await,
            Next::Done => {
                let err = PlanError::permanent(Reason::Internal, "the itinerary has no steps");
                self.fail(vm, err).await;
            }
        }
    }

    /// Run the VM's current step until it waits or the VM finishes
    #[instrument(skip(self, vm, tick), fields(vm = %vm.id))]
    async fn advance(&self, vm: &mut VmStatus, tick: &mut Tick) -> Option<Duration> {
        if vm.phase == Phase::Pending || vm.is_terminal() {
            return None;
        }
        if let Some(at) = vm.next_attempt_at {
            if at > self.now {
                return Some(until(self.now, at));
            }
        }
        for _ in 0..MAX_STEPS_PER_TICK {
            if let Some(err) = self.timed_out(vm) {
                self.fail(vm, err).await;
                return None;
            }
            let phase = vm.phase;
            let outcome = match self.step(vm, tick).await {
                Ok(outcome) => outcome,
                Err(e) => return self.attempt_failed(vm, e).await,
            };
            // The retry budget counts consecutive failed attempts
            vm.retries = 0;
            if let Some(step) = vm.step_mut(phase) {
                step.error = None;
            }
            match outcome {
                Outcome::Wait(delay) => {
                    vm.next_attempt_at = None;
                    return Some(delay);
                }
                Outcome::Done => match itinerary(self.mode()).next(phase, &vm.flags) {
                    Ok(Next::Step(next)) => self.transition(vm, next).await,
                    Ok(Next::Done) => return None,
                    Err(e) => {
                        self.fail(vm, e.into()).await;
                        return None;
                    }
                },
                Outcome::Jump(target) => self.jump(vm, target).await,
            }
            if vm.is_terminal() {
                return None;
            }
        }
        Some(Duration::from_secs(1))
    }

    async fn step(&self, vm: &mut VmStatus, tick: &mut Tick) -> Result<Outcome, PlanError> {
        match vm.phase {
            Phase::Started => Ok(Outcome::Done),
            Phase::PreHook => self.run_hook(vm, HookStep::PreHook).await,
            Phase::PostHook => self.run_hook(vm, HookStep::PostHook).await,
            Phase::PreflightInspection => self.preflight(vm).await,
            Phase::StorePowerState => self.store_power_state(vm).await,
            Phase::PowerOffSource => self.power_off(vm).await,
            Phase::WaitForPowerOff => self.wait_for_power_off(vm).await,
            Phase::CreateDataVolumes => self.create_data_volumes(vm).await,
            Phase::CopyDisks => self.copy_disks(vm).await,
            Phase::CreateGuestConversionPod => self.create_conversion_pod(vm).await,
            Phase::ConvertGuest | Phase::CopyDisksVirtV2V => self.convert_guest(vm).await,
            Phase::ConvertOpenstackSnapshot => self.convert_images(vm).await,
            Phase::CreateVM => self.create_vm(vm).await,
            Phase::CreateInitialSnapshot | Phase::CreateSnapshot | Phase::CreateFinalSnapshot => {
                self.create_snapshot(vm).await
            }
            Phase::WaitForInitialSnapshot
            | Phase::WaitForSnapshot
            | Phase::WaitForFinalSnapshot => self.wait_for_snapshot(vm).await,
            Phase::StoreInitialSnapshotDeltas
            | Phase::StoreSnapshotDeltas
            | Phase::StoreFinalSnapshotDeltas => self.store_deltas(vm).await,
            Phase::RemovePreviousSnapshot => self.remove_previous_snapshot(vm).await,
            Phase::WaitForPreviousSnapshotRemoval => self.wait_for_previous_removal(vm).await,
            Phase::CopyingPaused => self.copying_paused(vm, tick).await,
            Phase::AddFinalCheckpoint => self.add_final_checkpoint(vm),
            Phase::RemoveFinalSnapshot => self.remove_final_snapshot(vm).await,
            Phase::Pending | Phase::Completed | Phase::Failed | Phase::Canceled => {
                Err(PlanError::permanent(
                    Reason::Internal,
                    format!("phase {} has no step", vm.phase),
                ))
            }
        }
    }

    /// Step deadline for a phase, if it has one
    fn deadline(&self, phase: Phase) -> Option<Duration> {
        match phase {
            Phase::CopyDisks
            | Phase::CopyDisksVirtV2V
            | Phase::ConvertGuest
            | Phase::ConvertOpenstackSnapshot
            | Phase::StoreInitialSnapshotDeltas
            | Phase::StoreSnapshotDeltas
            | Phase::StoreFinalSnapshotDeltas => Some(self.ctx.settings.disk_transfer_timeout),
            Phase::WaitForInitialSnapshot
            | Phase::WaitForSnapshot
            | Phase::WaitForFinalSnapshot
            | Phase::WaitForPreviousSnapshotRemoval
            | Phase::RemoveFinalSnapshot => Some(self.ctx.settings.snapshot_removal_timeout),
            _ => None,
        }
    }

    fn timed_out(&self, vm: &VmStatus) -> Option<PlanError> {
        let limit = self.deadline(vm.phase)?;
        let started = vm.phase_started?;
        let elapsed = (self.now - started).to_std().unwrap_or_default();
        (elapsed > limit).then(|| {
            PlanError::permanent(
                Reason::StepTimeout,
                format!(
                    "Step {} did not finish within {}s.",
                    vm.phase,
                    limit.as_secs()
                ),
            )
        })
    }

    /// Book a failed step attempt; retryable failures back off
    async fn attempt_failed(&self, vm: &mut VmStatus, err: PlanError) -> Option<Duration> {
        if !err.is_retryable() {
            self.fail(vm, err).await;
            return None;
        }
        let settings = &self.ctx.settings;
        vm.retries += 1;
        if vm.retries > settings.step_retry_budget {
            let exhausted = PlanError::permanent(
                Reason::RetryBudgetExhausted,
                format!(
                    "Step {} failed {} times: {err}",
                    vm.phase, vm.retries
                ),
            );
            self.fail(vm, exhausted).await;
            return None;
        }
        let delay = backoff_delay(
            settings.step_retry_backoff,
            settings.step_retry_backoff_max,
            vm.retries - 1,
        );
        warn!(
            error = %err,
            phase = %vm.phase,
            retries = vm.retries,
            delay_secs = delay.as_secs(),
            "step failed; retrying"
        );
        vm.next_attempt_at = Some(later(self.now, delay));
        let phase = vm.phase;
        if let Some(step) = vm.step_mut(phase) {
            step.error = Some(err.to_string());
        }
        Some(delay)
    }

    /// Leave the current step for `next`
    async fn transition(&self, vm: &mut VmStatus, next: Phase) {
        let now = self.now;
        let previous = vm.phase;
        if let Some(step) = vm.step_mut(previous) {
            step.phase = StepPhase::Completed;
            step.completed = Some(now);
            step.progress.completed = step.progress.total;
        }
        vm.phase = next;
        vm.retries = 0;
        vm.next_attempt_at = None;
        vm.phase_started = Some(now);
        if let Some(step) = vm.step_mut(next) {
            step.phase = StepPhase::Running;
            step.started = Some(now);
            step.completed = None;
            step.error = None;
        }
        if let Ok(progress) = itinerary(self.mode()).progress(next, &vm.flags) {
            if progress.completed > vm.progress.completed || progress.total != vm.progress.total {
                vm.progress = progress;
            }
        }
        metrics::record_step_transition(next.as_str());
        debug!(from = %previous, to = %next, "VM changed phase");
        self.on_enter(vm, next);
        if next == Phase::Completed {
            self.succeed(vm).await;
        }
    }

    fn on_enter(&self, vm: &mut VmStatus, phase: Phase) {
        match phase {
            Phase::StoreInitialSnapshotDeltas
            | Phase::StoreSnapshotDeltas
            | Phase::StoreFinalSnapshotDeltas => {
                for disk in vm.disks.iter_mut() {
                    disk.done = false;
                    disk.worker = None;
                    disk.transferred = 0;
                    disk.percent = 0;
                }
            }
            Phase::CopyingPaused => {
                let at = later(self.now, self.ctx.settings.precopy_interval);
                vm.warm.get_or_insert_with(WarmStatus::default).next_precopy_at = Some(at);
            }
            _ => {}
        }
    }

    /// Take the precopy loop back to `target`
    async fn jump(&self, vm: &mut VmStatus, target: Phase) {
        let from = vm.phase;
        self.transition(vm, target).await;
        let steps = itinerary(self.mode()).steps(&vm.flags);
        let start = steps.iter().position(|p| *p == target);
        let end = steps.iter().position(|p| *p == from);
        if let (Some(start), Some(end)) = (start, end) {
            for phase in &steps[start + 1..=end] {
                if let Some(step) = vm.step_mut(*phase) {
                    step.phase = StepPhase::Pending;
                    step.started = None;
                    step.completed = None;
                }
            }
        }
    }

    fn cleaner(&self) -> Cleaner<'_> {
        Cleaner::new(
            self.ctx,
            &self.namespace,
            &self.name,
            Some(self.adapter().clone()),
        )
    }

    fn finish(&self, vm: &mut VmStatus, phase: Phase, condition: Condition) {
        vm.phase = phase;
        vm.completed = Some(self.now);
        vm.next_attempt_at = None;
        set_condition(&mut vm.conditions, condition.at(self.now));
    }

    async fn succeed(&self, vm: &mut VmStatus) {
        if let Err(e) = self.cleaner().cleanup(vm, false).await {
            warn!(error = %e, vm = %vm.id, "cleanup after success left helpers behind");
        }
        if let Some(step) = vm.step_mut(Phase::Completed) {
            step.phase = StepPhase::Completed;
            step.completed = Some(self.now);
        }
        vm.progress.completed = vm.progress.total;
        self.finish(
            vm,
            Phase::Completed,
            Condition::truthy(
                SUCCEEDED,
                Category::Advisory,
                REASON_COMPLETED,
                "The VM migration has succeeded.",
            ),
        );
        metrics::record_vm_outcome(&self.mode().to_string(), VmOutcome::Succeeded);
        info!(vm = %vm.id, "VM migrated");
        self.publish(
            EventType::Normal,
            reasons::VM_SUCCEEDED,
            actions::MIGRATE,
            format!("VM '{}' was migrated as '{}'.", vm.name, vm.target_name),
        )
        .await;
    }

    async fn fail(&self, vm: &mut VmStatus, err: PlanError) {
        let reason = err.reason();
        let message = err.to_string();
        let phase = vm.phase;
        vm.error = Some(VmError {
            phase,
            reason: reason.as_str().to_string(),
            reasons: vec![message.clone()],
        });
        if let Some(step) = vm.step_mut(phase) {
            step.phase = StepPhase::Failed;
            step.completed = Some(self.now);
            step.error = Some(message.clone());
        }
        let delete_target = self.plan.spec.delete_vm_on_fail_migration;
        if let Err(e) = self.cleaner().cleanup(vm, delete_target).await {
            warn!(error = %e, vm = %vm.id, "cleanup after failure left helpers behind");
        }
        self.finish(
            vm,
            Phase::Failed,
            Condition::truthy(FAILED, Category::Error, reason.as_str(), message.clone()),
        );
        metrics::record_vm_outcome(&self.mode().to_string(), VmOutcome::Failed);
        warn!(vm = %vm.id, %phase, reason = reason.as_str(), %message, "VM migration failed");
        self.publish(
            EventType::Warning,
            reasons::VM_FAILED,
            actions::MIGRATE,
            format!("VM '{}' failed in {phase}: {message}", vm.name),
        )
        .await;
    }

    /// Drive a canceled VM to `Canceled`
    ///
    /// Other VMs are not touched. The source is powered back on when it
    /// was running before the migration.
    #[instrument(skip(self, vm), fields(vm = %vm.id))]
    async fn cancel(&self, vm: &mut VmStatus) -> Option<Duration> {
        if vm.phase != Phase::Pending {
            if let Err(e) = self.cleaner().cleanup(vm, true).await {
                warn!(error = %e, "cancel waits on cleanup");
                return Some(CANCEL_RETRY);
            }
            if vm.restore_power_state == PowerState::On {
                self.restore_power(vm).await;
            }
            let phase = vm.phase;
            if let Some(step) = vm.step_mut(phase) {
                step.phase = StepPhase::Completed;
                step.completed = Some(self.now);
                step.error = Some("Canceled.".to_string());
            }
        }
        self.finish(
            vm,
            Phase::Canceled,
            Condition::truthy(
                CANCELED,
                Category::Advisory,
                Reason::UserRequested.as_str(),
                "The migration has been canceled.",
            ),
        );
        metrics::record_vm_outcome(&self.mode().to_string(), VmOutcome::Canceled);
        info!("VM canceled");
        self.publish(
            EventType::Normal,
            reasons::VM_CANCELED,
            actions::CANCEL,
            format!("VM '{}' was canceled.", vm.name),
        )
        .await;
        None
    }

    async fn restore_power(&self, vm: &VmStatus) {
        let reference = vm.vm_ref();
        match self.adapter().power_state(&reference).await {
            Ok(PowerState::Off) => {
                if let Err(e) = self.adapter().power_on(&reference).await {
                    warn!(error = %e, "could not power the source VM back on");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not read the source power state"),
        }
    }
}

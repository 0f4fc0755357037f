//! Status rollups
//!
//! VM state rolls up into the Migration's conditions, and the active
//! Migration rolls up into the Plan's conditions, progress and summary.

use chrono::{DateTime, Utc};
use forklift_common::conditions::{
    CANCELED, EXECUTING, FAILED, REASON_COMPLETED, REASON_STARTED, RUNNING, SUCCEEDED,
};
use forklift_common::crd::{
    remove_condition, same_conditions, set_condition, Category, Condition, Migration,
    MigrationStatus, PlanMigrationSummary, PlanStatus, PlanVmSummary, VmStatus,
};
use forklift_itinerary::{Phase, Progress};
use kube::ResourceExt;

/// Counts of VMs by outcome
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    /// Admitted and not terminal
    pub running: usize,
    /// Not yet admitted
    pub pending: usize,
    /// Migrated
    pub succeeded: usize,
    /// Failed
    pub failed: usize,
    /// Canceled
    pub canceled: usize,
}

impl Tally {
    /// Count a VM list
    pub fn of(vms: &[VmStatus]) -> Self {
        let mut t = Self::default();
        for vm in vms {
            match vm.phase {
                Phase::Pending => t.pending += 1,
                Phase::Completed => t.succeeded += 1,
                Phase::Failed => t.failed += 1,
                Phase::Canceled => t.canceled += 1,
                _ => t.running += 1,
            }
        }
        t
    }

    /// VMs still to finish
    pub fn unfinished(&self) -> usize {
        self.running + self.pending
    }
}

struct Flagger<'a> {
    conditions: &'a mut Vec<Condition>,
    now: DateTime<Utc>,
}

impl Flagger<'_> {
    fn flag(&mut self, type_: &str, on: bool, reason: &str, message: String) {
        if on {
            set_condition(
                self.conditions,
                Condition::truthy(type_, Category::Advisory, reason, message).at(self.now),
            );
        } else {
            remove_condition(self.conditions, type_);
        }
    }
}

/// Migration conditions and completion from its VMs
pub fn roll_up(status: &mut MigrationStatus, now: DateTime<Utc>) {
    let tally = Tally::of(&status.vms);
    if status.started.is_some() && status.completed.is_none() && tally.unfinished() == 0 {
        status.completed = Some(now);
    }
    let done = status.completed.is_some();
    let started = status.started.is_some();
    let total = status.vms.len();

    let mut f = Flagger {
        conditions: &mut status.conditions,
        now,
    };
    f.flag(
        RUNNING,
        started && !done,
        REASON_STARTED,
        format!("{} of {total} VMs in progress.", tally.running),
    );
    f.flag(
        FAILED,
        done && tally.failed > 0,
        REASON_COMPLETED,
        format!("{} of {total} VMs failed.", tally.failed),
    );
    f.flag(
        SUCCEEDED,
        done && tally.failed == 0 && (tally.succeeded > 0 || total == 0),
        REASON_COMPLETED,
        format!("{} of {total} VMs migrated.", tally.succeeded),
    );
    f.flag(
        CANCELED,
        done && total > 0 && tally.canceled == total,
        REASON_COMPLETED,
        "The migration was canceled.".to_string(),
    );
}

/// Plan conditions, progress and summary from a Migration
pub fn fold_plan(
    plan: &mut PlanStatus,
    migration: Option<(&Migration, &MigrationStatus)>,
    now: DateTime<Utc>,
) {
    let Some((migration, status)) = migration else {
        for type_ in [EXECUTING, RUNNING, SUCCEEDED, FAILED, CANCELED] {
            remove_condition(&mut plan.conditions, type_);
        }
        return;
    };
    let tally = Tally::of(&status.vms);
    let total = status.vms.len();
    let executing = status.is_running();

    let mut f = Flagger {
        conditions: &mut plan.conditions,
        now,
    };
    f.flag(
        EXECUTING,
        executing,
        REASON_STARTED,
        format!("Migration '{}' is running.", migration.name_any()),
    );
    f.flag(
        RUNNING,
        executing && tally.unfinished() > 0,
        REASON_STARTED,
        format!("{} of {total} VMs in progress.", tally.running),
    );
    f.flag(
        SUCCEEDED,
        total > 0 && tally.succeeded == total,
        REASON_COMPLETED,
        "Every VM was migrated.".to_string(),
    );
    f.flag(
        FAILED,
        tally.failed > 0 && tally.unfinished() == 0,
        REASON_COMPLETED,
        format!("{} of {total} VMs failed.", tally.failed),
    );
    f.flag(
        CANCELED,
        total > 0 && tally.canceled == total,
        REASON_COMPLETED,
        "Every VM was canceled.".to_string(),
    );

    plan.progress = status
        .vms
        .iter()
        .fold(Progress::default(), |acc, vm| acc.add(vm.progress));
    plan.migration = Some(PlanMigrationSummary {
        name: migration.name_any(),
        started: status.started,
        completed: status.completed,
        vms: status
            .vms
            .iter()
            .map(|vm| PlanVmSummary {
                id: vm.id.clone(),
                name: vm.name.clone(),
                phase: vm.phase,
                progress: vm.progress,
            })
            .collect(),
    });
}

/// Whether two plan statuses differ only in condition timestamps
pub fn same_plan_status(a: &PlanStatus, b: &PlanStatus) -> bool {
    a.observed_generation == b.observed_generation
        && a.migration == b.migration
        && a.progress == b.progress
        && a.started_mode == b.started_mode
        && a.archive_requested == b.archive_requested
        && same_conditions(&a.conditions, &b.conditions)
}

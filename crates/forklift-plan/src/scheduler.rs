//! Migration scheduler
//!
//! Pure decisions over a migration's VM list: which VMs to admit, advance,
//! hold, or cancel on this tick. VMs are visited in ID order so repeated
//! ticks over the same state decide the same way.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use forklift_common::crd::{MigrationSpec, MigrationStatus, VmStatus};
use forklift_itinerary::Phase;
use std::time::Duration;

/// What to do with one VM this tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Start the VM's itinerary
    Admit,
    /// Run the VM's current step
    Advance,
    /// Leave the VM pending
    Hold,
    /// Drive the VM through cleanup to `Canceled`
    Cancel,
    /// Terminal; nothing to do
    Done,
}

/// Decisions for one tick
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    /// `(index into status.vms, decision)` in visiting order
    pub decisions: Vec<(usize, Decision)>,
    /// Transfer slots left after admission
    pub free_slots: usize,
}

impl Schedule {
    /// Decision for the VM at `index`
    pub fn decision(&self, index: usize) -> Option<Decision> {
        self.decisions
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, d)| *d)
    }
}

/// Whether a VM holds a transfer slot
///
/// A warm VM parked between precopies does not.
pub fn holds_slot(vm: &VmStatus) -> bool {
    vm.is_running() && vm.phase != Phase::CopyingPaused
}

/// Decide every VM of a migration
pub fn schedule(spec: &MigrationSpec, status: &MigrationStatus, max_inflight: usize) -> Schedule {
    let mut order: Vec<usize> = (0..status.vms.len()).collect();
    order.sort_by(|a, b| status.vms[*a].id.cmp(&status.vms[*b].id));

    let in_flight = status
        .vms
        .iter()
        .filter(|vm| holds_slot(vm) && !spec.is_canceled(&vm.vm_ref()))
        .count();
    let mut free_slots = max_inflight.saturating_sub(in_flight);

    let decisions = order
        .into_iter()
        .map(|i| {
            let vm = &status.vms[i];
            let decision = if vm.is_terminal() {
                Decision::Done
            } else if spec.is_canceled(&vm.vm_ref()) {
                Decision::Cancel
            } else if vm.phase == Phase::Pending {
                if free_slots > 0 {
                    free_slots -= 1;
                    Decision::Admit
                } else {
                    Decision::Hold
                }
            } else {
                Decision::Advance
            };
            (i, decision)
        })
        .collect();

    Schedule {
        decisions,
        free_slots,
    }
}

/// Effective warm cutover
///
/// Once the recorded cutover has passed the barrier is released and later
/// edits to the Migration are ignored.
pub fn effective_cutover(
    spec: &MigrationSpec,
    status: &MigrationStatus,
    default_delay: Duration,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if let Some(recorded) = status.cutover {
        if recorded <= now {
            return Some(recorded);
        }
    }
    spec.cutover.or(status.cutover).or_else(|| {
        let delay = ChronoDuration::from_std(default_delay).ok()?;
        status.started.map(|started| started + delay)
    })
}

/// Whether the cutover barrier is released
pub fn cutover_reached(cutover: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    cutover.is_some_and(|c| now >= c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forklift_common::crd::{ObjectRef, Ref};
    use rstest::rstest;

    fn vm(id: &str, phase: Phase) -> VmStatus {
        let mut vm = VmStatus::new(id, id);
        vm.phase = phase;
        vm
    }

    fn status(vms: Vec<VmStatus>) -> MigrationStatus {
        MigrationStatus {
            vms,
            ..Default::default()
        }
    }

    fn spec(cancel: &[&str]) -> MigrationSpec {
        MigrationSpec {
            plan: ObjectRef::new("p1", "ns"),
            cutover: None,
            cancel: cancel.iter().map(|id| Ref::by_id(*id)).collect(),
        }
    }

    /// Story: with one slot, only the lowest pending ID is admitted
    #[test]
    fn story_admission_is_bounded_and_ordered() {
        let st = status(vec![
            vm("c", Phase::Pending),
            vm("a", Phase::Pending),
            vm("b", Phase::Pending),
        ]);
        let s = schedule(&spec(&[]), &st, 1);
        assert_eq!(s.decision(1), Some(Decision::Admit));
        assert_eq!(s.decision(2), Some(Decision::Hold));
        assert_eq!(s.decision(0), Some(Decision::Hold));
        assert_eq!(s.free_slots, 0);
        let visited: Vec<usize> = s.decisions.iter().map(|(i, _)| *i).collect();
        assert_eq!(visited, vec![1, 2, 0]);
    }

    /// Story: a warm VM parked between precopies frees its slot for the next VM
    #[test]
    fn story_paused_vm_does_not_hold_a_slot() {
        let st = status(vec![vm("a", Phase::CopyingPaused), vm("b", Phase::Pending)]);
        let s = schedule(&spec(&[]), &st, 1);
        assert_eq!(s.decision(0), Some(Decision::Advance));
        assert_eq!(s.decision(1), Some(Decision::Admit));
    }

    #[rstest]
    #[case::terminal(Phase::Completed, &["a"], Decision::Done)]
    #[case::running_canceled(Phase::CopyDisks, &["a"], Decision::Cancel)]
    #[case::pending_canceled(Phase::Pending, &["a"], Decision::Cancel)]
    #[case::running(Phase::CopyDisks, &[], Decision::Advance)]
    fn single_vm_decisions(
        #[case] phase: Phase,
        #[case] cancel: &[&str],
        #[case] expected: Decision,
    ) {
        let s = schedule(&spec(cancel), &status(vec![vm("a", phase)]), 1);
        assert_eq!(s.decision(0), Some(expected));
    }

    #[test]
    fn canceling_a_running_vm_frees_its_slot() {
        let st = status(vec![vm("a", Phase::CopyDisks), vm("b", Phase::Pending)]);
        let s = schedule(&spec(&["a"]), &st, 1);
        assert_eq!(s.decision(0), Some(Decision::Cancel));
        assert_eq!(s.decision(1), Some(Decision::Admit));
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + ChronoDuration::minutes(minutes)
    }

    #[test]
    fn cutover_defaults_to_start_plus_delay() {
        let mut st = status(vec![]);
        st.started = Some(at(0));
        let cutover = effective_cutover(&spec(&[]), &st, Duration::from_secs(3600), at(10));
        assert_eq!(cutover, Some(at(60)));
        assert!(!cutover_reached(cutover, at(59)));
        assert!(cutover_reached(cutover, at(60)));
    }

    #[test]
    fn rescheduling_before_release_moves_the_barrier() {
        let mut st = status(vec![]);
        st.started = Some(at(0));
        st.cutover = Some(at(60));
        let mut sp = spec(&[]);
        sp.cutover = Some(at(120));
        assert_eq!(effective_cutover(&sp, &st, Duration::from_secs(3600), at(30)), Some(at(120)));
    }

    #[test]
    fn rescheduling_after_release_is_ignored() {
        let mut st = status(vec![]);
        st.started = Some(at(0));
        st.cutover = Some(at(60));
        let mut sp = spec(&[]);
        sp.cutover = Some(at(180));
        assert_eq!(effective_cutover(&sp, &st, Duration::from_secs(3600), at(61)), Some(at(60)));
    }
}

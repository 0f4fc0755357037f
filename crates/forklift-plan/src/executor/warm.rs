//! Warm precopy loop
//!
//! Each round snapshots the source, records the changed blocks of every
//! disk against the previous round's baseline, and copies them with a
//! populator worker pinned to the snapshot. The previous round's snapshot
//! is removed before the VM pauses until the next round or the cutover.

use std::time::Duration;

use forklift_adapter::SnapshotState;
use forklift_common::crd::{HelperKind, Precopy, VmStatus, WarmStatus};
use forklift_common::events::{actions, reasons};
use forklift_common::Reason;
use forklift_itinerary::Phase;
use forklift_populator::{dns_name, DiskKey};
use kube::runtime::events::EventType;
use tracing::{debug, info};

use super::disks::TRANSFER_POLL;
use super::{until, Outcome, Run, Tick};
use crate::deltas::delta_key;
use crate::error::PlanError;
use crate::scheduler::cutover_reached;

const SNAPSHOT_POLL: Duration = Duration::from_secs(5);
/// Option carrying the change baseline to the populator
const CHANGE_ID_OPTION: &str = "changeId";

fn warm(vm: &mut VmStatus) -> &mut WarmStatus {
    vm.warm.get_or_insert_with(WarmStatus::default)
}

fn current_snapshot(vm: &VmStatus) -> Result<String, PlanError> {
    vm.warm
        .as_ref()
        .and_then(|w| w.current_snapshot.clone())
        .ok_or_else(|| PlanError::permanent(Reason::Internal, "no current snapshot"))
}

impl Run<'_> {
    pub(super) async fn create_snapshot(&self, vm: &mut VmStatus) -> Result<Outcome, PlanError> {
        let open = vm
            .warm
            .as_ref()
            .and_then(|w| w.precopies.last())
            .is_some_and(|p| p.end.is_none());
        if open {
            return Ok(Outcome::Done);
        }
        let round = vm.warm.as_ref().map_or(0, |w| w.precopies.len());
        let name = dns_name(&format!("forklift-{}-{round}", self.name));
        let id = self.adapter().create_snapshot(&vm.vm_ref(), &name).await?;
        let now = self.now;
        let state = warm(vm);
        state.previous_snapshot = state.current_snapshot.replace(id.clone());
        state.precopies.push(Precopy {
            snapshot: id.clone(),
            start: now,
            end: None,
            delta_bytes: 0,
        });
        vm.add_helper(HelperKind::Snapshot, &id);
        info!(snapshot = %id, round, "created source snapshot");
        Ok(Outcome::Done)
    }

    pub(super) async fn wait_for_snapshot(&self, vm: &mut VmStatus) -> Result<Outcome, PlanError> {
        let snapshot = current_snapshot(vm)?;
        match self.adapter().snapshot_state(&vm.vm_ref(), &snapshot).await? {
            SnapshotState::Ready => Ok(Outcome::Done),
            SnapshotState::Creating => Ok(Outcome::Wait(SNAPSHOT_POLL)),
            SnapshotState::Failed(message) => Err(PlanError::permanent(
                Reason::SnapshotFailed,
                format!("Snapshot '{snapshot}' failed: {message}"),
            )),
            SnapshotState::Gone | SnapshotState::Removing => Err(PlanError::transient(
                Reason::SnapshotFailed,
                format!("Snapshot '{snapshot}' disappeared before it was ready."),
            )),
        }
    }

    /// Copy the changed blocks of every disk for the current round
    pub(super) async fn store_deltas(&self, vm: &mut VmStatus) -> Result<Outcome, PlanError> {
        let snapshot = current_snapshot(vm)?;
        let round = vm
            .warm
            .as_ref()
            .map_or(0, |w| w.precopies.len().saturating_sub(1));
        let round = u16::try_from(round).unwrap_or(u16::MAX);
        let key = delta_key(&self.name, &vm.id);
        let recorded = self.ctx.deltas.round(&key, round)?;
        let reference = vm.vm_ref();
        let vm_id = vm.id.clone();

        for index in 0..vm.disks.len() {
            if vm.disks[index].done {
                continue;
            }
            if vm.disks[index].worker.is_none() {
                let disk = &vm.disks[index];
                let baseline = disk.change_id.clone();
                if !recorded.iter().any(|c| c.disk == disk.id) {
                    let changes = self
                        .adapter()
                        .changes(&reference, &disk.id, baseline.clone(), &snapshot)
                        .await?;
                    self.ctx.deltas.record(&key, round, &changes)?;
                    debug!(disk = %disk.id, bytes = changes.delta_bytes(), "recorded disk changes");
                }
                let claim = self.claim_of(disk)?.to_string();
                let mut handle = self
                    .adapter()
                    .open_disk(&reference, &disk.id, Some(snapshot.clone()))
                    .await?;
                if let Some(baseline) = baseline {
                    handle.options.insert(CHANGE_ID_OPTION.to_string(), baseline);
                }
                let worker = self.start_worker(&vm_id, disk, &claim, &handle).await?;
                vm.add_helper(HelperKind::PopulatorWorker, &worker);
                vm.disks[index].worker = Some(worker);
                continue;
            }
            if !self.poll_disk(&vm_id, &mut vm.disks[index]).await? {
                continue;
            }
            let disk_id = vm.disks[index].id.clone();
            let next_baseline = self
                .ctx
                .deltas
                .round(&key, round)?
                .into_iter()
                .find(|c| c.disk == disk_id)
                .map(|c| c.change_id.unwrap_or_else(|| snapshot.clone()));
            let worker_key = DiskKey::new(&self.name, &vm_id, &disk_id);
            self.ctx.populators.retire(&self.namespace, &worker_key).await?;
            let disk = &mut vm.disks[index];
            if let Some(baseline) = next_baseline {
                disk.change_id = Some(baseline);
            }
            disk.done = true;
            if let Some(worker) = disk.worker.take() {
                vm.remove_helper(HelperKind::PopulatorWorker, &worker);
            }
        }

        if !vm.disks.iter().all(|d| d.done) {
            return Ok(Outcome::Wait(TRANSFER_POLL));
        }
        let bytes = self.ctx.deltas.delta_bytes(&key, round)?;
        let now = self.now;
        if let Some(precopy) = warm(vm).precopies.last_mut() {
            precopy.end = Some(now);
            precopy.delta_bytes = bytes;
        }
        info!(round, bytes, "precopy round finished");
        Ok(Outcome::Done)
    }

    pub(super) async fn remove_previous_snapshot(
        &self,
        vm: &mut VmStatus,
    ) -> Result<Outcome, PlanError> {
        let previous = vm.warm.as_ref().and_then(|w| w.previous_snapshot.clone());
        if let Some(previous) = previous {
            self.adapter().remove_snapshot(&vm.vm_ref(), &previous).await?;
        }
        Ok(Outcome::Done)
    }

    pub(super) async fn wait_for_previous_removal(
        &self,
        vm: &mut VmStatus,
    ) -> Result<Outcome, PlanError> {
        let Some(previous) = vm.warm.as_ref().and_then(|w| w.previous_snapshot.clone()) else {
            return Ok(Outcome::Done);
        };
        match self.adapter().snapshot_state(&vm.vm_ref(), &previous).await? {
            SnapshotState::Gone => {
                vm.remove_helper(HelperKind::Snapshot, &previous);
                warm(vm).previous_snapshot = None;
                Ok(Outcome::Done)
            }
            SnapshotState::Failed(message) => Err(PlanError::transient(
                Reason::SnapshotFailed,
                format!("Removing snapshot '{previous}' failed: {message}"),
            )),
            _ => Ok(Outcome::Wait(SNAPSHOT_POLL)),
        }
    }

    /// Hold between rounds until the next precopy is due or cutover arrives
    pub(super) async fn copying_paused(
        &self,
        vm: &mut VmStatus,
        tick: &mut Tick,
    ) -> Result<Outcome, PlanError> {
        if cutover_reached(tick.cutover, self.now) {
            info!("cutover reached");
            self.publish(
                EventType::Normal,
                reasons::CUTOVER,
                actions::MIGRATE,
                format!("Cutover of VM '{}' started.", vm.name),
            )
            .await;
            return Ok(Outcome::Done);
        }
        let due = warm(vm).next_precopy_at.unwrap_or(self.now);
        if due <= self.now {
            if tick.slots > 0 {
                tick.slots -= 1;
                return Ok(Outcome::Jump(Phase::CreateSnapshot));
            }
            return Ok(Outcome::Wait(Duration::from_secs(30)));
        }
        let mut wait = until(self.now, due);
        if let Some(cutover) = tick.cutover {
            wait = wait.min(until(self.now, cutover));
        }
        Ok(Outcome::Wait(wait.max(Duration::from_secs(1))))
    }

    pub(super) fn add_final_checkpoint(&self, vm: &mut VmStatus) -> Result<Outcome, PlanError> {
        let state = warm(vm);
        state.final_baseline = state.current_snapshot.clone();
        Ok(Outcome::Done)
    }

    /// Remove the last snapshots before the guest is converted or started
    pub(super) async fn remove_final_snapshot(
        &self,
        vm: &mut VmStatus,
    ) -> Result<Outcome, PlanError> {
        let reference = vm.vm_ref();
        let snapshots: Vec<String> = vm
            .warm
            .as_ref()
            .map(|w| {
                w.current_snapshot
                    .iter()
                    .chain(w.previous_snapshot.iter())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let mut pending = false;
        for snapshot in snapshots {
            match self.adapter().snapshot_state(&reference, &snapshot).await? {
                SnapshotState::Gone => {
                    vm.remove_helper(HelperKind::Snapshot, &snapshot);
                    let state = warm(vm);
                    if state.current_snapshot.as_deref() == Some(snapshot.as_str()) {
                        state.current_snapshot = None;
                    }
                    if state.previous_snapshot.as_deref() == Some(snapshot.as_str()) {
                        state.previous_snapshot = None;
                    }
                }
                SnapshotState::Removing => pending = true,
                _ => {
                    self.adapter().remove_snapshot(&reference, &snapshot).await?;
                    pending = true;
                }
            }
        }
        if pending {
            Ok(Outcome::Wait(SNAPSHOT_POLL))
        } else {
            Ok(Outcome::Done)
        }
    }
}

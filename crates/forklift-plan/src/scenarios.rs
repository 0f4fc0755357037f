//! End-to-end controller scenarios over the in-memory fakes
//!
//! Each scenario drives `reconcile_at` with an explicit clock and checks
//! what a user would see on the Migration and Plan and in the cluster.

use forklift_adapter::Capabilities;
use forklift_common::conditions::{ARCHIVED, CANCELED, FAILED, SUCCEEDED};
use forklift_common::crd::{
    find_condition, is_condition_true, ConditionStatus, HelperKind, HookRef, HookStep, ObjectRef,
    PowerState, StepPhase,
};
use forklift_common::events::reasons;
use forklift_common::PLAN_FINALIZER;
use forklift_itinerary::Phase;
use forklift_populator::WorkerPhase;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::conversion::conversion_pod_name;
use crate::hook::hook_name;
use crate::target::{JobState, ObjectKind, PodState, TargetObject};
use crate::testing::{at, fixture, fixture_with, t0, NS};

/// Story: a cold migration of one powered-on VM copies its disk, converts
/// the guest, creates a running target VM and leaves no helpers behind
#[tokio::test]
async fn story_cold_migration_runs_every_step() {
    let fx = fixture();
    fx.migrate("m1", t0(), None);
    fx.settle(t0()).await;

    let vm = fx.vm("m1", "vm-1");
    assert_eq!(vm.phase, Phase::Completed);
    assert!(vm.succeeded());
    let steps: Vec<Phase> = vm.pipeline.iter().map(|s| s.name).collect();
    assert_eq!(
        steps,
        vec![
            Phase::Started,
            Phase::PreflightInspection,
            Phase::StorePowerState,
            Phase::PowerOffSource,
            Phase::WaitForPowerOff,
            Phase::CreateDataVolumes,
            Phase::CopyDisks,
            Phase::CreateGuestConversionPod,
            Phase::ConvertGuest,
            Phase::CreateVM,
            Phase::Completed,
        ]
    );
    assert!(vm.pipeline.iter().all(|s| s.phase == StepPhase::Completed));
    assert_eq!(vm.progress.completed, vm.progress.total);
    assert_eq!(vm.disks[0].percent, 100);
    assert_eq!(vm.restore_power_state, PowerState::On);
    assert_eq!(fx.source.power("vm-1"), PowerState::Off);

    assert_eq!(fx.target.live(ObjectKind::VirtualMachine), vec!["web".to_string()]);
    assert_eq!(fx.target.live(ObjectKind::DataVolume), vec!["web-disk-0".to_string()]);
    match fx.target.object(ObjectKind::VirtualMachine, "web") {
        Some(TargetObject::VirtualMachine(obj)) => {
            assert_eq!(obj.data["spec"]["running"], true);
        }
        other => panic!("expected the target VM, got {other:?}"),
    }
    assert!(fx.target.live(ObjectKind::Pod).is_empty());
    assert!(fx.target.live(ObjectKind::Secret).is_empty());
    assert_eq!(fx.runtime.creates(), 1);
    assert!(fx.runtime.names().is_empty());

    let migration = fx.migration_status("m1");
    assert_eq!(migration.completed, Some(t0()));
    assert!(is_condition_true(&migration.conditions, SUCCEEDED));
    let plan = fx.plan().status.unwrap();
    assert!(is_condition_true(&plan.conditions, SUCCEEDED));
    assert_eq!(plan.progress.completed, plan.progress.total);

    let events = fx.events.reasons();
    assert!(events.contains(&reasons::MIGRATION_STARTED.to_string()));
    assert!(events.contains(&reasons::VM_SUCCEEDED.to_string()));
    assert!(events.contains(&reasons::MIGRATION_COMPLETED.to_string()));
}

/// Story: two warm VMs precopy while their sources keep running, share a
/// single transfer slot, and only power off at the default cutover an hour
/// after the start
#[tokio::test]
async fn story_warm_migration_waits_for_cutover() {
    let fx = fixture();
    fx.select_vms(&["vm-1", "vm-2"]);
    fx.edit_plan(|p| p.spec.warm = true);
    fx.migrate("m1", t0(), None);
    fx.settle(t0()).await;

    for id in ["vm-1", "vm-2"] {
        let vm = fx.vm("m1", id);
        assert_eq!(vm.phase, Phase::CopyingPaused, "{id}");
        let warm = vm.warm.unwrap();
        assert_eq!(warm.precopies.len(), 2, "{id}");
        assert!(warm.precopies.iter().all(|p| p.end.is_some()));
        assert_eq!(warm.precopies[1].delta_bytes, 4096);
        assert_eq!(fx.source.power(id), PowerState::On);
    }
    let first = fx.vm("m1", "vm-1");
    assert_eq!(
        first.disks[0].change_id.as_deref(),
        Some("snapshot-2/change")
    );
    assert_eq!(fx.source.live_snapshots().len(), 2);

    fx.settle(at(59)).await;
    assert_eq!(fx.vm("m1", "vm-1").phase, Phase::CopyingPaused);
    assert_eq!(fx.source.power("vm-1"), PowerState::On);

    fx.settle(at(60)).await;
    for id in ["vm-1", "vm-2"] {
        let vm = fx.vm("m1", id);
        assert_eq!(vm.phase, Phase::Completed, "{id}");
        assert_eq!(vm.warm.as_ref().map(|w| w.precopies.len()), Some(3), "{id}");
        assert_eq!(fx.source.power(id), PowerState::Off);
        assert!(vm.helpers_of(HelperKind::Snapshot).next().is_none());
    }
    assert!(fx.source.live_snapshots().is_empty());
    assert_eq!(fx.source.snapshots_taken(), 6);
    assert!(fx.events.reasons().contains(&reasons::CUTOVER.to_string()));
    assert!(is_condition_true(
        &fx.plan().status.unwrap().conditions,
        SUCCEEDED
    ));
}

/// Story: canceling one of three VMs mid-copy removes its volumes and
/// workers, powers its source back on, and leaves its peers running
#[tokio::test]
async fn story_cancel_is_isolated_to_one_vm() {
    let fx = fixture_with(|s| s.max_vm_inflight = 2);
    fx.select_vms(&["vm-1", "vm-2", "vm-3"]);
    fx.runtime.start_in(WorkerPhase::Running);
    fx.migrate("m1", t0(), None);
    fx.settle(t0()).await;
    assert_eq!(fx.vm("m1", "vm-1").phase, Phase::CopyDisks);
    assert_eq!(fx.vm("m1", "vm-2").phase, Phase::CopyDisks);
    assert_eq!(fx.vm("m1", "vm-3").phase, Phase::Pending);
    let peer_before = fx.vm("m1", "vm-1");

    fx.cancel("m1", "vm-2");
    fx.settle(at(1)).await;

    let canceled = fx.vm("m1", "vm-2");
    assert_eq!(canceled.phase, Phase::Canceled);
    assert!(is_condition_true(&canceled.conditions, CANCELED));
    assert_eq!(fx.source.power("vm-2"), PowerState::On);
    assert_eq!(fx.source.power_on_calls(), 1);
    assert!(!fx
        .target
        .live(ObjectKind::DataVolume)
        .contains(&"db-disk-0".to_string()));
    assert!(fx.runtime.names().iter().all(|n| !n.contains("vm-2")));

    let peer = fx.vm("m1", "vm-1");
    assert_eq!(peer.phase, peer_before.phase);
    assert_eq!(peer.progress, peer_before.progress);
    assert_eq!(peer.disks, peer_before.disks);
    assert_eq!(fx.vm("m1", "vm-3").phase, Phase::CopyDisks);

    fx.runtime.set_all(WorkerPhase::Succeeded);
    fx.settle(at(2)).await;
    assert_eq!(fx.vm("m1", "vm-1").phase, Phase::Completed);
    assert_eq!(fx.vm("m1", "vm-2").phase, Phase::Canceled);
    assert_eq!(fx.vm("m1", "vm-3").phase, Phase::Completed);
    assert!(fx.migration_status("m1").completed.is_some());
    let plan = fx.plan().status.unwrap();
    assert!(!is_condition_true(&plan.conditions, SUCCEEDED));
    assert!(!is_condition_true(&plan.conditions, FAILED));
    assert!(!is_condition_true(&plan.conditions, CANCELED));
}

/// Story: a conversion pod exiting non-zero fails the VM with
/// ConversionFailed and keeps the copied volumes
#[tokio::test]
async fn story_failed_conversion_fails_the_vm() {
    let fx = fixture();
    fx.target.set_pod(
        &conversion_pod_name("m1", "vm-1"),
        PodState::Failed {
            exit_code: Some(1),
            message: "virt-v2v: error: inspection could not detect the source guest".into(),
        },
    );
    fx.migrate("m1", t0(), None);
    fx.settle(t0()).await;

    let vm = fx.vm("m1", "vm-1");
    assert_eq!(vm.phase, Phase::Failed);
    let error = vm.error.clone().unwrap();
    assert_eq!(error.phase, Phase::ConvertGuest);
    assert_eq!(error.reason, "ConversionFailed");
    let failed = find_condition(&vm.conditions, FAILED).unwrap();
    assert_eq!(failed.reason, "ConversionFailed");
    assert_eq!(
        vm.step(Phase::ConvertGuest).map(|s| s.phase),
        Some(StepPhase::Failed)
    );
    assert!(fx.target.live(ObjectKind::Pod).is_empty());
    assert_eq!(fx.target.live(ObjectKind::DataVolume), vec!["web-disk-0".to_string()]);
    assert!(fx.target.live(ObjectKind::VirtualMachine).is_empty());

    assert!(is_condition_true(&fx.plan().status.unwrap().conditions, FAILED));
    assert!(fx.events.reasons().contains(&reasons::VM_FAILED.to_string()));
}

/// Story: a controller restarted after starting a worker, but before it
/// recorded the worker, adopts it instead of starting a second copy and
/// resumes progress from the byte count already reported
#[tokio::test]
async fn story_restart_adopts_running_worker() {
    let fx = fixture();
    fx.runtime.start_in(WorkerPhase::Running);
    fx.migrate("m1", t0(), None);
    fx.settle(t0()).await;
    assert_eq!(fx.vm("m1", "vm-1").phase, Phase::CopyDisks);
    assert_eq!(fx.runtime.creates(), 1);
    let worker = fx.vm("m1", "vm-1").disks[0].worker.clone().unwrap();

    fx.kube.edit_migration("m1", |m| {
        let vm = &mut m.status.as_mut().unwrap().vms[0];
        vm.disks[0].worker = None;
        vm.disks[0].transferred = 500;
        vm.helpers.retain(|h| h.kind != HelperKind::PopulatorWorker);
    });
    fx.restart();
    fx.settle(at(1)).await;

    assert_eq!(fx.runtime.creates(), 1);
    let vm = fx.vm("m1", "vm-1");
    assert_eq!(vm.phase, Phase::CopyDisks);
    assert_eq!(vm.disks[0].worker.as_deref(), Some(worker.as_str()));
    assert_eq!(vm.disks[0].transferred, 500);
    assert!(vm.helpers_of(HelperKind::PopulatorWorker).any(|h| h.name == worker));
    assert!(fx.events.reasons().contains(&reasons::WORKER_ADOPTED.to_string()));

    fx.runtime.set_all(WorkerPhase::Succeeded);
    fx.settle(at(2)).await;
    assert_eq!(fx.vm("m1", "vm-1").phase, Phase::Completed);
    assert_eq!(fx.runtime.creates(), 1);
}

/// Story: archiving is refused while the migration runs and completes
/// once the running VM is canceled
#[tokio::test]
async fn story_archive_waits_for_the_running_migration() {
    let fx = fixture();
    fx.runtime.start_in(WorkerPhase::Running);
    fx.migrate("m1", t0(), None);
    fx.settle(t0()).await;

    fx.edit_plan(|p| p.spec.archived = true);
    fx.reconcile(at(1)).await;
    let archived = find_condition(&fx.plan().status.unwrap().conditions, ARCHIVED)
        .cloned()
        .unwrap();
    assert_eq!(archived.status, ConditionStatus::False);
    assert_eq!(archived.reason, "CannotArchiveRunning");
    assert_eq!(fx.vm("m1", "vm-1").phase, Phase::CopyDisks);
    assert!(fx.events.reasons().contains(&reasons::ARCHIVE_DEFERRED.to_string()));

    fx.cancel("m1", "vm-1");
    fx.settle(at(2)).await;
    assert_eq!(fx.vm("m1", "vm-1").phase, Phase::Canceled);
    let status = fx.plan().status.unwrap();
    assert!(is_condition_true(&status.conditions, ARCHIVED));
    assert!(status.archive_requested.is_some());
    assert!(fx.target.live(ObjectKind::Secret).is_empty());
    assert!(fx.runtime.names().is_empty());
}

/// Story: deleting a plan mid-copy releases the workers and the source
/// secret before the finalizer is dropped, and keeps the target volumes
/// for troubleshooting
#[tokio::test]
async fn story_deleted_plan_releases_helpers() {
    let fx = fixture();
    fx.runtime.start_in(WorkerPhase::Running);
    fx.migrate("m1", t0(), None);
    fx.settle(t0()).await;
    assert!(fx
        .plan()
        .metadata
        .finalizers
        .unwrap_or_default()
        .contains(&PLAN_FINALIZER.to_string()));

    fx.edit_plan(|p| p.metadata.deletion_timestamp = Some(Time(at(1))));
    fx.reconcile(at(1)).await;

    assert!(!fx
        .plan()
        .metadata
        .finalizers
        .unwrap_or_default()
        .contains(&PLAN_FINALIZER.to_string()));
    assert_eq!(fx.target.live(ObjectKind::DataVolume), vec!["web-disk-0".to_string()]);
    assert!(fx.target.live(ObjectKind::Secret).is_empty());
    assert!(fx.runtime.names().is_empty());
}

/// Story: with deleteVmOnFailMigration a plan deleted mid-copy also
/// removes the unfinished VM's target volumes
#[tokio::test]
async fn story_deleted_plan_removes_unfinished_targets_when_asked() {
    let fx = fixture();
    fx.edit_plan(|p| p.spec.delete_vm_on_fail_migration = true);
    fx.runtime.start_in(WorkerPhase::Running);
    fx.migrate("m1", t0(), None);
    fx.settle(t0()).await;
    assert_eq!(fx.target.live(ObjectKind::DataVolume), vec!["web-disk-0".to_string()]);

    fx.edit_plan(|p| p.metadata.deletion_timestamp = Some(Time(at(1))));
    fx.reconcile(at(1)).await;

    assert!(fx.target.live(ObjectKind::DataVolume).is_empty());
    assert!(fx.target.live(ObjectKind::VirtualMachine).is_empty());
    assert!(fx.runtime.names().is_empty());
}

/// Story: a failed VM keeps its copied volumes through plan deletion
/// unless deleteVmOnFailMigration is set, in which case the failure
/// itself removes them
#[tokio::test]
async fn story_failed_vm_targets_follow_delete_on_fail() {
    let failing = |delete_vm_on_fail_migration: bool| {
        let fx = fixture();
        fx.edit_plan(move |p| p.spec.delete_vm_on_fail_migration = delete_vm_on_fail_migration);
        fx.target.set_pod(
            &conversion_pod_name("m1", "vm-1"),
            PodState::Failed {
                exit_code: Some(1),
                message: "virt-v2v: error: no guest found".into(),
            },
        );
        fx.migrate("m1", t0(), None);
        fx
    };

    let kept = failing(false);
    kept.settle(t0()).await;
    assert_eq!(kept.vm("m1", "vm-1").phase, Phase::Failed);
    assert_eq!(kept.target.live(ObjectKind::DataVolume), vec!["web-disk-0".to_string()]);
    kept.edit_plan(|p| p.metadata.deletion_timestamp = Some(Time(at(1))));
    kept.reconcile(at(1)).await;
    assert_eq!(kept.target.live(ObjectKind::DataVolume), vec!["web-disk-0".to_string()]);
    assert!(kept.target.live(ObjectKind::Secret).is_empty());

    let removed = failing(true);
    removed.settle(t0()).await;
    let vm = removed.vm("m1", "vm-1");
    assert_eq!(vm.phase, Phase::Failed);
    assert!(vm.helpers_of(HelperKind::DataVolume).next().is_none());
    assert!(removed.target.live(ObjectKind::DataVolume).is_empty());
    assert!(removed.target.live(ObjectKind::VirtualMachine).is_empty());
}

/// Story: transient worker failures spread over a long copy never use up
/// the retry budget as long as the copy makes progress in between
#[tokio::test]
async fn story_recovered_attempts_clear_the_retry_count() {
    let fx = fixture();
    fx.runtime.start_in(WorkerPhase::Running);
    fx.migrate("m1", t0(), None);
    fx.settle(t0()).await;

    for round in 1..=5 {
        let failed_at = at(round * 10);
        fx.runtime.set_all(WorkerPhase::Failed);
        fx.reconcile(failed_at).await;
        assert_eq!(fx.vm("m1", "vm-1").retries, 1, "round {round}");

        fx.settle(at(round * 10 + 1)).await;
        let vm = fx.vm("m1", "vm-1");
        assert_eq!(vm.phase, Phase::CopyDisks, "round {round}");
        assert_eq!(vm.retries, 0, "round {round}");
    }
    assert_eq!(fx.runtime.creates(), 6);

    fx.runtime.set_all(WorkerPhase::Succeeded);
    fx.settle(at(60)).await;
    assert_eq!(fx.vm("m1", "vm-1").phase, Phase::Completed);
}

/// Story: a PreHook job runs before the inspection and is removed once
/// the VM migrates; a failing job fails the VM with HookFailed
#[tokio::test]
async fn story_hooks_run_as_jobs() {
    let hook = HookRef {
        step: "PreHook".into(),
        hook: ObjectRef::new("quiesce", NS),
    };

    let fx = fixture();
    let with_hook = hook.clone();
    fx.edit_plan(move |p| p.spec.vms[0].hooks = vec![with_hook]);
    fx.migrate("m1", t0(), None);
    fx.settle(t0()).await;
    let name = hook_name("m1", "vm-1", HookStep::PreHook);
    let vm = fx.vm("m1", "vm-1");
    assert_eq!(vm.phase, Phase::Completed);
    assert_eq!(vm.pipeline[1].name, Phase::PreHook);
    assert_eq!(fx.target.created(ObjectKind::Job), vec![name.clone()]);
    assert_eq!(fx.target.created(ObjectKind::ConfigMap), vec![name.clone()]);
    assert!(fx.target.live(ObjectKind::Job).is_empty());

    let fx = fixture();
    fx.edit_plan(move |p| p.spec.vms[0].hooks = vec![hook]);
    fx.target.set_job(
        &name,
        JobState::Failed {
            failures: 4,
            message: "Job has reached the specified backoff limit".into(),
            deadline: false,
        },
    );
    fx.migrate("m1", t0(), None);
    fx.settle(t0()).await;
    let vm = fx.vm("m1", "vm-1");
    assert_eq!(vm.phase, Phase::Failed);
    assert_eq!(vm.error.unwrap().reason, "HookFailed");
    assert_eq!(fx.source.power("vm-1"), PowerState::On);
}

/// Story: when the converter copies the disks itself, scraped per-disk
/// progress moves the VM into CopyDisksVirtV2V and onto its disks
#[tokio::test]
async fn story_converter_copy_reports_progress() {
    let fx = fixture();
    fx.source.set_capabilities(
        Capabilities::LIST_VMS
            | Capabilities::INSPECT
            | Capabilities::POWER_OFF
            | Capabilities::POWER_ON
            | Capabilities::OPEN_DISK
            | Capabilities::REQUIRES_CONVERSION
            | Capabilities::CONVERTER_COPIES_DISKS,
    );
    let pod = conversion_pod_name("m1", "vm-1");
    fx.target.set_pod(&pod, PodState::Running);
    fx.target
        .set_metrics(&pod, "v2v_disk_transfers{disk_id=\"1\"} 42\n");
    fx.migrate("m1", t0(), None);
    fx.settle(t0()).await;

    let vm = fx.vm("m1", "vm-1");
    assert_eq!(vm.phase, Phase::CopyDisksVirtV2V);
    assert!(vm.step(Phase::CopyDisks).is_none());
    assert_eq!(vm.disks[0].percent, 42);
    assert_eq!(fx.runtime.creates(), 0);

    fx.target.set_pod(&pod, PodState::Succeeded);
    fx.settle(at(1)).await;
    let vm = fx.vm("m1", "vm-1");
    assert_eq!(vm.phase, Phase::Completed);
    assert_eq!(vm.disks[0].percent, 100);
}

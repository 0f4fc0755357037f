//! Migration start
//!
//! Starting freezes the plan's mappings into the Migration status so later
//! map edits cannot change a running migration, copies the source
//! credentials next to the workers that need them, and lists the VMs.

use chrono::{DateTime, Utc};
use forklift_common::crd::{
    DiskStatus, MappingSnapshot, Migration, MigrationStatus, Plan, VmStatus,
};
use forklift_common::events::{actions, reasons};
use forklift_common::VM_LABEL;
use forklift_itinerary::Mode;
use forklift_populator::dns_name;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::info;

use super::later;
use crate::controller::Context;
use crate::error::PlanError;
use crate::kubevirt::owner_labels;
use crate::target::TargetObject;
use crate::validation::Resolved;

/// Name of the source credentials copied into the target namespace
pub fn source_secret_name(migration: &str) -> String {
    dns_name(&format!("{migration}-source"))
}

/// Start a Migration that has no status yet
pub async fn start(
    plan: &Plan,
    migration: &Migration,
    resolved: &Resolved,
    ctx: &Context,
    status: &mut MigrationStatus,
    now: DateTime<Utc>,
) -> Result<(), PlanError> {
    let name = migration.name_any();
    let mode = plan.spec.mode();
    let snapshot = MappingSnapshot {
        mode,
        source_type: resolved.source.spec.type_,
        network: resolved.network.spec.map.clone(),
        storage: resolved.storage.spec.map.clone(),
        target_namespace: plan.spec.target_namespace.clone(),
        transfer_network: plan.spec.transfer_network.clone(),
    };

    let mut labels = owner_labels(&plan.name_any(), &name, "");
    labels.remove(VM_LABEL);
    let copy = Secret {
        metadata: ObjectMeta {
            name: Some(source_secret_name(&name)),
            namespace: Some(snapshot.target_namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        data: resolved.secret.as_ref().and_then(|s| s.data.clone()),
        type_: resolved.secret.as_ref().and_then(|s| s.type_.clone()),
        ..Default::default()
    };
    ctx.target.create(&TargetObject::Secret(copy)).await?;

    status.vms = resolved
        .vms
        .iter()
        .map(|resolved_vm| {
            let mut vm = VmStatus::new(&resolved_vm.vm.id, &resolved_vm.vm.name);
            vm.target_name = resolved_vm
                .plan
                .target_name
                .clone()
                .unwrap_or_else(|| dns_name(&resolved_vm.vm.name));
            vm.disks = resolved_vm
                .vm
                .disks
                .iter()
                .map(|d| DiskStatus {
                    id: d.id.clone(),
                    capacity: d.capacity,
                    storage: d.storage.clone(),
                    total: d.capacity,
                    ..Default::default()
                })
                .collect();
            vm
        })
        .collect();
    status.started = Some(now);
    status.completed = None;
    if mode == Mode::Warm {
        status.cutover = migration
            .spec
            .cutover
            .or_else(|| Some(later(now, ctx.settings.cutover_default_delay)));
    }
    status.snapshot = Some(snapshot);

    info!(migration = %name, vms = status.vms.len(), %mode, "migration started");
    ctx.events
        .publish(
            &migration.object_ref(&()),
            EventType::Normal,
            reasons::MIGRATION_STARTED,
            actions::MIGRATE,
            Some(format!(
                "Started {mode} migration of {} VM(s).",
                status.vms.len()
            )),
        )
        .await;
    Ok(())
}

//! Plan archival
//!
//! Archiving releases every helper the plan's migrations left behind while
//! keeping migrated VMs and their disks. It is refused while a migration
//! runs. Helpers that cannot be removed within the archive wait are
//! reported on the `Archived` condition instead of blocking forever.

use std::time::Duration;

use chrono::{DateTime, Utc};
use forklift_common::conditions::{ARCHIVED, REASON_ARCHIVE_TIMEOUT, REASON_COMPLETED};
use forklift_common::crd::{
    find_condition, is_condition_true, set_condition, Category, Condition, ConditionStatus,
    Migration, Plan, PlanStatus,
};
use forklift_common::events::{actions, reasons};
use forklift_common::Reason;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use crate::cleanup::Cleaner;
use crate::controller::{source_adapter, Context};
use crate::error::PlanError;

/// Requeue while a refused archive waits for the migration
const DEFERRED_REQUEUE: Duration = Duration::from_secs(30);
/// Requeue while leftovers are being removed
const PENDING_REQUEUE: Duration = Duration::from_secs(10);

/// Drive archival of a plan; returns the requeue hint
pub async fn archive(
    plan: &Plan,
    ctx: &Context,
    migrations: &[Migration],
    status: &mut PlanStatus,
    now: DateTime<Utc>,
) -> Result<Option<Duration>, PlanError> {
    if is_condition_true(&status.conditions, ARCHIVED) {
        return Ok(None);
    }
    let reference = plan.object_ref(&());

    if let Some(running) = migrations.iter().find(|m| m.is_running()) {
        let already_deferred = find_condition(&status.conditions, ARCHIVED)
            .is_some_and(|c| c.reason == Reason::CannotArchiveRunning.as_str());
        set_condition(
            &mut status.conditions,
            Condition::new(
                ARCHIVED,
                ConditionStatus::False,
                Category::Warn,
                Reason::CannotArchiveRunning.as_str(),
                format!(
                    "The plan cannot be archived while migration '{}' is running.",
                    running.name_any()
                ),
            )
            .at(now),
        );
        if !already_deferred {
            warn!(migration = %running.name_any(), "archive deferred while migration runs");
            ctx.events
                .publish(
                    &reference,
                    EventType::Warning,
                    reasons::ARCHIVE_DEFERRED,
                    actions::ARCHIVE,
                    Some("Cancel the running migration to archive the plan.".into()),
                )
                .await;
        }
        return Ok(Some(DEFERRED_REQUEUE));
    }

    let requested = *status.archive_requested.get_or_insert(now);
    let adapter = source_adapter(plan, ctx).await;
    let namespace = plan.namespace().unwrap_or_default();
    let mut leftovers = 0usize;
    let mut first_error = None;

    for migration in migrations {
        let Some(before) = migration.status.as_ref() else {
            continue;
        };
        let mut after = before.clone();
        let target_ns = after
            .snapshot
            .as_ref()
            .map(|s| s.target_namespace.clone())
            .unwrap_or_else(|| plan.spec.target_namespace.clone());
        let name = migration.name_any();
        let cleaner = Cleaner::new(ctx, &target_ns, &name, adapter.clone());
        for vm in after.vms.iter_mut() {
            if let Err(e) = cleaner.cleanup(vm, false).await {
                leftovers += vm.helpers.len();
                first_error.get_or_insert(e.to_string());
            }
        }
        if let Err(e) = cleaner.release().await {
            first_error.get_or_insert(e.to_string());
        }
        if after != *before {
            ctx.kube
                .patch_migration_status(&name, &namespace, &after)
                .await?;
        }
    }

    let elapsed = (now - requested).to_std().unwrap_or_default();
    let condition = match first_error {
        None => Condition::truthy(
            ARCHIVED,
            Category::Advisory,
            REASON_COMPLETED,
            "The plan has been archived.",
        ),
        Some(error) if elapsed >= ctx.settings.archive_wait => Condition::truthy(
            ARCHIVED,
            Category::Warn,
            REASON_ARCHIVE_TIMEOUT,
            format!("The plan was archived with {leftovers} helper(s) left behind: {error}"),
        ),
        Some(error) => {
            info!(leftovers, %error, "archive waiting on helper removal");
            return Ok(Some(PENDING_REQUEUE));
        }
    };
    let message = condition.message.clone();
    set_condition(&mut status.conditions, condition.at(now));
    info!(leftovers, "plan archived");
    ctx.events
        .publish(
            &reference,
            EventType::Normal,
            reasons::ARCHIVED,
            actions::ARCHIVE,
            Some(message),
        )
        .await;
    Ok(None)
}

//! Plan controller implementation
//!
//! Each reconcile validates the plan, drives the active Migration one tick
//! forward, and folds the per-VM state back into the Plan status. All
//! durable state lives in the two status subresources; a restarted
//! controller resumes from them and adopts workers it already started.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use forklift_common::conditions::READY;
use forklift_common::crd::{
    find_condition, has_blocker, Condition, ConditionStatus, Migration, MigrationStatus, Plan,
    PlanStatus,
};
use forklift_common::events::{
    actions, reasons, EventPublisher, KubeEventPublisher, NoopEventPublisher,
};
use forklift_common::metrics::ReconcileTimer;
use forklift_common::retry::ErrorBackoff;
use forklift_common::settings::Settings;
use forklift_common::PLAN_FINALIZER;
use forklift_inventory::Inventory;
use forklift_populator::{Coordinator, KubeWorkerRuntime};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::archive;
use crate::cleanup::Cleaner;
use crate::client::{KubeClient, KubeClientImpl};
use crate::deltas::DeltaStore;
use crate::error::PlanError;
use crate::executor;
use crate::source::{AdapterFactory, SourceFactory};
use crate::status;
use crate::target::{KubeTargetCluster, TargetCluster};
use crate::validation::{self, Validation};

/// Requeue for a plan with nothing in flight
const IDLE_REQUEUE: Duration = Duration::from_secs(300);
/// Requeue for a blocked plan; referenced objects are not all watched
const BLOCKED_REQUEUE: Duration = Duration::from_secs(60);

/// Controller context for Plan reconciliation
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Source inventory
    pub inventory: Arc<dyn Inventory>,
    /// Adapters for source providers
    pub sources: Arc<dyn SourceFactory>,
    /// Destination cluster objects
    pub target: Arc<dyn TargetCluster>,
    /// Disk populators
    pub populators: Arc<Coordinator>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Tunables
    pub settings: Arc<Settings>,
    /// Consecutive failures per plan
    pub backoff: ErrorBackoff,
    /// Changed-block lists of warm rounds
    pub deltas: DeltaStore,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Client,
        inventory: Arc<dyn Inventory>,
        settings: Arc<Settings>,
    ) -> ContextBuilder {
        ContextBuilder {
            client,
            inventory,
            settings,
            kube: None,
            sources: None,
            target: None,
            populators: None,
            events: None,
        }
    }

    /// Create a context for testing with fake collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        inventory: Arc<dyn Inventory>,
        sources: Arc<dyn SourceFactory>,
        target: Arc<dyn TargetCluster>,
        populators: Arc<Coordinator>,
        settings: Settings,
    ) -> Self {
        Self {
            deltas: DeltaStore::new(settings.working_dir.clone()),
            kube,
            inventory,
            sources,
            target,
            populators,
            events: Arc::new(NoopEventPublisher),
            settings: Arc::new(settings),
            backoff: ErrorBackoff::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    inventory: Arc<dyn Inventory>,
    settings: Arc<Settings>,
    kube: Option<Arc<dyn KubeClient>>,
    sources: Option<Arc<dyn SourceFactory>>,
    target: Option<Arc<dyn TargetCluster>>,
    populators: Option<Arc<Coordinator>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the destination cluster access
    pub fn target(mut self, target: Arc<dyn TargetCluster>) -> Self {
        self.target = Some(target);
        self
    }

    /// Override the adapter factory
    pub fn sources(mut self, sources: Arc<dyn SourceFactory>) -> Self {
        self.sources = Some(sources);
        self
    }

    /// Override the populator coordinator
    pub fn populators(mut self, populators: Arc<Coordinator>) -> Self {
        self.populators = Some(populators);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Drop events instead of recording them
    pub fn without_events(self) -> Self {
        self.events(Arc::new(NoopEventPublisher))
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let settings = self.settings;
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            sources: self.sources.unwrap_or_else(|| {
                Arc::new(AdapterFactory::new(
                    self.inventory.clone(),
                    settings.adapter_call_timeout,
                ))
            }),
            target: self
                .target
                .unwrap_or_else(|| Arc::new(KubeTargetCluster::new(self.client.clone()))),
            populators: self.populators.unwrap_or_else(|| {
                Arc::new(Coordinator::new(
                    Arc::new(KubeWorkerRuntime::new(self.client.clone())),
                    settings.importer_retry,
                ))
            }),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), "forklift-plan"))
            }),
            deltas: DeltaStore::new(settings.working_dir.clone()),
            inventory: self.inventory,
            settings,
            backoff: ErrorBackoff::default(),
        }
    }
}

pub(crate) fn key_of(plan: &Plan) -> String {
    format!("{}/{}", plan.namespace().unwrap_or_default(), plan.name_any())
}

/// Reconcile a Plan resource
#[instrument(skip(plan, ctx), fields(plan = %plan.name_any()))]
pub async fn reconcile(plan: Arc<Plan>, ctx: Arc<Context>) -> Result<Action, PlanError> {
    reconcile_at(&plan, &ctx, Utc::now()).await
}

/// Reconcile against an explicit clock
pub async fn reconcile_at(
    plan: &Plan,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Action, PlanError> {
    let timer = ReconcileTimer::start(key_of(plan));
    match reconcile_inner(plan, ctx, now).await {
        Ok(action) => {
            timer.success();
            ctx.backoff.succeeded(&key_of(plan));
            Ok(action)
        }
        Err(e) => {
            timer.error(e.kind());
            Err(e)
        }
    }
}

async fn reconcile_inner(
    plan: &Plan,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Action, PlanError> {
    let name = plan.name_any();
    let namespace = plan.namespace().unwrap_or_default();

    if plan.metadata.deletion_timestamp.is_some() {
        return finalize(plan, ctx).await;
    }
    let has_finalizer = plan
        .finalizers()
        .iter()
        .any(|f| f == PLAN_FINALIZER);
    if !has_finalizer {
        debug!("adding cleanup finalizer");
        ctx.kube.add_finalizer(&name, &namespace).await?;
    }

    let mut migrations = ctx.kube.list_migrations(&name, &namespace).await?;
    migrations.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .cmp(&b.metadata.creation_timestamp.as_ref().map(|t| t.0))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });

    let current = plan.status.clone().unwrap_or_default();
    let mut next = current.clone();
    next.observed_generation = plan.metadata.generation;

    let validation = validation::validate(plan, ctx, &migrations).await?;
    validation::apply(&mut next.conditions, &validation.conditions, now);
    publish_validation(plan, ctx, &current, &validation).await;

    let mut requeue = None;
    if plan.spec.archived {
        let hint = archive::archive(plan, ctx, &migrations, &mut next, now).await?;
        if !migrations.iter().any(Migration::is_running) {
            let last = migrations.last();
            status::fold_plan(&mut next, last.and_then(|m| m.status.as_ref().map(|s| (m, s))), now);
            patch_plan(ctx, plan, &current, &next).await?;
            return Ok(Action::requeue(hint.unwrap_or(IDLE_REQUEUE)));
        }
        // The running migration keeps executing so it can be canceled.
        requeue = hint;
    }

    let active = migrations.iter().find(|m| !m.is_completed());
    match (active, validation.resolved.as_ref()) {
        (Some(migration), Some(resolved)) => {
            let before = migration.status.clone().unwrap_or_default();
            let mut after = before.clone();
            if after.started.is_none() {
                executor::start(plan, migration, resolved, ctx, &mut after, now).await?;
                next.started_mode = Some(plan.spec.mode());
            }
            let hint = executor::execute(plan, migration, resolved, ctx, &mut after, now).await?;
            requeue = min_hint(requeue, hint);
            status::roll_up(&mut after, now);
            after.observed_generation = migration.metadata.generation;
            if after != before {
                ctx.kube
                    .patch_migration_status(&migration.name_any(), &namespace, &after)
                    .await?;
            }
            if before.completed.is_none() && after.completed.is_some() {
                let target_ns = after
                    .snapshot
                    .as_ref()
                    .map_or(plan.spec.target_namespace.as_str(), |s| {
                        s.target_namespace.as_str()
                    });
                let migration_name = migration.name_any();
                let cleaner = Cleaner::new(
                    ctx,
                    target_ns,
                    &migration_name,
                    Some(resolved.adapter.clone()),
                );
                if let Err(e) = cleaner.release().await {
                    warn!(error = %e, "could not release migration helpers");
                }
                publish_completed(migration, ctx, &after).await;
            }
            status::fold_plan(&mut next, Some((migration, &after)), now);
        }
        (Some(migration), None) => {
            debug!(migration = %migration.name_any(), "plan is not ready; migration waits");
            status::fold_plan(&mut next, migration.status.as_ref().map(|s| (migration, s)), now);
        }
        (None, _) => {
            let last = migrations.last();
            status::fold_plan(
                &mut next,
                last.and_then(|m| m.status.as_ref().map(|s| (m, s))),
                now,
            );
        }
    }

    patch_plan(ctx, plan, &current, &next).await?;

    let fallback = if validation.is_ready() {
        IDLE_REQUEUE
    } else {
        BLOCKED_REQUEUE
    };
    Ok(Action::requeue(requeue.map_or(fallback, |r| r.min(fallback))))
}

fn min_hint(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn patch_plan(
    ctx: &Context,
    plan: &Plan,
    current: &PlanStatus,
    next: &PlanStatus,
) -> Result<(), PlanError> {
    if plan.status.is_some() && status::same_plan_status(current, next) {
        return Ok(());
    }
    ctx.kube
        .patch_plan_status(&plan.name_any(), &plan.namespace().unwrap_or_default(), next)
        .await
}

async fn publish_validation(
    plan: &Plan,
    ctx: &Context,
    current: &PlanStatus,
    validation: &Validation,
) {
    let was_ready = find_condition(&current.conditions, READY)
        .is_some_and(|c| c.status == ConditionStatus::True);
    let reference = plan.object_ref(&());
    if validation.is_ready() && !was_ready {
        info!("plan is ready");
        ctx.events
            .publish(
                &reference,
                EventType::Normal,
                reasons::PLAN_READY,
                actions::VALIDATE,
                Some("The migration plan is ready.".into()),
            )
            .await;
        return;
    }
    let new_blockers: Vec<&Condition> = validation
        .conditions
        .iter()
        .filter(|c| c.category.is_blocker() && c.status == ConditionStatus::True)
        .filter(|c| {
            !current
                .conditions
                .iter()
                .any(|old| old.type_ == c.type_ && old.status == c.status)
        })
        .collect();
    if !new_blockers.is_empty() && has_blocker(&validation.conditions) {
        let message = new_blockers
            .iter()
            .map(|c| c.message.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        warn!(blockers = new_blockers.len(), %message, "plan failed validation");
        ctx.events
            .publish(
                &reference,
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::VALIDATE,
                Some(message),
            )
            .await;
    }
}

async fn publish_completed(migration: &Migration, ctx: &Context, status: &MigrationStatus) {
    let failed = status.vms.iter().filter(|v| v.phase.is_terminal() && !v.succeeded()).count();
    info!(migration = %migration.name_any(), vms = status.vms.len(), failed, "migration completed");
    ctx.events
        .publish(
            &migration.object_ref(&()),
            EventType::Normal,
            reasons::MIGRATION_COMPLETED,
            actions::MIGRATE,
            Some(format!(
                "{} of {} VMs succeeded.",
                status.vms.iter().filter(|v| v.succeeded()).count(),
                status.vms.len()
            )),
        )
        .await;
}

/// Release everything the plan created before the Plan goes away
///
/// Migrated VMs and their disks stay. Helpers of unfinished VMs are
/// removed; their target objects go only with `deleteVmOnFailMigration`.
async fn finalize(plan: &Plan, ctx: &Context) -> Result<Action, PlanError> {
    let name = plan.name_any();
    let namespace = plan.namespace().unwrap_or_default();
    info!("plan deleted; releasing migration resources");
    let migrations = ctx.kube.list_migrations(&name, &namespace).await?;
    let adapter = source_adapter(plan, ctx).await;
    for migration in &migrations {
        let Some(mut status) = migration.status.clone() else {
            continue;
        };
        let target_ns = status
            .snapshot
            .as_ref()
            .map(|s| s.target_namespace.clone())
            .unwrap_or_else(|| plan.spec.target_namespace.clone());
        let migration_name = migration.name_any();
        let cleaner = Cleaner::new(ctx, &target_ns, &migration_name, adapter.clone());
        for vm in status.vms.iter_mut() {
            let delete_target = !vm.succeeded() && plan.spec.delete_vm_on_fail_migration;
            cleaner.cleanup(vm, delete_target).await?;
        }
        cleaner.release().await?;
    }
    ctx.kube.remove_finalizer(&name, &namespace).await?;
    Ok(Action::await_change())
}

/// Adapter for cleanup paths that run without a validated plan
///
/// Cleanup of source snapshots is skipped when the provider is gone.
pub(crate) async fn source_adapter(
    plan: &Plan,
    ctx: &Context,
) -> Option<Arc<dyn forklift_adapter::SourceAdapter>> {
    let namespace = plan.namespace().unwrap_or_default();
    let source = &plan.spec.provider.source;
    let provider = ctx
        .kube
        .get_provider(&source.name, source.namespace_or(&namespace))
        .await
        .ok()
        .flatten()?;
    let secret = match &provider.spec.secret {
        Some(r) => ctx
            .kube
            .get_secret(&r.name, r.namespace_or(&namespace))
            .await
            .ok()
            .flatten(),
        None => None,
    };
    match ctx.sources.source(&provider, secret).await {
        Ok(adapter) => Some(adapter),
        Err(e) => {
            warn!(error = %e, "source adapter unavailable; snapshots are left in place");
            None
        }
    }
}

/// Error policy for the controller
///
/// Requeues with a delay that doubles per consecutive failure.
pub fn error_policy(plan: Arc<Plan>, error: &PlanError, ctx: Arc<Context>) -> Action {
    let delay = ctx.backoff.failed(&key_of(&plan));
    warn!(
        %error,
        plan = %plan.name_any(),
        retryable = error.is_retryable(),
        delay_secs = delay.as_secs(),
        "plan reconciliation failed"
    );
    Action::requeue(delay)
}

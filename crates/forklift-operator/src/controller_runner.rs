//! Controller runner - builds the controller futures the operator runs
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. This keeps controller construction pure and testable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};

use forklift_common::crd::{Migration, Plan, Provider};
use forklift_common::settings::Settings;
use forklift_inventory::Inventory;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the Provider controller
pub fn build_provider_controllers(
    client: Client,
    inventory: Arc<dyn Inventory>,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(forklift_provider::Context::builder(client.clone(), inventory).build());
    let providers: Api<Provider> = Api::all(client);

    tracing::info!("- Provider controller");

    vec![Box::pin(
        Controller::new(providers, watcher())
            .shutdown_on_signal()
            .run(forklift_provider::reconcile, forklift_provider::error_policy, ctx)
            .for_each(log_reconcile_result("Provider")),
    )]
}

/// Build the Plan controller; Migration changes requeue the Plan they run
pub fn build_plan_controllers(
    client: Client,
    inventory: Arc<dyn Inventory>,
    settings: Arc<Settings>,
) -> Vec<ControllerFuture> {
    let ctx =
        Arc::new(forklift_plan::Context::builder(client.clone(), inventory, settings).build());
    let plans: Api<Plan> = Api::all(client.clone());
    let migrations: Api<Migration> = Api::all(client);

    tracing::info!("- Plan controller");

    vec![Box::pin(
        Controller::new(plans, watcher())
            .watches(migrations, watcher(), |migration| {
                plan_of_migration(&migration)
            })
            .shutdown_on_signal()
            .run(forklift_plan::reconcile, forklift_plan::error_policy, ctx)
            .for_each(log_reconcile_result("Plan")),
    )]
}

/// The Plan a Migration runs
///
/// The plan reference defaults to the Migration's own namespace.
fn plan_of_migration(migration: &Migration) -> Option<ObjectRef<Plan>> {
    let plan = &migration.spec.plan;
    if plan.name.is_empty() {
        return None;
    }
    let own = migration.namespace()?;
    Some(ObjectRef::new(&plan.name).within(plan.namespace_or(&own)))
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

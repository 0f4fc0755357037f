//! Plan validation
//!
//! Every check runs on every reconcile and produces at most one
//! `Validation.<Reason>` condition per reason. A plan with no failing check
//! is `Ready` and carries the inputs the executor needs in [`Resolved`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use forklift_adapter::SourceAdapter;
use forklift_common::conditions::{
    is_validation_type, validation_type, BLOCKED, READY, REASON_VALIDATED,
};
use forklift_common::crd::{
    set_condition, Category, Condition, ConditionStatus, Hook, HookStep, Migration, NetworkMap,
    ObjectRef, Plan, PlanVm, Provider, ProviderType, StorageMap,
};
use forklift_common::Reason;
use forklift_inventory::{ProviderKey, Vm};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::controller::Context;
use crate::error::PlanError;
use crate::hook::decode_playbook;

static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid DNS label regex"));

/// A source VM the plan selected, as found in the inventory
#[derive(Clone, Debug)]
pub struct ResolvedVm {
    /// Plan entry
    pub plan: PlanVm,
    /// Inventory description
    pub vm: Vm,
}

/// Inputs of a plan that passed validation
pub struct Resolved {
    /// Source provider
    pub source: Provider,
    /// Destination provider
    pub destination: Provider,
    /// Source credentials
    pub secret: Option<Secret>,
    /// Adapter for the source
    pub adapter: Arc<dyn SourceAdapter>,
    /// Network mapping
    pub network: NetworkMap,
    /// Storage mapping
    pub storage: StorageMap,
    /// Selected VMs in plan order
    pub vms: Vec<ResolvedVm>,
    /// Referenced hooks keyed by `namespace/name`
    pub hooks: BTreeMap<String, Hook>,
}

impl Resolved {
    /// Resolved VM by source ID
    pub fn vm(&self, id: &str) -> Option<&ResolvedVm> {
        self.vms.iter().find(|v| v.vm.id == id)
    }

    /// Hook behind a plan reference
    pub fn hook(&self, reference: &ObjectRef, plan_namespace: &str) -> Option<&Hook> {
        self.hooks.get(&hook_key(reference, plan_namespace))
    }
}

fn hook_key(reference: &ObjectRef, plan_namespace: &str) -> String {
    format!("{}/{}", reference.namespace_or(plan_namespace), reference.name)
}

/// Outcome of validating a plan
pub struct Validation {
    /// Validation, `Ready` and `Blocked` conditions
    pub conditions: Vec<Condition>,
    /// Present when no check failed
    pub resolved: Option<Resolved>,
}

impl Validation {
    /// Whether the plan may execute
    pub fn is_ready(&self) -> bool {
        self.resolved.is_some()
    }
}

/// Failed checks in the order they were found
#[derive(Default)]
struct Problems(Vec<(Reason, String)>);

impl Problems {
    fn add(&mut self, reason: Reason, message: impl Into<String>) {
        self.0.push((reason, message.into()));
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// One condition per reason, messages joined in discovery order
    fn conditions(&self) -> Vec<Condition> {
        let mut grouped: Vec<(Reason, Vec<&str>)> = Vec::new();
        for (reason, message) in &self.0 {
            match grouped.iter_mut().find(|(r, _)| r == reason) {
                Some((_, messages)) => messages.push(message),
                None => grouped.push((*reason, vec![message])),
            }
        }
        grouped
            .into_iter()
            .map(|(reason, messages)| {
                Condition::truthy(
                    validation_type(reason.as_str()),
                    Category::Error,
                    reason.as_str(),
                    messages.join(" "),
                )
            })
            .collect()
    }
}

async fn provider(
    ctx: &Context,
    reference: &ObjectRef,
    namespace: &str,
    role: &str,
    problems: &mut Problems,
) -> Result<Option<Provider>, PlanError> {
    let ns = reference.namespace_or(namespace);
    match ctx.kube.get_provider(&reference.name, ns).await? {
        Some(p) => Ok(Some(p)),
        None => {
            problems.add(
                Reason::ProviderNotValid,
                format!("The {role} provider '{ns}/{}' was not found.", reference.name),
            );
            Ok(None)
        }
    }
}

/// Run every check against the plan
pub async fn validate(
    plan: &Plan,
    ctx: &Context,
    migrations: &[Migration],
) -> Result<Validation, PlanError> {
    let spec = &plan.spec;
    let namespace = plan.namespace().unwrap_or_default();
    let mut problems = Problems::default();

    if spec.target_namespace.is_empty() {
        problems.add(Reason::NamespaceNotValid, "The target namespace is not set.");
    } else if spec.target_namespace.len() > 63 || !DNS_LABEL.is_match(&spec.target_namespace) {
        problems.add(
            Reason::NamespaceNotValid,
            format!("The target namespace '{}' is not a DNS label.", spec.target_namespace),
        );
    }

    let source = provider(ctx, &spec.provider.source, &namespace, "source", &mut problems).await?;
    let destination = provider(
        ctx,
        &spec.provider.destination,
        &namespace,
        "destination",
        &mut problems,
    )
    .await?;

    if let Some(p) = &source {
        if !p.spec.type_.is_source() {
            problems.add(
                Reason::ProviderNotValid,
                format!("The source provider '{}' cannot be a migration source.", p.name_any()),
            );
        } else if !p.is_ready() {
            problems.add(
                Reason::ProviderNotReady,
                format!("The source provider '{}' is not ready.", p.name_any()),
            );
        }
    }
    if let Some(p) = &destination {
        if p.spec.type_ != ProviderType::OpenShift {
            problems.add(
                Reason::ProviderNotValid,
                format!(
                    "The destination provider '{}' must be of type openshift.",
                    p.name_any()
                ),
            );
        } else if !p.is_ready() {
            problems.add(
                Reason::ProviderNotReady,
                format!("The destination provider '{}' is not ready.", p.name_any()),
            );
        }
    }
    let source = source.filter(|p| p.spec.type_.is_source() && p.is_ready());

    for (i, a) in spec.vms.iter().enumerate() {
        for b in &spec.vms[i + 1..] {
            if a.vm.matches(&b.vm) {
                problems.add(
                    Reason::DuplicateVm,
                    format!("VM '{}' is listed more than once.", a.vm),
                );
            }
        }
    }

    let map_ns = |r: &ObjectRef| r.namespace_or(&namespace).to_string();
    let network = ctx
        .kube
        .get_network_map(&spec.map.network.name, &map_ns(&spec.map.network))
        .await?;
    if network.is_none() {
        problems.add(
            Reason::MapNotFound,
            format!("The network map '{}' was not found.", spec.map.network.name),
        );
    }
    let storage = ctx
        .kube
        .get_storage_map(&spec.map.storage.name, &map_ns(&spec.map.storage))
        .await?;
    if storage.is_none() {
        problems.add(
            Reason::MapNotFound,
            format!("The storage map '{}' was not found.", spec.map.storage.name),
        );
    }

    let mut vms = Vec::new();
    if let Some(p) = &source {
        let uid = p.uid().unwrap_or_default();
        let key = ProviderKey::new(p.spec.type_, uid);
        for entry in &spec.vms {
            match ctx.inventory.vm(&key, &entry.vm).await {
                Ok(vm) => vms.push(ResolvedVm {
                    plan: entry.clone(),
                    vm,
                }),
                Err(e) if e.is_not_found() => problems.add(
                    Reason::VmNotFound,
                    format!("VM '{}' was not found in the inventory.", entry.vm),
                ),
                Err(e) if e.is_retryable() => return Err(e.into()),
                Err(e) => problems.add(Reason::VmNotFound, format!("VM '{}': {e}.", entry.vm)),
            }
        }
    }

    for resolved in &vms {
        let vm = &resolved.vm;
        if let Some(map) = &network {
            for net in vm.referenced_networks() {
                if map.spec.find(&net).is_none() {
                    problems.add(
                        Reason::NetworkNotMapped,
                        format!("VM '{}': network '{net}' is not mapped.", vm.name),
                    );
                }
            }
        }
        if let Some(map) = &storage {
            for ds in vm.referenced_storage() {
                if map.spec.find(&ds).is_none() {
                    problems.add(
                        Reason::StorageNotMapped,
                        format!("VM '{}': storage '{ds}' is not mapped.", vm.name),
                    );
                }
            }
        }
    }

    let mut hooks = BTreeMap::new();
    for entry in &spec.vms {
        for reference in &entry.hooks {
            if reference.step.parse::<HookStep>().is_err() {
                problems.add(
                    Reason::HookStepNotValid,
                    format!("VM '{}': hook step '{}' is not valid.", entry.vm, reference.step),
                );
            }
            let key = hook_key(&reference.hook, &namespace);
            if hooks.contains_key(&key) {
                continue;
            }
            match ctx
                .kube
                .get_hook(&reference.hook.name, reference.hook.namespace_or(&namespace))
                .await?
            {
                Some(hook) => {
                    if let Some(playbook) = hook.spec.playbook.as_deref() {
                        if let Err(e) = decode_playbook(playbook) {
                            problems.add(Reason::HookNotValid, format!("Hook '{key}': {e}."));
                        }
                    }
                    hooks.insert(key, hook);
                }
                None => problems.add(Reason::HookNotFound, format!("Hook '{key}' was not found.")),
            }
        }
    }

    let mut secret = None;
    let mut adapter = None;
    if let Some(p) = &source {
        if let Some(r) = &p.spec.secret {
            let ns = r.namespace_or(p.namespace().as_deref().unwrap_or(&namespace)).to_string();
            secret = ctx.kube.get_secret(&r.name, &ns).await?;
            if secret.is_none() {
                problems.add(
                    Reason::SecretNotFound,
                    format!("The source provider secret '{ns}/{}' was not found.", r.name),
                );
            }
        }
        match ctx.sources.source(p, secret.clone()).await {
            Ok(a) => adapter = Some(a),
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => problems.add(Reason::ProviderNotValid, format!("The source adapter: {e}.")),
        }
    }

    let mode = spec.mode();
    if mode == forklift_itinerary::Mode::Warm {
        if let Some(a) = &adapter {
            if !a.capabilities().supports_warm() {
                problems.add(
                    Reason::WarmNotSupported,
                    format!("Warm migration is not supported by {} sources.", a.provider_type()),
                );
            }
        }
    }

    if let Some(net) = &spec.transfer_network {
        let ns = net.namespace_or(&namespace);
        if !ctx.kube.network_attachment_exists(&net.name, ns).await? {
            problems.add(
                Reason::TransferNetNotValid,
                format!("The transfer network '{ns}/{}' was not found.", net.name),
            );
        }
    }

    let started_mode = plan
        .status
        .as_ref()
        .and_then(|s| s.started_mode)
        .or_else(|| {
            migrations
                .iter()
                .filter_map(|m| m.status.as_ref()?.snapshot.as_ref())
                .map(|s| s.mode)
                .next()
        });
    if let Some(started) = started_mode {
        if started != mode {
            problems.add(
                Reason::ModeImmutable,
                format!("The migration type cannot change from {started} to {mode}."),
            );
        }
    }

    debug!(problems = problems.0.len(), vms = vms.len(), "validated plan");

    let mut conditions = problems.conditions();
    let resolved = match (source, destination, adapter, network, storage) {
        (Some(source), Some(destination), Some(adapter), Some(network), Some(storage))
            if problems.is_empty() =>
        {
            Some(Resolved {
                source,
                destination,
                secret,
                adapter,
                network,
                storage,
                vms,
                hooks,
            })
        }
        _ => None,
    };

    if resolved.is_some() {
        conditions.push(Condition::truthy(
            READY,
            Category::Required,
            REASON_VALIDATED,
            "The migration plan is ready.",
        ));
    } else {
        let (reason, _) = problems
            .0
            .first()
            .cloned()
            .unwrap_or((Reason::Internal, String::new()));
        let count = conditions.len();
        conditions.push(Condition::new(
            READY,
            ConditionStatus::False,
            Category::Required,
            reason.as_str(),
            "The migration plan is not ready.",
        ));
        conditions.push(Condition::truthy(
            BLOCKED,
            Category::Critical,
            reason.as_str(),
            format!("The plan is blocked by {count} validation issue(s)."),
        ));
    }

    Ok(Validation {
        conditions,
        resolved,
    })
}

/// Replace the validation outcome in a condition list
///
/// Validation conditions no longer reported are dropped; conditions whose
/// status did not change keep their transition time.
pub fn apply(conditions: &mut Vec<Condition>, validation: &[Condition], now: DateTime<Utc>) {
    conditions.retain(|c| {
        let owned = is_validation_type(&c.type_) || c.type_ == BLOCKED;
        !owned || validation.iter().any(|v| v.type_ == c.type_)
    });
    for condition in validation {
        set_condition(conditions, condition.clone().at(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, Fixture};
    use forklift_common::crd::{find_condition, is_condition_true, HookRef, Ref};
    use forklift_inventory::InventoryError;
    use rstest::rstest;

    async fn run(fx: &Fixture) -> Validation {
        let plan = fx.plan();
        validate(&plan, &fx.context(), &[]).await.unwrap()
    }

    fn reasons(v: &Validation) -> Vec<String> {
        v.conditions
            .iter()
            .filter(|c| is_validation_type(&c.type_))
            .map(|c| c.reason.clone())
            .collect()
    }

    /// Story: a plan whose providers, VMs, maps and hooks all resolve is Ready
    #[tokio::test]
    async fn story_valid_plan_is_ready() {
        let fx = fixture();
        let v = run(&fx).await;
        assert!(v.is_ready());
        assert!(is_condition_true(&v.conditions, READY));
        assert!(reasons(&v).is_empty());
        let resolved = v.resolved.unwrap();
        assert_eq!(resolved.vms.len(), 1);
        assert_eq!(resolved.vms[0].vm.name, "web");
    }

    #[rstest]
    #[case::unknown_vm("missing", "VMNotFound")]
    #[case::unmapped_network("unmapped-net", "NetworkNotMapped")]
    #[case::unmapped_storage("unmapped-ds", "StorageNotMapped")]
    #[tokio::test]
    async fn failing_vm_checks_carry_their_reason(#[case] vm: &str, #[case] reason: &str) {
        let fx = fixture();
        fx.edit_plan(|p| p.spec.vms[0].vm = Ref::by_id(vm));
        let v = run(&fx).await;
        assert!(!v.is_ready());
        assert_eq!(reasons(&v), vec![reason.to_string()]);
        let ready = find_condition(&v.conditions, READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, reason);
        assert!(is_condition_true(&v.conditions, BLOCKED));
    }

    #[tokio::test]
    async fn duplicate_vms_are_rejected() {
        let fx = fixture();
        fx.edit_plan(|p| {
            let dup = p.spec.vms[0].clone();
            p.spec.vms.push(dup);
        });
        assert!(reasons(&run(&fx).await).contains(&"DuplicateVM".to_string()));
    }

    #[tokio::test]
    async fn hooks_must_exist_and_name_a_valid_step() {
        let fx = fixture();
        fx.edit_plan(|p| {
            p.spec.vms[0].hooks = vec![
                HookRef {
                    step: "Midway".into(),
                    hook: ObjectRef::new("quiesce", "mtv"),
                },
                HookRef {
                    step: "PostHook".into(),
                    hook: ObjectRef::new("absent", "mtv"),
                },
            ];
        });
        let found = reasons(&run(&fx).await);
        assert_eq!(found, vec!["HookStepNotValid".to_string(), "HookNotFound".to_string()]);
    }

    #[tokio::test]
    async fn destination_must_be_the_cluster() {
        let fx = fixture();
        fx.edit_provider("host", |p| p.spec.type_ = ProviderType::Ovirt);
        assert_eq!(reasons(&run(&fx).await), vec!["ProviderNotValid".to_string()]);
    }

    #[tokio::test]
    async fn warm_requires_change_tracking() {
        let fx = fixture();
        fx.source.set_capabilities(forklift_adapter::Capabilities::LIST_VMS);
        fx.edit_plan(|p| p.spec.warm = true);
        assert_eq!(reasons(&run(&fx).await), vec!["WarmNotSupported".to_string()]);
    }

    #[tokio::test]
    async fn missing_transfer_network_is_reported() {
        let fx = fixture();
        fx.edit_plan(|p| p.spec.transfer_network = Some(ObjectRef::new("storage-net", "mtv")));
        assert_eq!(reasons(&run(&fx).await), vec!["TransferNetNotValid".to_string()]);
    }

    #[tokio::test]
    async fn mode_is_immutable_once_started() {
        let fx = fixture();
        fx.edit_plan(|p| {
            p.spec.warm = true;
            p.status.get_or_insert_with(Default::default).started_mode =
                Some(forklift_itinerary::Mode::Cold);
        });
        assert_eq!(reasons(&run(&fx).await), vec!["ModeImmutable".to_string()]);
    }

    #[rstest]
    #[case::empty("", true)]
    #[case::uppercase("Migrated", true)]
    #[case::label("migrated-vms", false)]
    #[tokio::test]
    async fn target_namespace_must_be_a_dns_label(#[case] ns: &str, #[case] rejected: bool) {
        let fx = fixture();
        let ns = ns.to_string();
        fx.edit_plan(move |p| p.spec.target_namespace = ns.clone());
        let found = reasons(&run(&fx).await);
        assert_eq!(found.contains(&"NamespaceNotValid".to_string()), rejected);
    }

    #[tokio::test]
    async fn unreachable_inventory_is_a_reconcile_error() {
        let fx = fixture();
        fx.inventory.fail_with(InventoryError::Transport {
            path: "/providers/vsphere/src-uid/vms".into(),
            message: "connection refused".into(),
        });
        let plan = fx.plan();
        let err = validate(&plan, &fx.context(), &[]).await.err().unwrap();
        assert!(err.is_retryable());
    }

    /// Story: validating an unchanged plan twice yields the same conditions
    #[tokio::test]
    async fn story_validation_is_idempotent() {
        let fx = fixture();
        fx.edit_plan(|p| p.spec.vms[0].vm = Ref::by_id("missing"));
        let now = Utc::now();
        let mut first = Vec::new();
        apply(&mut first, &run(&fx).await.conditions, now);
        let mut second = first.clone();
        apply(&mut second, &run(&fx).await.conditions, now + chrono::Duration::minutes(5));
        assert_eq!(first, second);
    }

    #[test]
    fn resolved_checks_drop_stale_validation_conditions() {
        let now = Utc::now();
        let mut conditions = vec![
            Condition::truthy(validation_type("VMNotFound"), Category::Error, "VMNotFound", "x"),
            Condition::truthy(BLOCKED, Category::Critical, "VMNotFound", "x"),
            Condition::truthy("Executing", Category::Advisory, "Started", "y"),
        ];
        let ready = vec![Condition::truthy(
            READY,
            Category::Required,
            REASON_VALIDATED,
            "ok",
        )];
        apply(&mut conditions, &ready, now);
        let types: Vec<&str> = conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec!["Executing", READY]);
    }
}

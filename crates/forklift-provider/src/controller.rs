//! Provider controller implementation
//!
//! Validates a Provider's settings, credentials secret and endpoint, then
//! asks the inventory whether its collector reached the provider. The
//! outcome is written to `status.phase` and the `Ready` condition, which the
//! plan reconciler consults before it validates a plan.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forklift_common::conditions::{self, validation_type, CONNECTION_TEST_SUCCEEDED, READY};
use forklift_common::crd::{
    same_conditions, set_condition, Category, Condition, ConditionStatus, Provider,
    ProviderPhase, ProviderStatus,
};
use forklift_common::events::{
    actions, reasons, EventPublisher, KubeEventPublisher, NoopEventPublisher,
};
use forklift_common::retry::ErrorBackoff;
use forklift_common::{Error, Reason, FIELD_MANAGER};
use forklift_inventory::{Inventory, InventoryError, ProviderKey};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, instrument, warn};

use crate::credentials::{check_url, merged_settings, missing_credential};
use crate::error::ProviderError;

/// Requeue for a healthy provider
const READY_REQUEUE: Duration = Duration::from_secs(300);
/// Requeue while the inventory is still loading the provider
const STAGING_REQUEUE: Duration = Duration::from_secs(10);
/// Requeue after a failed connection test
const CONNECTION_REQUEUE: Duration = Duration::from_secs(30);
/// Requeue after a validation failure; the secret is not watched
const VALIDATION_REQUEUE: Duration = Duration::from_secs(60);

/// Trait abstracting Kubernetes client operations for Provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Secret by name and namespace
    async fn get_secret(&self, name: &str, namespace: &str)
        -> Result<Option<Secret>, ProviderError>;

    /// Patch the status of a Provider
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ProviderStatus,
    ) -> Result<(), ProviderError>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_secret(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Secret>, ProviderError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ProviderStatus,
    ) -> Result<(), ProviderError> {
        let api: Api<Provider> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Controller context for Provider reconciliation
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Inventory used for the connection test
    pub inventory: Arc<dyn Inventory>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Consecutive failures per provider
    pub backoff: ErrorBackoff,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, inventory: Arc<dyn Inventory>) -> ContextBuilder {
        ContextBuilder {
            client,
            inventory,
            kube: None,
            events: None,
        }
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, inventory: Arc<dyn Inventory>) -> Self {
        Self {
            kube,
            inventory,
            events: Arc::new(NoopEventPublisher),
            backoff: ErrorBackoff::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    inventory: Arc<dyn Inventory>,
    kube: Option<Arc<dyn KubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
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
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), "forklift-provider"))
            }),
            inventory: self.inventory,
            backoff: ErrorBackoff::default(),
        }
    }
}

/// Outcome of the provider checks
#[derive(Clone, Debug, PartialEq)]
struct Assessment {
    phase: ProviderPhase,
    conditions: Vec<Condition>,
}

impl Assessment {
    fn ready(message: &str, tested: bool) -> Self {
        let mut conditions = vec![Condition::truthy(
            READY,
            Category::Required,
            conditions::REASON_COMPLETED,
            message,
        )];
        if tested {
            conditions.push(Condition::truthy(
                CONNECTION_TEST_SUCCEEDED,
                Category::Required,
                conditions::REASON_COMPLETED,
                "Connection test, succeeded.",
            ));
        }
        Self {
            phase: ProviderPhase::Ready,
            conditions,
        }
    }

    fn invalid(reason: Reason, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            phase: ProviderPhase::ValidationFailed,
            conditions: vec![
                not_ready(reason, &message),
                Condition::truthy(
                    validation_type(reason.as_str()),
                    Category::Critical,
                    reason.as_str(),
                    message,
                ),
            ],
        }
    }

    fn unreachable(reason: Reason, phase: ProviderPhase, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            phase,
            conditions: vec![
                not_ready(reason, &message),
                Condition::new(
                    CONNECTION_TEST_SUCCEEDED,
                    ConditionStatus::False,
                    Category::Critical,
                    reason.as_str(),
                    message,
                ),
            ],
        }
    }

    fn requeue(&self) -> Duration {
        match self.phase {
            ProviderPhase::Ready => READY_REQUEUE,
            ProviderPhase::Staging => STAGING_REQUEUE,
            ProviderPhase::ConnectionFailed => CONNECTION_REQUEUE,
            ProviderPhase::ValidationFailed => VALIDATION_REQUEUE,
        }
    }
}

fn not_ready(reason: Reason, message: &str) -> Condition {
    Condition::new(
        READY,
        ConditionStatus::False,
        Category::Required,
        reason.as_str(),
        message,
    )
}

/// Run every check in order, stopping at the first failure
async fn assess(provider: &Provider, ctx: &Context) -> Result<Assessment, ProviderError> {
    if provider.is_host() {
        return Ok(Assessment::ready("The host provider is ready.", false));
    }
    let type_ = provider.spec.type_;
    let namespace = provider.namespace().unwrap_or_default();

    let secret = match &provider.spec.secret {
        Some(r) => {
            let ns = r.namespace_or(&namespace);
            match ctx.kube.get_secret(&r.name, ns).await? {
                Some(secret) => Some(secret),
                None => {
                    return Ok(Assessment::invalid(
                        Reason::SecretNotFound,
                        format!("Secret '{ns}/{}' not found.", r.name),
                    ))
                }
            }
        }
        None if type_ == forklift_common::crd::ProviderType::Ova => None,
        None => {
            return Ok(Assessment::invalid(
                Reason::SecretNotFound,
                "The provider references no credentials secret.",
            ))
        }
    };

    let settings = match merged_settings(provider, secret.as_ref()) {
        Ok(settings) => settings,
        Err(e) => return Ok(Assessment::invalid(e.reason(), e.to_string())),
    };
    let url = settings.url.clone().unwrap_or_default();
    if let Err(message) = check_url(type_, &url) {
        return Ok(Assessment::invalid(Reason::UrlNotValid, message));
    }
    if let Some(key) = missing_credential(type_, &settings) {
        return Ok(Assessment::invalid(
            Reason::ProviderSettingNotValid,
            format!("The credentials secret is missing '{key}'."),
        ));
    }

    let uid = provider.uid().ok_or_else(|| {
        Error::internal_with_context("provider", format!("{} has no uid", provider.name_any()))
    })?;
    let key = ProviderKey::new(type_, uid);
    match ctx.inventory.provider(&key).await {
        Ok(info) if info.is_ready() => Ok(Assessment::ready("The provider is ready.", true)),
        Ok(info) => Ok(Assessment::unreachable(
            Reason::ConnectionTestFailed,
            ProviderPhase::ConnectionFailed,
            format!("Connection test failed: collector status '{}'.", info.status),
        )),
        Err(InventoryError::ProviderNotReady { .. } | InventoryError::NotFound { .. }) => {
            Ok(Assessment::unreachable(
                Reason::ProviderNotReady,
                ProviderPhase::Staging,
                "The inventory is still loading the provider.",
            ))
        }
        Err(e) if e.is_retryable() => Err(e.into()),
        Err(e) => Ok(Assessment::unreachable(
            Reason::ConnectionTestFailed,
            ProviderPhase::ConnectionFailed,
            format!("Connection test failed: {e}."),
        )),
    }
}

/// Fold an assessment into the current status
///
/// Conditions not produced by this assessment are dropped; the ones that
/// are keep their transition time when their status did not change.
fn next_status(
    current: Option<&ProviderStatus>,
    generation: Option<i64>,
    a: &Assessment,
) -> ProviderStatus {
    let mut conditions: Vec<Condition> = current
        .map(|s| s.conditions.clone())
        .unwrap_or_default()
        .into_iter()
        .filter(|c| a.conditions.iter().any(|n| n.type_ == c.type_))
        .collect();
    for condition in &a.conditions {
        set_condition(&mut conditions, condition.clone());
    }
    ProviderStatus {
        observed_generation: generation,
        phase: a.phase.clone(),
        conditions,
    }
}

fn unchanged(current: Option<&ProviderStatus>, next: &ProviderStatus) -> bool {
    current.is_some_and(|c| {
        c.phase == next.phase
            && c.observed_generation == next.observed_generation
            && same_conditions(&c.conditions, &next.conditions)
    })
}

fn key_of(provider: &Provider) -> String {
    format!(
        "{}/{}",
        provider.namespace().unwrap_or_default(),
        provider.name_any()
    )
}

/// Reconcile a Provider resource
#[instrument(skip(provider, ctx), fields(provider = %provider.name_any()))]
pub async fn reconcile(
    provider: Arc<Provider>,
    ctx: Arc<Context>,
) -> Result<Action, ProviderError> {
    let name = provider.name_any();
    let namespace = provider.namespace().unwrap_or_default();
    debug!(type_ = %provider.spec.type_, "reconciling provider");

    let assessment = assess(&provider, &ctx).await?;
    let current = provider.status.as_ref();
    let status = next_status(current, provider.metadata.generation, &assessment);

    if !unchanged(current, &status) {
        ctx.kube.patch_status(&name, &namespace, &status).await?;
        let was = current.map(|s| s.phase.clone()).unwrap_or_default();
        if was != status.phase {
            publish_transition(&provider, &ctx, &status).await;
        }
    }

    ctx.backoff.succeeded(&key_of(&provider));
    Ok(Action::requeue(assessment.requeue()))
}

async fn publish_transition(provider: &Provider, ctx: &Context, status: &ProviderStatus) {
    let reference = provider.object_ref(&());
    let message = status
        .conditions
        .iter()
        .find(|c| c.type_ == READY)
        .map(|c| c.message.clone());
    if status.phase == ProviderPhase::Ready {
        info!("provider is ready");
        ctx.events
            .publish(
                &reference,
                EventType::Normal,
                reasons::PROVIDER_READY,
                actions::VALIDATE,
                message,
            )
            .await;
    } else {
        warn!(
            phase = %status.phase,
            message = message.as_deref().unwrap_or_default(),
            "provider is not ready"
        );
        ctx.events
            .publish(
                &reference,
                EventType::Warning,
                reasons::PROVIDER_NOT_READY,
                actions::VALIDATE,
                message,
            )
            .await;
    }
}

/// Error policy for the controller
///
/// Requeues with a delay that doubles per consecutive failure.
pub fn error_policy(provider: Arc<Provider>, error: &ProviderError, ctx: Arc<Context>) -> Action {
    let delay = ctx.backoff.failed(&key_of(&provider));
    warn!(
        %error,
        provider = %provider.name_any(),
        retryable = error.is_retryable(),
        delay_secs = delay.as_secs(),
        "provider reconciliation failed"
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forklift_common::crd::{find_condition, ObjectRef, ProviderSpec, ProviderType, Ref};
    use forklift_inventory::{Network, ProviderInfo, Storage, Vm};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use mockall::mock;
    use std::sync::Mutex;

    // Local mock for Inventory since the mockall-generated mock is only
    // available within the forklift-inventory crate's test configuration
    mock! {
        pub Inventory {}

        #[async_trait]
        impl Inventory for Inventory {
            async fn provider(
                &self,
                provider: &ProviderKey,
            ) -> Result<ProviderInfo, InventoryError>;
            async fn vms(&self, provider: &ProviderKey) -> Result<Vec<Vm>, InventoryError>;
            async fn vm(
                &self,
                provider: &ProviderKey,
                reference: &Ref,
            ) -> Result<Vm, InventoryError>;
            async fn network(
                &self,
                provider: &ProviderKey,
                reference: &Ref,
            ) -> Result<Network, InventoryError>;
            async fn storage(
                &self,
                provider: &ProviderKey,
                reference: &Ref,
            ) -> Result<Storage, InventoryError>;
        }
    }

    #[derive(Clone, Default)]
    struct StatusCapture(Arc<Mutex<Vec<ProviderStatus>>>);

    impl StatusCapture {
        fn record(&self, status: ProviderStatus) {
            self.0.lock().expect("mutex should not be poisoned").push(status);
        }

        fn last(&self) -> ProviderStatus {
            self.0
                .lock()
                .expect("mutex should not be poisoned")
                .last()
                .cloned()
                .expect("a status was patched")
        }
    }

    fn vsphere(settings: &[(&str, &str)]) -> Provider {
        Provider {
            metadata: ObjectMeta {
                name: Some("vcenter".into()),
                namespace: Some("mtv".into()),
                uid: Some("c5f1".into()),
                generation: Some(3),
                ..Default::default()
            },
            spec: ProviderSpec {
                type_: ProviderType::VSphere,
                url: "https://vcenter.example.com/sdk".into(),
                secret: Some(ObjectRef::new("vcenter-creds", "mtv")),
                settings: settings
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            status: None,
        }
    }

    fn credentials() -> Secret {
        Secret {
            data: Some(
                [
                    ("user", "administrator@vsphere.local"),
                    ("password", "secret"),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
            ),
            ..Default::default()
        }
    }

    fn kube_with_secret(secret: Option<Secret>) -> (MockKubeClient, StatusCapture) {
        let capture = StatusCapture::default();
        let recorded = capture.clone();
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .returning(move |_, _| Ok(secret.clone()));
        kube.expect_patch_status().returning(move |_, _, status| {
            recorded.record(status.clone());
            Ok(())
        });
        (kube, capture)
    }

    fn inventory_status(status: &'static str) -> MockInventory {
        let mut inventory = MockInventory::new();
        inventory.expect_provider().returning(move |key| {
            Ok(ProviderInfo {
                uid: key.uid.clone(),
                name: "vcenter".into(),
                status: status.into(),
                vm_count: 12,
            })
        });
        inventory
    }

    fn context(kube: MockKubeClient, inventory: MockInventory) -> Arc<Context> {
        Arc::new(Context::for_testing(Arc::new(kube), Arc::new(inventory)))
    }

    /// Story: A vSphere provider with credentials and a loaded inventory is Ready
    #[tokio::test]
    async fn story_healthy_provider_becomes_ready() {
        let (kube, capture) = kube_with_secret(Some(credentials()));
        let ctx = context(kube, inventory_status("Ready"));

        let action = reconcile(Arc::new(vsphere(&[])), ctx).await.unwrap();

        let status = capture.last();
        assert_eq!(status.phase, ProviderPhase::Ready);
        assert_eq!(status.observed_generation, Some(3));
        assert!(forklift_common::crd::is_condition_true(&status.conditions, READY));
        assert!(forklift_common::crd::is_condition_true(
            &status.conditions,
            CONNECTION_TEST_SUCCEEDED
        ));
        assert_eq!(action, Action::requeue(READY_REQUEUE));
    }

    /// Story: The local cluster needs no secret and no connection test
    #[tokio::test]
    async fn story_host_provider_is_always_ready() {
        let capture = StatusCapture::default();
        let recorded = capture.clone();
        let mut kube = MockKubeClient::new();
        kube.expect_patch_status().returning(move |_, _, s| {
            recorded.record(s.clone());
            Ok(())
        });
        let host = Provider::new(
            "host",
            ProviderSpec {
                type_: ProviderType::OpenShift,
                ..Default::default()
            },
        );

        reconcile(Arc::new(host), context(kube, MockInventory::new()))
            .await
            .unwrap();
        assert_eq!(capture.last().phase, ProviderPhase::Ready);
    }

    /// Story: An unknown setting fails validation before any connection attempt
    #[tokio::test]
    async fn story_unknown_setting_blocks_the_provider() {
        let (kube, capture) = kube_with_secret(Some(credentials()));
        let ctx = context(kube, MockInventory::new());

        reconcile(Arc::new(vsphere(&[("vddkThreads", "4")])), ctx)
            .await
            .unwrap();

        let status = capture.last();
        assert_eq!(status.phase, ProviderPhase::ValidationFailed);
        let ready = find_condition(&status.conditions, READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "UnknownProviderSetting");
        assert!(find_condition(&status.conditions, "Validation.UnknownProviderSetting").is_some());
    }

    #[tokio::test]
    async fn missing_secret_is_reported() {
        let (kube, capture) = kube_with_secret(None);
        reconcile(Arc::new(vsphere(&[])), context(kube, MockInventory::new()))
            .await
            .unwrap();
        let ready = find_condition(&capture.last().conditions, READY).cloned().unwrap();
        assert_eq!(ready.reason, "SecretNotFound");
        assert!(ready.message.contains("mtv/vcenter-creds"));
    }

    #[tokio::test]
    async fn malformed_url_is_reported() {
        let (kube, capture) = kube_with_secret(Some(credentials()));
        let mut provider = vsphere(&[]);
        provider.spec.url = "vcenter.example.com".into();

        reconcile(Arc::new(provider), context(kube, MockInventory::new()))
            .await
            .unwrap();
        let ready = find_condition(&capture.last().conditions, READY).cloned().unwrap();
        assert_eq!(ready.reason, "UrlNotValid");
    }

    #[tokio::test]
    async fn loading_inventory_keeps_the_provider_staging() {
        let (kube, capture) = kube_with_secret(Some(credentials()));
        let mut inventory = MockInventory::new();
        inventory.expect_provider().returning(|_| {
            Err(InventoryError::ProviderNotReady {
                path: "/providers/vsphere/c5f1".into(),
            })
        });

        let action = reconcile(Arc::new(vsphere(&[])), context(kube, inventory))
            .await
            .unwrap();
        assert_eq!(capture.last().phase, ProviderPhase::Staging);
        assert_eq!(action, Action::requeue(STAGING_REQUEUE));
    }

    #[tokio::test]
    async fn collector_failure_fails_the_connection_test() {
        let (kube, capture) = kube_with_secret(Some(credentials()));
        reconcile(Arc::new(vsphere(&[])), context(kube, inventory_status("ConnectionFailed")))
            .await
            .unwrap();

        let status = capture.last();
        assert_eq!(status.phase, ProviderPhase::ConnectionFailed);
        let test = find_condition(&status.conditions, CONNECTION_TEST_SUCCEEDED).unwrap();
        assert_eq!(test.status, ConditionStatus::False);
        assert_eq!(test.reason, "ConnectionTestFailed");
    }

    /// Story: Reconciling an unchanged, already-Ready provider patches nothing
    #[tokio::test]
    async fn story_reconcile_is_idempotent() {
        let (kube, capture) = kube_with_secret(Some(credentials()));
        reconcile(Arc::new(vsphere(&[])), context(kube, inventory_status("Ready")))
            .await
            .unwrap();

        let mut provider = vsphere(&[]);
        provider.status = Some(capture.last());
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .returning(|_, _| Ok(Some(credentials())));
        kube.expect_patch_status().never();

        reconcile(Arc::new(provider), context(kube, inventory_status("Ready")))
            .await
            .unwrap();
    }

    /// Story: An unreachable inventory is a reconciler error with growing backoff
    #[tokio::test]
    async fn story_unreachable_inventory_backs_off() {
        let (kube, _) = kube_with_secret(Some(credentials()));
        let mut inventory = MockInventory::new();
        inventory.expect_provider().returning(|_| {
            Err(InventoryError::Transport {
                path: "/providers/vsphere/c5f1".into(),
                message: "connection refused".into(),
            })
        });
        let ctx = context(kube, inventory);
        let provider = Arc::new(vsphere(&[]));

        let err = reconcile(provider.clone(), ctx.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            error_policy(provider.clone(), &err, ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            error_policy(provider, &err, ctx),
            Action::requeue(Duration::from_secs(10))
        );
    }

    #[test]
    fn stale_conditions_are_dropped() {
        let previous = next_status(
            None,
            Some(1),
            &Assessment::invalid(Reason::SecretNotFound, "missing"),
        );
        let next = next_status(
            Some(&previous),
            Some(2),
            &Assessment::ready("The provider is ready.", true),
        );
        assert!(find_condition(&next.conditions, "Validation.SecretNotFound").is_none());
        assert_eq!(next.conditions.len(), 2);
    }
}

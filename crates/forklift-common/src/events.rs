//! Kubernetes Event recording for forklift controllers.
//!
//! Events are fire-and-forget: a failed publish is logged at warn and never
//! breaks reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`.
    ///
    /// `reason` is one of [`reasons`], `action` one of [`actions`].
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (REASON column of `kubectl get events`).
pub mod reasons {
    /// Plan passed validation
    pub const PLAN_READY: &str = "PlanReady";
    /// Plan failed validation
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Migration started executing
    pub const MIGRATION_STARTED: &str = "MigrationStarted";
    /// Migration reached a terminal state
    pub const MIGRATION_COMPLETED: &str = "MigrationCompleted";
    /// A VM migrated successfully
    pub const VM_SUCCEEDED: &str = "VMSucceeded";
    /// A VM failed
    pub const VM_FAILED: &str = "VMFailed";
    /// A VM was canceled
    pub const VM_CANCELED: &str = "VMCanceled";
    /// Warm cutover released the barrier
    pub const CUTOVER: &str = "Cutover";
    /// An existing populator worker was adopted
    pub const WORKER_ADOPTED: &str = "WorkerAdopted";
    /// Archive was refused or deferred
    pub const ARCHIVE_DEFERRED: &str = "ArchiveDeferred";
    /// Plan archived
    pub const ARCHIVED: &str = "Archived";
    /// Provider is ready
    pub const PROVIDER_READY: &str = "ProviderReady";
    /// Provider validation or connection failed
    pub const PROVIDER_NOT_READY: &str = "ProviderNotReady";
}

/// Event actions (ACTION column of `kubectl get events`).
pub mod actions {
    /// Reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Validating intent
    pub const VALIDATE: &str = "Validate";
    /// Executing a migration
    pub const MIGRATE: &str = "Migrate";
    /// Canceling VMs
    pub const CANCEL: &str = "Cancel";
    /// Cleaning up helpers
    pub const CLEANUP: &str = "Cleanup";
    /// Archiving a plan
    pub const ARCHIVE: &str = "Archive";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::VM_FAILED,
                actions::MIGRATE,
                Some("conversion exited 1".to_string()),
            )
            .await;
    }
}

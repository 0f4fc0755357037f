//! Kubernetes access for the plan controller

use async_trait::async_trait;
use forklift_common::crd::{
    Hook, Migration, MigrationStatus, NetworkMap, Plan, PlanStatus, Provider, StorageMap,
};
use forklift_common::{FIELD_MANAGER, PLAN_FINALIZER};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;

use crate::error::PlanError;
use crate::kubevirt::network_attachment_resource;

/// Trait abstracting Kubernetes client operations for Plan
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Provider
    async fn get_provider(&self, name: &str, namespace: &str)
        -> Result<Option<Provider>, PlanError>;

    /// Get a Secret
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, PlanError>;

    /// Get a NetworkMap
    async fn get_network_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<NetworkMap>, PlanError>;

    /// Get a StorageMap
    async fn get_storage_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<StorageMap>, PlanError>;

    /// Get a Hook
    async fn get_hook(&self, name: &str, namespace: &str) -> Result<Option<Hook>, PlanError>;

    /// Whether a NetworkAttachmentDefinition exists
    async fn network_attachment_exists(&self, name: &str, namespace: &str)
        -> Result<bool, PlanError>;

    /// Migrations of a plan
    async fn list_migrations(&self, plan: &str, namespace: &str)
        -> Result<Vec<Migration>, PlanError>;

    /// Patch the status of a Plan
    async fn patch_plan_status(
        &self,
        name: &str,
        namespace: &str,
        status: &PlanStatus,
    ) -> Result<(), PlanError>;

    /// Patch the status of a Migration
    async fn patch_migration_status(
        &self,
        name: &str,
        namespace: &str,
        status: &MigrationStatus,
    ) -> Result<(), PlanError>;

    /// Add the cleanup finalizer to a Plan
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), PlanError>;

    /// Remove the cleanup finalizer from a Plan
    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), PlanError>;
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

    async fn get<K>(&self, name: &str, namespace: &str) -> Result<Option<K>, PlanError>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn finalizers(&self, name: &str, namespace: &str) -> Result<Vec<String>, PlanError> {
        Ok(self
            .get::<Plan>(name, namespace)
            .await?
            .and_then(|p| p.metadata.finalizers)
            .unwrap_or_default())
    }

    async fn set_finalizers(
        &self,
        name: &str,
        namespace: &str,
        finalizers: Vec<String>,
    ) -> Result<(), PlanError> {
        let api: Api<Plan> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_provider(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Provider>, PlanError> {
        self.get(name, namespace).await
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, PlanError> {
        self.get(name, namespace).await
    }

    async fn get_network_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<NetworkMap>, PlanError> {
        self.get(name, namespace).await
    }

    async fn get_storage_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<StorageMap>, PlanError> {
        self.get(name, namespace).await
    }

    async fn get_hook(&self, name: &str, namespace: &str) -> Result<Option<Hook>, PlanError> {
        self.get(name, namespace).await
    }

    async fn network_attachment_exists(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<bool, PlanError> {
        let api: Api<kube::api::DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            namespace,
            &network_attachment_resource(),
        );
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn list_migrations(
        &self,
        plan: &str,
        namespace: &str,
    ) -> Result<Vec<Migration>, PlanError> {
        let api: Api<Migration> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|m| m.spec.plan.name == plan)
            .collect())
    }

    async fn patch_plan_status(
        &self,
        name: &str,
        namespace: &str,
        status: &PlanStatus,
    ) -> Result<(), PlanError> {
        let api: Api<Plan> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_migration_status(
        &self,
        name: &str,
        namespace: &str,
        status: &MigrationStatus,
    ) -> Result<(), PlanError> {
        let api: Api<Migration> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), PlanError> {
        let mut finalizers = self.finalizers(name, namespace).await?;
        if finalizers.iter().any(|f| f == PLAN_FINALIZER) {
            return Ok(());
        }
        finalizers.push(PLAN_FINALIZER.to_string());
        self.set_finalizers(name, namespace, finalizers).await
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), PlanError> {
        let finalizers = self.finalizers(name, namespace).await?;
        if !finalizers.iter().any(|f| f == PLAN_FINALIZER) {
            return Ok(());
        }
        let kept = finalizers
            .into_iter()
            .filter(|f| f != PLAN_FINALIZER)
            .collect();
        self.set_finalizers(name, namespace, kept).await
    }
}

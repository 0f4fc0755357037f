//! Adapter construction for source providers
//!
//! Adapters are cached per provider UID and generation so each reconcile
//! reuses the platform session of the previous one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use forklift_adapter::{create_adapter, SourceAdapter};
use forklift_common::crd::Provider;
use forklift_inventory::Inventory;
use forklift_provider::merged_settings;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::error::PlanError;

/// Builds the adapter for a source provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceFactory: Send + Sync {
    /// Adapter for `provider` authenticated with `secret`
    async fn source(
        &self,
        provider: &Provider,
        secret: Option<Secret>,
    ) -> Result<Arc<dyn SourceAdapter>, PlanError>;
}

/// Factory over [`create_adapter`]
pub struct AdapterFactory {
    inventory: Arc<dyn Inventory>,
    call_timeout: Duration,
    cache: DashMap<String, (Option<i64>, Arc<dyn SourceAdapter>)>,
}

impl AdapterFactory {
    /// Factory whose adapters bound each call by `call_timeout`
    pub fn new(inventory: Arc<dyn Inventory>, call_timeout: Duration) -> Self {
        Self {
            inventory,
            call_timeout,
            cache: DashMap::new(),
        }
    }
}

#[async_trait]
impl SourceFactory for AdapterFactory {
    async fn source(
        &self,
        provider: &Provider,
        secret: Option<Secret>,
    ) -> Result<Arc<dyn SourceAdapter>, PlanError> {
        let key = provider.uid().unwrap_or_else(|| provider.name_any());
        let generation = provider.metadata.generation;
        if let Some(entry) = self.cache.get(&key) {
            if entry.0 == generation {
                return Ok(entry.1.clone());
            }
        }
        let settings = merged_settings(provider, secret.as_ref())?;
        let adapter =
            create_adapter(provider, &settings, self.inventory.clone(), self.call_timeout)?;
        debug!(
            provider = %provider.name_any(),
            type_ = %provider.spec.type_,
            "built source adapter"
        );
        if let Some((_, (_, stale))) = self.cache.remove(&key) {
            stale.close().await;
        }
        self.cache.insert(key, (generation, adapter.clone()));
        Ok(adapter)
    }
}

//! HTTP client for the inventory service

use std::time::Duration;

use async_trait::async_trait;
use forklift_common::crd::Ref;
#[cfg(test)]
use mockall::automock;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::cache::TtlCache;
use crate::config::InventoryConfig;
use crate::error::InventoryError;
use crate::model::{Collection, Network, ProviderInfo, ProviderKey, Storage, Vm};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only view of the inventory
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Provider collector status
    async fn provider(&self, provider: &ProviderKey) -> Result<ProviderInfo, InventoryError>;

    /// Every VM of a provider
    async fn vms(&self, provider: &ProviderKey) -> Result<Vec<Vm>, InventoryError>;

    /// Resolve a VM reference
    async fn vm(&self, provider: &ProviderKey, reference: &Ref) -> Result<Vm, InventoryError>;

    /// Resolve a network reference
    async fn network(
        &self,
        provider: &ProviderKey,
        reference: &Ref,
    ) -> Result<Network, InventoryError>;

    /// Resolve a storage reference
    async fn storage(
        &self,
        provider: &ProviderKey,
        reference: &Ref,
    ) -> Result<Storage, InventoryError>;
}

/// Inventory client with a TTL response cache
pub struct InventoryClient {
    base: Url,
    http: reqwest::Client,
    cache: TtlCache,
}

impl InventoryClient {
    /// Build a client from configuration, loading TLS material from disk
    pub fn new(config: &InventoryConfig) -> Result<Self, InventoryError> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .use_rustls_tls();

        if let Some(ca) = &config.tls_ca {
            let pem = std::fs::read(ca)
                .map_err(|e| InventoryError::Config(format!("read {}: {e}", ca.display())))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| InventoryError::Config(format!("parse {}: {e}", ca.display())))?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (&config.tls_certificate, &config.tls_key) {
            let mut pem = std::fs::read(cert)
                .map_err(|e| InventoryError::Config(format!("read {}: {e}", cert.display())))?;
            pem.extend(
                std::fs::read(key)
                    .map_err(|e| InventoryError::Config(format!("read {}: {e}", key.display())))?,
            );
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| InventoryError::Config(format!("client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        let http = builder
            .build()
            .map_err(|e| InventoryError::Config(e.to_string()))?;
        Self::with_http(&config.base_url(), http, config.cache_ttl)
    }

    /// Build a client over an existing HTTP client
    pub fn with_http(
        base_url: &str,
        http: reqwest::Client,
        cache_ttl: Duration,
    ) -> Result<Self, InventoryError> {
        let base = Url::parse(base_url)
            .map_err(|e| InventoryError::Config(format!("base url '{base_url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(InventoryError::Config(format!(
                "base url '{base_url}' cannot carry a path"
            )));
        }
        Ok(Self {
            base,
            http,
            cache: TtlCache::new(cache_ttl),
        })
    }

    /// The response cache
    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    fn url(&self, segments: &[&str], query: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        url
    }

    async fn fetch(&self, url: Url) -> Result<Value, InventoryError> {
        let path = url.path().to_string();
        debug!(%path, "inventory request");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| InventoryError::Transport {
                path: path.clone(),
                message: e.to_string(),
            })?;

        match response.status() {
            StatusCode::OK => response.json().await.map_err(|e| InventoryError::Decode {
                path,
                message: e.to_string(),
            }),
            StatusCode::PARTIAL_CONTENT => Err(InventoryError::ProviderNotReady { path }),
            StatusCode::NOT_FOUND => Err(InventoryError::NotFound {
                kind: "resource",
                reference: path,
            }),
            status => Err(InventoryError::Http {
                status: status.as_u16(),
                path,
            }),
        }
    }

    /// GET and decode, through the cache
    pub async fn get<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<T, InventoryError> {
        let url = self.url(segments, query);
        let key = url.to_string();
        let path = url.path().to_string();
        let body = self.cache.get_or_fetch(&key, || self.fetch(url)).await?;
        serde_json::from_value(body).map_err(|e| InventoryError::Decode {
            path,
            message: e.to_string(),
        })
    }

    async fn by_ref<T: DeserializeOwned>(
        &self,
        provider: &ProviderKey,
        collection: Collection,
        reference: &Ref,
    ) -> Result<T, InventoryError> {
        let type_ = provider.type_.to_string();
        let segment = collection.segment(provider.type_);
        let root = ["providers", type_.as_str(), provider.uid.as_str(), segment];
        let kind = collection.kind();

        if let Some(id) = reference.id.as_deref().filter(|id| !id.is_empty()) {
            let mut segments = root.to_vec();
            segments.push(id);
            return self
                .get(&segments, &[("detail", "1")])
                .await
                .map_err(|e| match e {
                    InventoryError::NotFound { .. } => InventoryError::NotFound {
                        kind,
                        reference: reference.to_string(),
                    },
                    other => other,
                });
        }

        let Some(name) = reference.name.as_deref().filter(|n| !n.is_empty()) else {
            return Err(InventoryError::NotFound {
                kind,
                reference: reference.to_string(),
            });
        };
        let mut found: Vec<T> = self
            .get(&root, &[("name", name), ("detail", "1")])
            .await?;
        match found.len() {
            0 => Err(InventoryError::NotFound {
                kind,
                reference: reference.to_string(),
            }),
            1 => Ok(found.remove(0)),
            _ => Err(InventoryError::RefNotUnique {
                kind,
                reference: reference.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Inventory for InventoryClient {
    #[instrument(skip(self), fields(provider = %provider.root()))]
    async fn provider(&self, provider: &ProviderKey) -> Result<ProviderInfo, InventoryError> {
        let type_ = provider.type_.to_string();
        self.get(&["providers", type_.as_str(), provider.uid.as_str()], &[])
            .await
            .map_err(|e| match e {
                InventoryError::NotFound { .. } => InventoryError::NotFound {
                    kind: "provider",
                    reference: provider.uid.clone(),
                },
                other => other,
            })
    }

    async fn vms(&self, provider: &ProviderKey) -> Result<Vec<Vm>, InventoryError> {
        let type_ = provider.type_.to_string();
        self.get(
            &["providers", type_.as_str(), provider.uid.as_str(), "vms"],
            &[("detail", "1")],
        )
        .await
    }

    async fn vm(&self, provider: &ProviderKey, reference: &Ref) -> Result<Vm, InventoryError> {
        self.by_ref(provider, Collection::Vms, reference).await
    }

    async fn network(
        &self,
        provider: &ProviderKey,
        reference: &Ref,
    ) -> Result<Network, InventoryError> {
        self.by_ref(provider, Collection::Networks, reference).await
    }

    async fn storage(
        &self,
        provider: &ProviderKey,
        reference: &Ref,
    ) -> Result<Storage, InventoryError> {
        self.by_ref(provider, Collection::Storage, reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::{Json, Router};
    use forklift_common::crd::ProviderType;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Hits(Arc<AtomicUsize>);

    async fn vm_by_id(
        State(hits): State<Hits>,
        Path(id): Path<String>,
    ) -> Result<Json<Value>, AxumStatus> {
        hits.0.fetch_add(1, Ordering::SeqCst);
        match id.as_str() {
            "vm-1" => Ok(Json(json!({
                "id": "vm-1",
                "name": "db-01",
                "powerState": "poweredOn",
                "disks": [{"file": "[ds1] db.vmdk", "capacity": 1024, "datastore": {"id": "ds-1"}}]
            }))),
            _ => Err(AxumStatus::NOT_FOUND),
        }
    }

    async fn networks_by_name(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        match q.get("name").map(String::as_str) {
            Some("VM Network") => Json(json!([
                {"id": "network-1", "name": "VM Network"},
                {"id": "network-2", "name": "VM Network"}
            ])),
            Some("storage-net") => Json(json!([{"id": "network-3", "name": "storage-net"}])),
            _ => Json(json!([])),
        }
    }

    async fn serve() -> (String, Hits) {
        let hits = Hits::default();
        let app = Router::new()
            .route(
                "/providers/vsphere/u1",
                get(|| async { Json(json!({"uid": "u1", "status": "Ready"})) }),
            )
            .route(
                "/providers/ovirt/u2",
                get(|| async { (AxumStatus::PARTIAL_CONTENT, Json(json!({}))) }),
            )
            .route("/providers/vsphere/u1/vms/:id", get(vm_by_id))
            .route("/providers/vsphere/u1/networks", get(networks_by_name))
            .with_state(hits.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    fn client(base: &str, ttl: Duration) -> InventoryClient {
        InventoryClient::with_http(base, reqwest::Client::new(), ttl).unwrap()
    }

    fn vsphere() -> ProviderKey {
        ProviderKey::new(ProviderType::VSphere, "u1")
    }

    #[tokio::test]
    async fn story_vm_lookup_by_id_is_cached() {
        let (base, hits) = serve().await;
        let inventory = client(&base, Duration::from_secs(60));

        let vm = inventory.vm(&vsphere(), &Ref::by_id("vm-1")).await.unwrap();
        assert_eq!(vm.name, "db-01");
        assert_eq!(vm.disks[0].storage, Ref::by_id("ds-1"));

        inventory.vm(&vsphere(), &Ref::by_id("vm-1")).await.unwrap();
        assert_eq!(hits.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_vm_is_not_found_with_reference() {
        let (base, _) = serve().await;
        let inventory = client(&base, Duration::ZERO);
        let err = inventory
            .vm(&vsphere(), &Ref::by_id("vm-404"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            InventoryError::NotFound {
                kind: "vm",
                reference: "id:vm-404".into()
            }
        );
    }

    #[tokio::test]
    async fn name_lookup_requires_a_unique_match() {
        let (base, _) = serve().await;
        let inventory = client(&base, Duration::ZERO);

        let net = inventory
            .network(&vsphere(), &Ref::by_name("storage-net"))
            .await
            .unwrap();
        assert_eq!(net.id, "network-3");

        let err = inventory
            .network(&vsphere(), &Ref::by_name("VM Network"))
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::RefNotUnique { kind: "network", .. }));

        let err = inventory
            .network(&vsphere(), &Ref::by_name("nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn partial_content_means_provider_not_ready() {
        let (base, _) = serve().await;
        let inventory = client(&base, Duration::ZERO);

        let ready = inventory.provider(&vsphere()).await.unwrap();
        assert!(ready.is_ready());

        let err = inventory
            .provider(&ProviderKey::new(ProviderType::Ovirt, "u2"))
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::ProviderNotReady { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_service_is_transient() {
        let inventory = client("http://127.0.0.1:9", Duration::ZERO);
        let err = inventory.provider(&vsphere()).await.unwrap_err();
        assert!(matches!(err, InventoryError::Transport { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn urls_encode_names_and_segments() {
        let inventory = client("https://inventory:8443", Duration::ZERO);
        let url = inventory.url(
            &["providers", "vsphere", "u1", "networks"],
            &[("name", "VM Network")],
        );
        assert_eq!(
            url.as_str(),
            "https://inventory:8443/providers/vsphere/u1/networks?name=VM+Network"
        );
    }

    #[tokio::test]
    async fn mocked_inventory_seam() {
        let mut inventory = MockInventory::new();
        inventory
            .expect_vm()
            .returning(|_, r| {
                Ok(Vm {
                    id: r.key().unwrap_or_default().to_string(),
                    ..Default::default()
                })
            });
        let vm = inventory.vm(&vsphere(), &Ref::by_id("vm-7")).await.unwrap();
        assert_eq!(vm.id, "vm-7");
    }
}

//! Per-platform adapters and the factory that selects one
//!
//! Every adapter shares [`Base`]: inventory reads for VM descriptions and the
//! control endpoint for live state and mutations, each call bounded by the
//! configured per-call budget.

mod hyperv;
mod openstack;
mod ova;
mod ovirt;
mod vsphere;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use forklift_common::crd::{PowerState, Provider, ProviderSettings, ProviderType, Ref};
use forklift_inventory::{Inventory, InventoryError, ProviderKey, Vm};
use kube::ResourceExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::control::{ControlPath, HttpProviderControl, ProviderControl};
use crate::error::AdapterError;
use crate::{DiskChanges, SnapshotState, SourceAdapter};

pub use hyperv::HyperVAdapter;
pub use openstack::OpenStackAdapter;
pub use ova::OvaAdapter;
pub use ovirt::OvirtAdapter;
pub use vsphere::VSphereAdapter;

/// Build the adapter for a source provider
///
/// `settings` are the provider's options already merged with its secret.
pub fn create_adapter(
    provider: &Provider,
    settings: &ProviderSettings,
    inventory: Arc<dyn Inventory>,
    call_timeout: Duration,
) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
    let url = settings.url.as_deref().unwrap_or(&provider.spec.url);
    let control = Arc::new(HttpProviderControl::new(url, settings, call_timeout)?);
    create_adapter_with_control(provider, settings, inventory, control, call_timeout)
}

/// Build the adapter for a source provider over an explicit control transport
pub fn create_adapter_with_control(
    provider: &Provider,
    settings: &ProviderSettings,
    inventory: Arc<dyn Inventory>,
    control: Arc<dyn ProviderControl>,
    call_timeout: Duration,
) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
    let type_ = provider.spec.type_;
    if !type_.is_source() {
        return Err(not_a_source(provider));
    }
    let uid = provider.uid().ok_or_else(|| {
        AdapterError::InvalidProvider(format!("provider {} has no uid", provider.name_any()))
    })?;

    let base = Base {
        key: ProviderKey::new(type_, uid),
        url: settings
            .url
            .clone()
            .unwrap_or_else(|| provider.spec.url.clone()),
        inventory,
        control,
        timeout: call_timeout,
    };
    debug!(provider = %provider.name_any(), %type_, "creating source adapter");

    let adapter: Arc<dyn SourceAdapter> = match type_ {
        ProviderType::VSphere => Arc::new(VSphereAdapter::new(base, settings)),
        ProviderType::Ovirt => Arc::new(OvirtAdapter::new(base)),
        ProviderType::OpenStack => Arc::new(OpenStackAdapter::new(base, settings)),
        ProviderType::HyperV => Arc::new(HyperVAdapter::new(base)),
        ProviderType::Ova => Arc::new(OvaAdapter::new(base)),
        ProviderType::OpenShift => return Err(not_a_source(provider)),
    };
    Ok(adapter)
}

fn not_a_source(provider: &Provider) -> AdapterError {
    AdapterError::InvalidProvider(format!(
        "{} provider {} cannot be a migration source",
        provider.spec.type_,
        provider.name_any()
    ))
}

#[derive(Deserialize)]
struct PowerBody {
    state: String,
}

#[derive(Deserialize)]
struct SnapshotCreated {
    id: String,
}

#[derive(Deserialize)]
struct SnapshotBody {
    state: String,
    #[serde(default)]
    message: Option<String>,
}

/// State shared by every adapter
pub(crate) struct Base {
    pub key: ProviderKey,
    pub url: String,
    pub inventory: Arc<dyn Inventory>,
    pub control: Arc<dyn ProviderControl>,
    pub timeout: Duration,
}

impl Base {
    /// Run `call` within the per-call budget
    pub async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T, AdapterError>
    where
        F: Future<Output = Result<T, AdapterError>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| AdapterError::Timeout {
                operation: operation.to_string(),
                budget: self.timeout,
            })?
    }

    pub async fn list_vms(&self) -> Result<Vec<Vm>, AdapterError> {
        self.bounded("list vms", async {
            Ok(self.inventory.vms(&self.key).await?)
        })
        .await
    }

    pub async fn vm(&self, reference: &Ref) -> Result<Vm, AdapterError> {
        self.bounded("inspect", async {
            Ok(self.inventory.vm(&self.key, reference).await?)
        })
        .await
    }

    /// Source ID of a VM, resolving name-only references through inventory
    pub async fn vm_id(&self, reference: &Ref) -> Result<String, AdapterError> {
        match &reference.id {
            Some(id) => Ok(id.clone()),
            None => Ok(self.vm(reference).await?.id),
        }
    }

    pub async fn live_power_state(
        &self,
        reference: &Ref,
        parse: fn(&str) -> PowerState,
    ) -> Result<PowerState, AdapterError> {
        let id = self.vm_id(reference).await?;
        let path = ControlPath::vm(&id).join("power");
        let body = self
            .bounded("power state", self.control.get(&path, vec![]))
            .await?
            .ok_or_else(|| vm_not_found(reference))?;
        let power: PowerBody = decode("power state", body)?;
        Ok(parse(&power.state))
    }

    pub async fn set_power(&self, reference: &Ref, action: &str) -> Result<(), AdapterError> {
        let id = self.vm_id(reference).await?;
        let path = ControlPath::vm(&id).join("power");
        self.bounded(
            &format!("power {action}"),
            self.control.post(&path, json!({ "action": action })),
        )
        .await
        .map(|_| ())
    }

    pub async fn create_snapshot(
        &self,
        reference: &Ref,
        name: &str,
        quiesce: bool,
    ) -> Result<String, AdapterError> {
        let id = self.vm_id(reference).await?;
        let path = ControlPath::vm(&id).join("snapshots");
        let body = self
            .bounded(
                "create snapshot",
                self.control
                    .post(&path, json!({ "name": name, "quiesce": quiesce })),
            )
            .await?;
        let created: SnapshotCreated = decode("create snapshot", body)?;
        Ok(created.id)
    }

    pub async fn snapshot_state(
        &self,
        reference: &Ref,
        snapshot: &str,
    ) -> Result<SnapshotState, AdapterError> {
        let id = self.vm_id(reference).await?;
        let path = ControlPath::vm(&id).join("snapshots").join(snapshot);
        let Some(body) = self
            .bounded("snapshot state", self.control.get(&path, vec![]))
            .await?
        else {
            return Ok(SnapshotState::Gone);
        };
        let body: SnapshotBody = decode("snapshot state", body)?;
        Ok(SnapshotState::parse(&body.state, body.message.as_deref()))
    }

    pub async fn remove_snapshot(
        &self,
        reference: &Ref,
        snapshot: &str,
    ) -> Result<(), AdapterError> {
        let id = self.vm_id(reference).await?;
        let path = ControlPath::vm(&id).join("snapshots").join(snapshot);
        self.bounded("remove snapshot", self.control.delete(&path))
            .await
    }

    pub async fn changes(
        &self,
        reference: &Ref,
        disk: &str,
        baseline: Option<String>,
        snapshot: &str,
    ) -> Result<DiskChanges, AdapterError> {
        let id = self.vm_id(reference).await?;
        let path = ControlPath::vm(&id).join("disks").join(disk).join("changes");
        let mut query = vec![("snapshot".to_string(), snapshot.to_string())];
        if let Some(baseline) = baseline {
            query.push(("baseline".to_string(), baseline));
        }
        let body = self
            .bounded("changes", self.control.get(&path, query))
            .await?
            .ok_or_else(|| AdapterError::Control {
                operation: "changes".into(),
                status: Some(404),
                message: format!("disk {disk} not found on vm {id}"),
            })?;
        let mut changes: DiskChanges = decode("changes", body)?;
        if changes.disk.is_empty() {
            changes.disk = disk.to_string();
        }
        Ok(changes)
    }
}

fn vm_not_found(reference: &Ref) -> AdapterError {
    AdapterError::Inventory(InventoryError::NotFound {
        kind: "vm",
        reference: reference.to_string(),
    })
}

fn decode<T: serde::de::DeserializeOwned>(
    operation: &str,
    body: serde_json::Value,
) -> Result<T, AdapterError> {
    serde_json::from_value(body).map_err(|e| AdapterError::Decode {
        operation: operation.to_string(),
        message: e.to_string(),
    })
}

/// Map a platform power string onto [`PowerState`]
pub(crate) fn power_from(state: &str, on: &[&str], off: &[&str]) -> PowerState {
    if on.iter().any(|s| s.eq_ignore_ascii_case(state)) {
        PowerState::On
    } else if off.iter().any(|s| s.eq_ignore_ascii_case(state)) {
        PowerState::Off
    } else {
        PowerState::Unknown
    }
}

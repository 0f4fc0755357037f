//! NetworkMap and StorageMap CRD types

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ObjectRef, Ref};

/// Source/destination provider pair
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPair {
    /// Source provider
    pub source: ObjectRef,
    /// Destination provider
    pub destination: ObjectRef,
}

// =============================================================================
// Network
// =============================================================================

/// Destination network kind
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// The pod network
    #[default]
    Pod,
    /// A Multus NetworkAttachmentDefinition
    Multus,
    /// Do not attach the source NIC
    Ignored,
}

/// Destination of a network pair
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationNetwork {
    /// Network kind
    #[serde(rename = "type")]
    pub type_: NetworkType,
    /// NetworkAttachmentDefinition name (multus only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// NetworkAttachmentDefinition namespace (multus only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Source network mapped to a destination
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPair {
    /// Source network
    pub source: Ref,
    /// Destination network
    pub destination: DestinationNetwork,
}

/// Network mapping
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "NetworkMap",
    plural = "networkmaps",
    namespaced,
    status = "MapStatus",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMapSpec {
    /// Provider pair the mapping applies to
    pub provider: ProviderPair,
    /// Pairs
    #[serde(default)]
    pub map: Vec<NetworkPair>,
}

impl NetworkMapSpec {
    /// Find the pair for a source network
    pub fn find(&self, source: &Ref) -> Option<&NetworkPair> {
        self.map.iter().find(|p| p.source.matches(source))
    }
}

// =============================================================================
// Storage
// =============================================================================

/// vSphere XCOPY offload configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct XcopyConfig {
    /// Secret with storage array credentials
    pub secret_ref: String,
    /// Array product identifier
    pub storage_vendor_product: String,
}

/// Array-side copy offload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OffloadPlugin {
    /// vSphere XCOPY
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsphere_xcopy_config: Option<XcopyConfig>,
}

/// Destination of a storage pair
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationStorage {
    /// Storage class
    pub storage_class: String,
    /// Access mode override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,
    /// Volume mode override (Filesystem/Block)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
}

/// Source datastore/storage domain mapped to a storage class
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoragePair {
    /// Source storage
    pub source: Ref,
    /// Destination storage
    pub destination: DestinationStorage,
    /// Offload configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offload_plugin: Option<OffloadPlugin>,
}

/// Storage mapping
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "StorageMap",
    plural = "storagemaps",
    namespaced,
    status = "MapStatus",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StorageMapSpec {
    /// Provider pair the mapping applies to
    pub provider: ProviderPair,
    /// Pairs
    #[serde(default)]
    pub map: Vec<StoragePair>,
}

impl StorageMapSpec {
    /// Find the pair for a source datastore
    pub fn find(&self, source: &Ref) -> Option<&StoragePair> {
        self.map.iter().find(|p| p.source.matches(source))
    }
}

/// Status shared by both map kinds
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MapStatus {
    /// The generation last processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

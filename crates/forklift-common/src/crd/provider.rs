//! Provider CRD types
//!
//! A `Provider` describes a source virtualization platform (or the local
//! cluster as destination) and carries the options needed to reach it.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ObjectRef};
use crate::error::{Error, Reason};

// =============================================================================
// Provider type
// =============================================================================

/// Provider type
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// The Kubernetes/KubeVirt cluster itself
    #[default]
    OpenShift,
    /// VMware vSphere
    VSphere,
    /// Red Hat Virtualization / oVirt
    Ovirt,
    /// OpenStack
    OpenStack,
    /// Microsoft Hyper-V
    HyperV,
    /// OVA archives on a file share
    Ova,
}

impl ProviderType {
    /// Whether VMs from this provider need guest conversion by default
    pub fn requires_conversion(&self) -> bool {
        matches!(self, Self::VSphere | Self::Ova | Self::HyperV)
    }

    /// Whether this provider can be a migration source
    pub fn is_source(&self) -> bool {
        !matches!(self, Self::OpenShift)
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenShift => write!(f, "openshift"),
            Self::VSphere => write!(f, "vsphere"),
            Self::Ovirt => write!(f, "ovirt"),
            Self::OpenStack => write!(f, "openstack"),
            Self::HyperV => write!(f, "hyperv"),
            Self::Ova => write!(f, "ova"),
        }
    }
}

impl std::str::FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openshift" => Ok(Self::OpenShift),
            "vsphere" => Ok(Self::VSphere),
            "ovirt" => Ok(Self::Ovirt),
            "openstack" => Ok(Self::OpenStack),
            "hyperv" => Ok(Self::HyperV),
            "ova" => Ok(Self::Ova),
            _ => Err(format!("unknown provider type: {s}")),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// vSphere SDK endpoint flavour
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SdkEndpoint {
    /// vCenter
    #[default]
    VCenter,
    /// Standalone ESXi host
    Esxi,
}

/// Recognized provider options.
///
/// Options come from `spec.settings` merged with the credentials secret.
/// Every key must be one of [`ProviderSettings::KEYS`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderSettings {
    /// API endpoint
    pub url: Option<String>,
    /// Login user
    pub username: Option<String>,
    /// Login password
    pub password: Option<String>,
    /// PEM CA bundle
    pub ca: Option<String>,
    /// Skip TLS verification
    pub insecure_skip_tls: bool,
    /// VDDK init image (vSphere)
    pub vddk_init_image: Option<String>,
    /// SDK endpoint (vSphere)
    pub sdk_endpoint: SdkEndpoint,
    /// VDDK buffer size in 64 KiB units (vSphere)
    pub vddk_buf_size: Option<u32>,
    /// VDDK buffer count (vSphere)
    pub vddk_buf_count: Option<u32>,
    /// API token (OpenStack, Hyper-V)
    pub token: Option<String>,
    /// Identity domain (OpenStack)
    pub domain_name: Option<String>,
    /// Project (OpenStack)
    pub project_name: Option<String>,
    /// Region (OpenStack)
    pub region_name: Option<String>,
}

impl ProviderSettings {
    /// Every recognized key
    pub const KEYS: &'static [&'static str] = &[
        "url",
        "user",
        "password",
        "cacert",
        "insecureSkipVerify",
        "vddkInitImage",
        "sdkEndpoint",
        "vddkBufSize",
        "vddkBufCount",
        "token",
        "domainName",
        "projectName",
        "regionName",
    ];

    /// Parse options, rejecting unknown keys and malformed values
    pub fn parse(options: &BTreeMap<String, String>) -> Result<Self, Error> {
        let mut settings = Self::default();
        for (key, value) in options {
            let value = value.trim();
            match key.as_str() {
                "url" => settings.url = non_empty(value),
                "user" => settings.username = non_empty(value),
                "password" => settings.password = non_empty(value),
                "cacert" => settings.ca = non_empty(value),
                "insecureSkipVerify" => {
                    settings.insecure_skip_tls = parse_bool(key, value)?;
                }
                "vddkInitImage" => settings.vddk_init_image = non_empty(value),
                "sdkEndpoint" => {
                    settings.sdk_endpoint = match value.to_lowercase().as_str() {
                        "" | "vcenter" => SdkEndpoint::VCenter,
                        "esxi" => SdkEndpoint::Esxi,
                        other => return Err(invalid_value(key, other)),
                    }
                }
                "vddkBufSize" => settings.vddk_buf_size = Some(parse_u32(key, value)?),
                "vddkBufCount" => settings.vddk_buf_count = Some(parse_u32(key, value)?),
                "token" => settings.token = non_empty(value),
                "domainName" => settings.domain_name = non_empty(value),
                "projectName" => settings.project_name = non_empty(value),
                "regionName" => settings.region_name = non_empty(value),
                unknown => {
                    return Err(Error::validation_for_field(
                        "provider",
                        format!("settings.{unknown}"),
                        Reason::UnknownProviderSetting,
                        format!("unknown provider setting '{unknown}'"),
                    ))
                }
            }
        }
        Ok(settings)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value.to_lowercase().as_str() {
        "" | "false" => Ok(false),
        "true" => Ok(true),
        other => Err(invalid_value(key, other)),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, Error> {
    value.parse().map_err(|_| invalid_value(key, value))
}

fn invalid_value(key: &str, value: &str) -> Error {
    Error::validation_for_field(
        "provider",
        format!("settings.{key}"),
        Reason::ProviderSettingNotValid,
        format!("invalid value '{value}' for setting '{key}'"),
    )
}

// =============================================================================
// Phase
// =============================================================================

/// Observed phase of a Provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ProviderPhase {
    /// Not yet validated
    #[default]
    Staging,
    /// Settings were rejected
    ValidationFailed,
    /// The provider could not be reached
    ConnectionFailed,
    /// Healthy
    Ready,
}

impl std::fmt::Display for ProviderPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Staging => write!(f, "Staging"),
            Self::ValidationFailed => write!(f, "ValidationFailed"),
            Self::ConnectionFailed => write!(f, "ConnectionFailed"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

// =============================================================================
// CRD
// =============================================================================

/// A source or destination virtualization provider
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Provider",
    plural = "providers",
    namespaced,
    status = "ProviderStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Provider type
    #[serde(rename = "type")]
    pub type_: ProviderType,

    /// API endpoint; empty for the local cluster
    #[serde(default)]
    pub url: String,

    /// Credentials secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<ObjectRef>,

    /// Provider options (see [`ProviderSettings::KEYS`])
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
}

/// Provider status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    /// The generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Observed phase
    #[serde(default)]
    pub phase: ProviderPhase,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Provider {
    /// Whether the controller has validated this provider and found it healthy
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.phase == ProviderPhase::Ready
                && s.observed_generation == self.metadata.generation
                && super::types::is_condition_true(&s.conditions, crate::conditions::READY)
        })
    }

    /// Whether this is the local cluster
    pub fn is_host(&self) -> bool {
        self.spec.type_ == ProviderType::OpenShift && self.spec.url.is_empty()
    }
}

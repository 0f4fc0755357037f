//! Hook CRD types

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Step a hook runs at
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum HookStep {
    /// Before the source VM is touched
    PreHook,
    /// After the target VM is created
    PostHook,
}

impl std::fmt::Display for HookStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreHook => write!(f, "PreHook"),
            Self::PostHook => write!(f, "PostHook"),
        }
    }
}

impl std::str::FromStr for HookStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PreHook" => Ok(Self::PreHook),
            "PostHook" => Ok(Self::PostHook),
            _ => Err(format!("unknown hook step: {s}")),
        }
    }
}

/// A user-supplied container run at a VM's pre or post hook step
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Hook",
    plural = "hooks",
    namespaced,
    status = "HookStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HookSpec {
    /// Container image
    pub image: String,

    /// Base64-encoded Ansible playbook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook: Option<String>,

    /// Deadline in seconds for the hook job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,

    /// Service account the hook job runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
}

/// Hook status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookStatus {
    /// The generation last processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_steps_parse() {
        assert_eq!("PreHook".parse::<HookStep>().unwrap(), HookStep::PreHook);
        assert_eq!("PostHook".parse::<HookStep>().unwrap(), HookStep::PostHook);
        assert!("MidHook".parse::<HookStep>().is_err());
    }
}

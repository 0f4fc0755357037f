//! Hook jobs
//!
//! A hook runs once per VM per step as a Job. Its ConfigMap carries the
//! decoded playbook, the inventory description of the VM, and the plan spec,
//! mounted at `/tmp/hook`.

use std::collections::BTreeMap;

use base64::Engine;
use forklift_common::crd::{HookSpec, HookStep, PlanSpec};
use forklift_common::{Reason, HOOK_STEP_LABEL};
use forklift_inventory::Vm;
use forklift_populator::dns_name;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::error::PlanError;
use crate::target::JobState;

const MOUNT_PATH: &str = "/tmp/hook";

/// Name shared by a hook's Job and ConfigMap
pub fn hook_name(migration: &str, vm: &str, step: HookStep) -> String {
    dns_name(&format!("hook-{migration}-{vm}-{step}"))
}

/// Decode a base64 playbook
pub fn decode_playbook(encoded: &str) -> Result<String, PlanError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| PlanError::permanent(Reason::HookNotValid, format!("playbook: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| PlanError::permanent(Reason::HookNotValid, format!("playbook: {e}")))
}

/// Inputs for one hook run
pub struct HookRequest<'a> {
    /// Job and ConfigMap name
    pub name: String,
    /// Namespace the job runs in
    pub namespace: &'a str,
    /// Step the hook is bound to
    pub step: HookStep,
    /// Hook definition
    pub hook: &'a HookSpec,
    /// Image used when the hook does not name one
    pub default_image: &'a str,
    /// Description of the VM being migrated
    pub vm: &'a Vm,
    /// Plan the VM belongs to
    pub plan: &'a PlanSpec,
    /// Owner labels
    pub labels: BTreeMap<String, String>,
}

impl HookRequest<'_> {
    fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(HOOK_STEP_LABEL.to_string(), self.step.to_string());
        labels
    }

    fn meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.to_string()),
            labels: Some(self.labels()),
            ..Default::default()
        }
    }
}

/// ConfigMap with the hook inputs
pub fn config_map(request: &HookRequest<'_>) -> Result<ConfigMap, PlanError> {
    let mut data = BTreeMap::new();
    data.insert("workload.yml".to_string(), yaml(request.vm)?);
    data.insert("plan.yml".to_string(), yaml(request.plan)?);
    if let Some(playbook) = request.hook.playbook.as_deref() {
        data.insert("playbook.yml".to_string(), decode_playbook(playbook)?);
    }
    Ok(ConfigMap {
        metadata: request.meta(),
        data: Some(data),
        ..Default::default()
    })
}

fn yaml<T: serde::Serialize>(value: &T) -> Result<String, PlanError> {
    serde_yaml::to_string(value).map_err(|e| {
        PlanError::Common(forklift_common::Error::serialization(format!("hook input: {e}")))
    })
}

/// Job running the hook; `retry` bounds pod restarts
pub fn job(request: &HookRequest<'_>, retry: u32) -> Job {
    let image = if request.hook.image.is_empty() {
        request.default_image.to_string()
    } else {
        request.hook.image.clone()
    };
    let command = request.hook.playbook.as_ref().map(|_| {
        [
            "/bin/entrypoint",
            "ansible-runner",
            "run",
            "/tmp/runner",
            "-p",
            "/tmp/hook/playbook.yml",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    });
    let pod = PodSpec {
        restart_policy: Some("Never".to_string()),
        service_account_name: request.hook.service_account.clone(),
        active_deadline_seconds: request.hook.deadline.filter(|d| *d > 0),
        containers: vec![Container {
            name: "hook".to_string(),
            image: Some(image),
            command,
            volume_mounts: Some(vec![VolumeMount {
                name: "hook".to_string(),
                mount_path: MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }],
        volumes: Some(vec![Volume {
            name: "hook".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: request.name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };
    Job {
        metadata: request.meta(),
        spec: Some(JobSpec {
            backoff_limit: Some(i32::try_from(retry).unwrap_or(i32::MAX)),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(request.labels()),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Outcome of a hook job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookOutcome {
    /// Still running or retrying
    Running,
    /// Done
    Succeeded,
    /// Gave up
    Failed(String),
}

/// Judge a hook job against the retry budget
pub fn outcome(state: &JobState, retry: u32) -> HookOutcome {
    match state {
        JobState::Succeeded => HookOutcome::Succeeded,
        JobState::Failed {
            message, deadline, ..
        } => {
            if *deadline {
                HookOutcome::Failed(format!("deadline exceeded: {message}"))
            } else {
                HookOutcome::Failed(message.clone())
            }
        }
        JobState::Running { failures } if *failures > retry => {
            HookOutcome::Failed("Retry limit exceeded.".to_string())
        }
        JobState::Running { .. } => HookOutcome::Running,
    }
}

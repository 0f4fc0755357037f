//! Destination cluster seam
//!
//! Everything the executor creates on the destination cluster goes through
//! [`TargetCluster`]: volumes, the target VM, conversion and hook workers,
//! and the copied provider secret. Creation is idempotent: creating an
//! object that already exists succeeds and leaves it untouched.

use std::time::Duration;

use async_trait::async_trait;
use forklift_common::crd::HelperKind;
use forklift_populator::METRICS_PORT;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, instrument};

use crate::error::PlanError;
use crate::kubevirt::{data_volume_resource, virtual_machine_resource};

/// Kinds of objects the executor manages on the destination
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// kubevirt.io VirtualMachine
    VirtualMachine,
    /// cdi.kubevirt.io DataVolume
    DataVolume,
    /// core/v1 PersistentVolumeClaim
    PersistentVolumeClaim,
    /// core/v1 Pod
    Pod,
    /// batch/v1 Job
    Job,
    /// core/v1 ConfigMap
    ConfigMap,
    /// core/v1 Secret
    Secret,
}

impl ObjectKind {
    /// Destination kind backing a helper; snapshots live on the source
    pub fn of_helper(kind: HelperKind) -> Option<Self> {
        match kind {
            HelperKind::VirtualMachine => Some(Self::VirtualMachine),
            HelperKind::DataVolume => Some(Self::DataVolume),
            HelperKind::PersistentVolumeClaim => Some(Self::PersistentVolumeClaim),
            HelperKind::PopulatorWorker
            | HelperKind::ConversionPod
            | HelperKind::ImageConverter => Some(Self::Pod),
            HelperKind::HookJob => Some(Self::Job),
            HelperKind::HookConfigMap => Some(Self::ConfigMap),
            HelperKind::Snapshot => None,
        }
    }
}

/// An object to create on the destination
#[derive(Clone, Debug)]
pub enum TargetObject {
    /// DataVolume manifest
    DataVolume(DynamicObject),
    /// VirtualMachine manifest
    VirtualMachine(DynamicObject),
    /// Worker pod
    Pod(Pod),
    /// Hook job
    Job(Job),
    /// Hook playbook
    ConfigMap(ConfigMap),
    /// Copied provider credentials
    Secret(Secret),
}

impl TargetObject {
    /// Kind
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::DataVolume(_) => ObjectKind::DataVolume,
            Self::VirtualMachine(_) => ObjectKind::VirtualMachine,
            Self::Pod(_) => ObjectKind::Pod,
            Self::Job(_) => ObjectKind::Job,
            Self::ConfigMap(_) => ObjectKind::ConfigMap,
            Self::Secret(_) => ObjectKind::Secret,
        }
    }

    /// Object name
    pub fn name(&self) -> String {
        match self {
            Self::DataVolume(o) | Self::VirtualMachine(o) => o.name_any(),
            Self::Pod(o) => o.name_any(),
            Self::Job(o) => o.name_any(),
            Self::ConfigMap(o) => o.name_any(),
            Self::Secret(o) => o.name_any(),
        }
    }

    /// Object namespace
    pub fn namespace(&self) -> String {
        let ns = match self {
            Self::DataVolume(o) | Self::VirtualMachine(o) => o.namespace(),
            Self::Pod(o) => o.namespace(),
            Self::Job(o) => o.namespace(),
            Self::ConfigMap(o) => o.namespace(),
            Self::Secret(o) => o.namespace(),
        };
        ns.unwrap_or_default()
    }
}

/// Observed state of a one-shot pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodState {
    /// Scheduled, not running
    Pending,
    /// Running
    Running,
    /// Exited zero
    Succeeded,
    /// Exited non-zero
    Failed {
        /// Exit code of the first container, when known
        exit_code: Option<i32>,
        /// Termination message or reason
        message: String,
    },
}

/// Observed state of a hook job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Active or waiting for a retry
    Running {
        /// Failed pods so far
        failures: u32,
    },
    /// Completed
    Succeeded,
    /// The job controller gave up
    Failed {
        /// Failed pods
        failures: u32,
        /// Condition message
        message: String,
        /// The active deadline was exceeded
        deadline: bool,
    },
}

/// Operations on the destination cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetCluster: Send + Sync {
    /// Create an object unless it exists
    async fn create(&self, object: &TargetObject) -> Result<(), PlanError>;

    /// Whether an object exists
    async fn exists(&self, kind: ObjectKind, namespace: &str, name: &str)
        -> Result<bool, PlanError>;

    /// Delete an object; deleting a missing object succeeds
    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str)
        -> Result<(), PlanError>;

    /// State of a pod, `None` when absent
    async fn pod_state(&self, namespace: &str, name: &str) -> Result<Option<PodState>, PlanError>;

    /// Prometheus text served by a pod, `None` when it cannot be scraped yet
    async fn pod_metrics(&self, namespace: &str, name: &str)
        -> Result<Option<String>, PlanError>;

    /// State of a job, `None` when absent
    async fn job_state(&self, namespace: &str, name: &str) -> Result<Option<JobState>, PlanError>;
}

/// Destination cluster over the Kubernetes API
pub struct KubeTargetCluster {
    client: Client,
    http: reqwest::Client,
}

impl KubeTargetCluster {
    /// Create a target using the given client
    pub fn new(client: Client) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, http }
    }

    fn dynamic(&self, kind: ObjectKind, namespace: &str) -> Option<Api<DynamicObject>> {
        let resource = match kind {
            ObjectKind::DataVolume => data_volume_resource(),
            ObjectKind::VirtualMachine => virtual_machine_resource(),
            _ => return None,
        };
        Some(Api::namespaced_with(self.client.clone(), namespace, &resource))
    }

    async fn pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, PlanError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

fn created<K>(result: Result<K, kube::Error>) -> Result<(), PlanError> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn deleted<K>(result: Result<K, kube::Error>) -> Result<(), PlanError> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Pod state from its status
pub fn pod_state(pod: &Pod) -> PodState {
    let status = pod.status.as_ref();
    match status.and_then(|s| s.phase.as_deref()) {
        Some("Running") => PodState::Running,
        Some("Succeeded") => PodState::Succeeded,
        Some("Failed") => {
            let terminated = status
                .and_then(|s| s.container_statuses.as_ref())
                .and_then(|c| c.first())
                .and_then(|c| c.state.as_ref())
                .and_then(|s| s.terminated.as_ref());
            let message = terminated
                .and_then(|t| t.message.clone().or_else(|| t.reason.clone()))
                .or_else(|| status.and_then(|s| s.message.clone()))
                .unwrap_or_else(|| "pod failed".to_string());
            PodState::Failed {
                exit_code: terminated.map(|t| t.exit_code),
                message,
            }
        }
        _ => PodState::Pending,
    }
}

/// Job state from its status
pub fn job_state(job: &Job) -> JobState {
    let status = job.status.as_ref();
    let failures = status
        .and_then(|s| s.failed)
        .and_then(|f| u32::try_from(f).ok())
        .unwrap_or(0);
    if status.and_then(|s| s.succeeded).unwrap_or(0) > 0 {
        return JobState::Succeeded;
    }
    let failed = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Failed" && c.status == "True"));
    match failed {
        Some(condition) => JobState::Failed {
            failures,
            message: condition
                .message
                .clone()
                .unwrap_or_else(|| "job failed".to_string()),
            deadline: condition.reason.as_deref() == Some("DeadlineExceeded"),
        },
        None => JobState::Running { failures },
    }
}

#[async_trait]
impl TargetCluster for KubeTargetCluster {
    #[instrument(skip(self, object), fields(kind = ?object.kind(), name = %object.name()))]
    async fn create(&self, object: &TargetObject) -> Result<(), PlanError> {
        let ns = object.namespace();
        let pp = PostParams::default();
        let client = self.client.clone();
        match object {
            TargetObject::DataVolume(o) | TargetObject::VirtualMachine(o) => {
                let api = self.dynamic(object.kind(), &ns).ok_or_else(|| {
                    PlanError::permanent(forklift_common::Reason::Internal, "not a dynamic kind")
                })?;
                created(api.create(&pp, o).await)?;
            }
            TargetObject::Pod(o) => {
                created(Api::<Pod>::namespaced(client, &ns).create(&pp, o).await)?
            }
            TargetObject::Job(o) => {
                created(Api::<Job>::namespaced(client, &ns).create(&pp, o).await)?
            }
            TargetObject::ConfigMap(o) => {
                created(Api::<ConfigMap>::namespaced(client, &ns).create(&pp, o).await)?
            }
            TargetObject::Secret(o) => {
                created(Api::<Secret>::namespaced(client, &ns).create(&pp, o).await)?
            }
        }
        debug!("ensured target object");
        Ok(())
    }

    async fn exists(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, PlanError> {
        let client = self.client.clone();
        let found = match kind {
            ObjectKind::DataVolume | ObjectKind::VirtualMachine => {
                match self.dynamic(kind, namespace) {
                    Some(api) => api.get_opt(name).await?.is_some(),
                    None => false,
                }
            }
            ObjectKind::PersistentVolumeClaim => {
                Api::<PersistentVolumeClaim>::namespaced(client, namespace)
                    .get_opt(name)
                    .await?
                    .is_some()
            }
            ObjectKind::Pod => Api::<Pod>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .is_some(),
            ObjectKind::Job => Api::<Job>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .is_some(),
            ObjectKind::ConfigMap => Api::<ConfigMap>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .is_some(),
            ObjectKind::Secret => Api::<Secret>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .is_some(),
        };
        Ok(found)
    }

    #[instrument(skip(self))]
    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<(), PlanError> {
        let dp = DeleteParams::background();
        let client = self.client.clone();
        match kind {
            ObjectKind::DataVolume | ObjectKind::VirtualMachine => {
                if let Some(api) = self.dynamic(kind, namespace) {
                    deleted(api.delete(name, &dp).await)?;
                }
            }
            ObjectKind::PersistentVolumeClaim => deleted(
                Api::<PersistentVolumeClaim>::namespaced(client, namespace)
                    .delete(name, &dp)
                    .await,
            )?,
            ObjectKind::Pod => {
                deleted(Api::<Pod>::namespaced(client, namespace).delete(name, &dp).await)?
            }
            ObjectKind::Job => {
                deleted(Api::<Job>::namespaced(client, namespace).delete(name, &dp).await)?
            }
            ObjectKind::ConfigMap => {
                deleted(Api::<ConfigMap>::namespaced(client, namespace).delete(name, &dp).await)?
            }
            ObjectKind::Secret => {
                deleted(Api::<Secret>::namespaced(client, namespace).delete(name, &dp).await)?
            }
        }
        Ok(())
    }

    async fn pod_state(&self, namespace: &str, name: &str) -> Result<Option<PodState>, PlanError> {
        Ok(self.pod(namespace, name).await?.as_ref().map(pod_state))
    }

    async fn pod_metrics(&self, namespace: &str, name: &str) -> Result<Option<String>, PlanError> {
        let Some(ip) = self
            .pod(namespace, name)
            .await?
            .and_then(|p| p.status.and_then(|s| s.pod_ip))
        else {
            return Ok(None);
        };
        let url = format!("http://{ip}:{METRICS_PORT}/metrics");
        let response = match self.http.get(&url).send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => response,
            Err(e) => {
                debug!(pod = %name, error = %e, "metrics not served yet");
                return Ok(None);
            }
        };
        match response.text().await {
            Ok(text) => Ok(Some(text)),
            Err(e) => {
                debug!(pod = %name, error = %e, "metrics body unreadable");
                Ok(None)
            }
        }
    }

    async fn job_state(&self, namespace: &str, name: &str) -> Result<Option<JobState>, PlanError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.as_ref().map(job_state))
    }
}

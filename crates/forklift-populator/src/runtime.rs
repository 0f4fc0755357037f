//! Worker runtime seam and its core/v1 Pod implementation

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, SecretVolumeSource,
    Volume, VolumeDevice, VolumeMount,
};
use kube::api::{Api, DeleteParams, ListParams, LogParams, ObjectMeta, PostParams};
use kube::Client;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use crate::error::PopulatorError;
use crate::worker::{Worker, WorkerPhase, WorkerSpec, SECRET_PATH, VOLUME_PATH};

/// Port workers expose metrics on
pub const METRICS_PORT: u16 = 2112;

/// Where populator workers run
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Workers matching a label selector
    async fn list(&self, namespace: &str, selector: &str) -> Result<Vec<Worker>, PopulatorError>;

    /// Start a worker
    async fn create(&self, spec: &WorkerSpec) -> Result<Worker, PopulatorError>;

    /// Delete a worker; deleting a missing worker succeeds
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), PopulatorError>;

    /// Tail of the worker's output
    async fn logs(&self, namespace: &str, name: &str, tail: i64) -> Result<String, PopulatorError>;

    /// Prometheus text from the worker's metrics endpoint
    async fn metrics(&self, worker: &Worker) -> Result<String, PopulatorError>;
}

/// Workers as Pods
pub struct KubeWorkerRuntime {
    client: Client,
    http: reqwest::Client,
}

impl KubeWorkerRuntime {
    /// Create a runtime using the given client
    pub fn new(client: Client) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, http }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Pod manifest for a worker
pub fn build_pod(spec: &WorkerSpec) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(spec.labels.clone()),
            annotations: Some(spec.annotations.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("OnFailure".to_string()),
            containers: vec![Container {
                name: "populate".to_string(),
                image: Some(spec.image.clone()),
                args: Some(spec.args.clone()),
                volume_mounts: Some(vec![VolumeMount {
                    name: "secret".to_string(),
                    mount_path: SECRET_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                volume_devices: Some(vec![VolumeDevice {
                    name: "target".to_string(),
                    device_path: VOLUME_PATH.to_string(),
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![
                Volume {
                    name: "secret".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(spec.secret.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "target".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: spec.claim.clone(),
                        read_only: Some(false),
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Observed worker from a Pod
pub fn worker_from_pod(pod: &Pod) -> Worker {
    let status = pod.status.as_ref();
    let container = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|c| c.first());
    let message = container.and_then(|c| {
        let terminated = c
            .state
            .as_ref()
            .and_then(|s| s.terminated.as_ref())
            .or_else(|| c.last_state.as_ref().and_then(|s| s.terminated.as_ref()))?;
        terminated
            .message
            .clone()
            .or_else(|| terminated.reason.clone())
            .or_else(|| Some(format!("exit code {}", terminated.exit_code)))
    });
    Worker {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        phase: WorkerPhase::from_pod_phase(status.and_then(|s| s.phase.as_deref())),
        restarts: container
            .map(|c| u32::try_from(c.restart_count).unwrap_or(0))
            .unwrap_or(0),
        created: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
        message,
        ip: status.and_then(|s| s.pod_ip.clone()),
    }
}

#[async_trait]
impl WorkerRuntime for KubeWorkerRuntime {
    async fn list(&self, namespace: &str, selector: &str) -> Result<Vec<Worker>, PopulatorError> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(pods.items.iter().map(worker_from_pod).collect())
    }

    #[instrument(skip(self, spec), fields(worker = %spec.name))]
    async fn create(&self, spec: &WorkerSpec) -> Result<Worker, PopulatorError> {
        let pod = self
            .pods(&spec.namespace)
            .create(&PostParams::default(), &build_pod(spec))
            .await?;
        debug!(kind = %spec.kind, "created populator worker");
        Ok(worker_from_pod(&pod))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), PopulatorError> {
        match self
            .pods(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(worker = %name, "worker already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn logs(&self, namespace: &str, name: &str, tail: i64) -> Result<String, PopulatorError> {
        let params = LogParams {
            tail_lines: Some(tail),
            ..Default::default()
        };
        Ok(self.pods(namespace).logs(name, &params).await?)
    }

    async fn metrics(&self, worker: &Worker) -> Result<String, PopulatorError> {
        let scrape = |message: String| PopulatorError::Scrape {
            worker: worker.name.clone(),
            message,
        };
        let ip = worker
            .ip
            .as_deref()
            .ok_or_else(|| scrape("no pod address yet".to_string()))?;
        let response = self
            .http
            .get(format!("http://{ip}:{METRICS_PORT}/metrics"))
            .send()
            .await
            .map_err(|e| scrape(e.to_string()))?
            .error_for_status()
            .map_err(|e| scrape(e.to_string()))?;
        response.text().await.map_err(|e| scrape(e.to_string()))
    }
}

//! Populator coordinator
//!
//! At most one worker exists per (migration, vm, disk). `ensure` adopts a
//! worker left by a previous controller run instead of creating a second
//! one, and prunes duplicates keeping the oldest. Progress is smoothed to a
//! high-water mark so observers never see a transfer move backwards.

use std::sync::Arc;

use dashmap::DashMap;
use forklift_common::metrics;
use tracing::{debug, info, instrument, warn};

use crate::error::PopulatorError;
use crate::progress::{disk_transfers, last_json_progress};
use crate::runtime::WorkerRuntime;
use crate::worker::{scope_selector, DiskKey, Worker, WorkerPhase, WorkerSpec};

const LOG_TAIL: i64 = 20;

/// Result of [`Coordinator::ensure`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ensured {
    /// A worker already existed
    Adopted(Worker),
    /// A new worker was started
    Created(Worker),
}

impl Ensured {
    /// The worker either way
    pub fn worker(&self) -> &Worker {
        match self {
            Self::Adopted(w) | Self::Created(w) => w,
        }
    }
}

/// Phase of a disk transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferPhase {
    /// Worker not yet running
    Pending,
    /// Copying
    Running,
    /// Worker exited zero
    Completed,
    /// Worker failed
    Failed {
        /// Termination message
        message: String,
        /// Restart budget exhausted
        permanent: bool,
    },
}

/// Progress of one disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskTransfer {
    /// Phase
    pub phase: TransferPhase,
    /// Bytes copied (high-water mark)
    pub transferred: u64,
    /// Disk size in bytes
    pub total: u64,
    /// Percent complete, 0..=100
    pub percent: u32,
    /// Worker name
    pub worker: String,
}

/// Coordinates populator workers for every migration in the process
pub struct Coordinator {
    runtime: Arc<dyn WorkerRuntime>,
    importer_retry: u32,
    high_water: DashMap<DiskKey, u64>,
}

impl Coordinator {
    /// Create a coordinator; `importer_retry` bounds worker restarts
    pub fn new(runtime: Arc<dyn WorkerRuntime>, importer_retry: u32) -> Self {
        Self {
            runtime,
            importer_retry,
            high_water: DashMap::new(),
        }
    }

    /// Start the worker for `spec.key` unless one exists
    #[instrument(skip(self, spec), fields(disk = %spec.key))]
    pub async fn ensure(&self, spec: &WorkerSpec) -> Result<Ensured, PopulatorError> {
        if let Some(existing) = self.adopt(&spec.namespace, &spec.key).await? {
            info!(worker = %existing.name, "adopted existing populator worker");
            metrics::record_worker_adopted(spec.kind.as_str());
            return Ok(Ensured::Adopted(existing));
        }
        match self.runtime.create(spec).await {
            Ok(worker) => Ok(Ensured::Created(worker)),
            // Lost a race with another create for the same name
            Err(PopulatorError::Kube(kube::Error::Api(ae))) if ae.code == 409 => {
                let worker = self
                    .adopt(&spec.namespace, &spec.key)
                    .await?
                    .ok_or_else(|| PopulatorError::WorkerMissing {
                        name: spec.name.clone(),
                    })?;
                metrics::record_worker_adopted(spec.kind.as_str());
                Ok(Ensured::Adopted(worker))
            }
            Err(e) => Err(e),
        }
    }

    /// The oldest worker for `key`, deleting any younger duplicates
    async fn adopt(
        &self,
        namespace: &str,
        key: &DiskKey,
    ) -> Result<Option<Worker>, PopulatorError> {
        let mut workers = self.runtime.list(namespace, &key.selector()).await?;
        if workers.is_empty() {
            return Ok(None);
        }
        workers.sort_by(|a, b| match (a.created, b.created) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.name.cmp(&b.name)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.name.cmp(&b.name),
        });
        let mut workers = workers.into_iter();
        let keep = workers.next();
        for duplicate in workers {
            warn!(worker = %duplicate.name, "pruning duplicate populator worker");
            self.runtime.delete(namespace, &duplicate.name).await?;
        }
        Ok(keep)
    }

    /// Current progress of the worker for `key`
    ///
    /// `total` is the disk capacity used when the worker does not report
    /// a size.
    #[instrument(skip(self), fields(disk = %key))]
    pub async fn poll(
        &self,
        namespace: &str,
        key: &DiskKey,
        total: u64,
    ) -> Result<DiskTransfer, PopulatorError> {
        let worker = self
            .adopt(namespace, key)
            .await?
            .ok_or_else(|| PopulatorError::WorkerMissing {
                name: key.worker_name(),
            })?;

        let previous = self.high_water.get(key).map(|v| *v).unwrap_or(0);
        let (reported, total) = match self.reported(&worker, key).await {
            Reported::Bytes { transferred, size } => {
                (Some(transferred), size.filter(|s| *s > 0).unwrap_or(total))
            }
            Reported::Percent(percent) => {
                let bytes = (total as f64 * percent.clamp(0.0, 100.0) / 100.0).round() as u64;
                (Some(bytes), total)
            }
            Reported::Nothing => (None, total),
        };

        let phase = match worker.phase {
            WorkerPhase::Succeeded => TransferPhase::Completed,
            WorkerPhase::Failed if reported.unwrap_or(previous) <= previous => {
                TransferPhase::Failed {
                    message: worker.message.clone().unwrap_or_else(|| "worker failed".into()),
                    permanent: worker.restarts >= self.importer_retry,
                }
            }
            _ if worker.restarts > self.importer_retry => TransferPhase::Failed {
                message: format!(
                    "worker restarted {} times: {}",
                    worker.restarts,
                    worker.message.as_deref().unwrap_or("no message")
                ),
                permanent: true,
            },
            WorkerPhase::Pending | WorkerPhase::Unknown => TransferPhase::Pending,
            WorkerPhase::Running | WorkerPhase::Failed => TransferPhase::Running,
        };

        let mut transferred = previous.max(reported.unwrap_or(0));
        if phase == TransferPhase::Completed {
            transferred = transferred.max(total);
        }
        self.high_water.insert(key.clone(), transferred);
        metrics::record_disk_progress(&key.migration, &key.vm, &key.disk, transferred);

        let percent = if total == 0 {
            if phase == TransferPhase::Completed { 100 } else { 0 }
        } else {
            ((transferred.min(total) as u128 * 100) / total as u128) as u32
        };
        debug!(worker = %worker.name, transferred, total, percent, "populator progress");

        Ok(DiskTransfer {
            phase,
            transferred,
            total,
            percent,
            worker: worker.name,
        })
    }

    /// Progress reported by a worker
    ///
    /// Structured log lines win; the metrics gauge is only consulted when
    /// the log carries nothing.
    async fn reported(&self, worker: &Worker, key: &DiskKey) -> Reported {
        match self.runtime.logs(&worker.namespace, &worker.name, LOG_TAIL).await {
            Ok(log) => {
                if let Some(line) = last_json_progress(&log) {
                    return Reported::Bytes {
                        transferred: line.transferred,
                        size: line.size,
                    };
                }
            }
            Err(e) => debug!(worker = %worker.name, error = %e, "worker logs unavailable"),
        }
        if worker.phase != WorkerPhase::Running {
            return Reported::Nothing;
        }
        match self.runtime.metrics(worker).await {
            Ok(text) => {
                let transfers = disk_transfers(&text);
                let value = match transfers.get(&key.disk) {
                    Some(v) => Some(*v),
                    None if transfers.len() == 1 => transfers.values().next().copied(),
                    None => None,
                };
                value.map_or(Reported::Nothing, Reported::Percent)
            }
            Err(e) => {
                debug!(worker = %worker.name, error = %e, "worker metrics unavailable");
                Reported::Nothing
            }
        }
    }

    /// Delete every worker of a migration, or of one VM in it
    #[instrument(skip(self))]
    pub async fn reap(
        &self,
        namespace: &str,
        migration: &str,
        vm: Option<&str>,
    ) -> Result<usize, PopulatorError> {
        let workers = self
            .runtime
            .list(namespace, &scope_selector(migration, vm))
            .await?;
        for worker in &workers {
            self.runtime.delete(namespace, &worker.name).await?;
        }
        self.high_water
            .retain(|k, _| !(k.migration == migration && vm.map_or(true, |vm| k.vm == vm)));
        if !workers.is_empty() {
            info!(count = workers.len(), "reaped populator workers");
        }
        Ok(workers.len())
    }

    /// Delete the worker for one disk and forget its progress
    ///
    /// Used between warm precopy rounds and after a retryable failure so
    /// the next `ensure` starts a fresh worker for the same triple.
    pub async fn retire(&self, namespace: &str, key: &DiskKey) -> Result<(), PopulatorError> {
        for worker in self.runtime.list(namespace, &key.selector()).await? {
            self.runtime.delete(namespace, &worker.name).await?;
        }
        self.reset(key);
        Ok(())
    }

    /// Forget smoothing state for a key (after a worker is recreated)
    pub fn reset(&self, key: &DiskKey) {
        self.high_water.remove(key);
    }
}

enum Reported {
    Bytes { transferred: u64, size: Option<u64> },
    Percent(f64),
    Nothing,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockWorkerRuntime;
    use crate::worker::WorkerKind;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn key() -> DiskKey {
        DiskKey::new("mig-1", "vm-1", "disk-1")
    }

    fn spec() -> WorkerSpec {
        let key = key();
        WorkerSpec {
            name: key.worker_name(),
            labels: key.labels(),
            key,
            namespace: "target".into(),
            kind: WorkerKind::OvirtImageTransfer,
            image: "populator".into(),
            annotations: BTreeMap::new(),
            args: vec![],
            secret: "creds".into(),
            claim: "pvc".into(),
        }
    }

    fn worker(name: &str, minute: u32, phase: WorkerPhase) -> Worker {
        Worker {
            name: name.into(),
            namespace: "target".into(),
            phase,
            created: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, minute, 0).unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn story_restart_adopts_instead_of_duplicating() {
        let mut runtime = MockWorkerRuntime::new();
        runtime
            .expect_list()
            .returning(|_, _| {
                Ok(vec![worker("populate-mig-1-vm-1-disk-1", 0, WorkerPhase::Running)])
            });
        runtime.expect_create().never();
        let coordinator = Coordinator::new(Arc::new(runtime), 3);

        let ensured = coordinator.ensure(&spec()).await.unwrap();
        assert!(matches!(ensured, Ensured::Adopted(_)));
    }

    #[tokio::test]
    async fn missing_worker_is_created() {
        let mut runtime = MockWorkerRuntime::new();
        runtime.expect_list().returning(|_, _| Ok(vec![]));
        runtime
            .expect_create()
            .times(1)
            .returning(|s| Ok(worker(&s.name, 0, WorkerPhase::Pending)));
        let coordinator = Coordinator::new(Arc::new(runtime), 3);

        let ensured = coordinator.ensure(&spec()).await.unwrap();
        assert!(matches!(ensured, Ensured::Created(_)));
    }

    #[tokio::test]
    async fn duplicates_are_pruned_keeping_the_oldest() {
        let mut runtime = MockWorkerRuntime::new();
        runtime.expect_list().returning(|_, _| {
            Ok(vec![
                worker("young", 5, WorkerPhase::Running),
                worker("old", 1, WorkerPhase::Running),
            ])
        });
        runtime
            .expect_delete()
            .withf(|_, name| name == "young")
            .times(1)
            .returning(|_, _| Ok(()));
        let coordinator = Coordinator::new(Arc::new(runtime), 3);

        let ensured = coordinator.ensure(&spec()).await.unwrap();
        assert_eq!(ensured.worker().name, "old");
    }

    #[tokio::test]
    async fn progress_never_moves_backwards() {
        let mut runtime = MockWorkerRuntime::new();
        runtime
            .expect_list()
            .returning(|_, _| Ok(vec![worker("w", 0, WorkerPhase::Running)]));
        let mut reports = vec![r#"{"transferred": 300}"#, r#"{"transferred": 200}"#].into_iter();
        runtime
            .expect_logs()
            .times(2)
            .returning(move |_, _, _| Ok(reports.next().unwrap_or_default().to_string()));
        let coordinator = Coordinator::new(Arc::new(runtime), 3);

        let first = coordinator.poll("target", &key(), 1000).await.unwrap();
        let second = coordinator.poll("target", &key(), 1000).await.unwrap();
        assert_eq!(first.transferred, 300);
        assert_eq!(second.transferred, 300);
        assert_eq!(second.percent, 30);
    }

    #[tokio::test]
    async fn failed_worker_without_progress_is_a_transfer_failure() {
        let mut runtime = MockWorkerRuntime::new();
        runtime.expect_list().returning(|_, _| {
            let mut w = worker("w", 0, WorkerPhase::Failed);
            w.message = Some("imageio: 403".into());
            w.restarts = 1;
            Ok(vec![w])
        });
        runtime.expect_logs().returning(|_, _, _| Ok(String::new()));
        let coordinator = Coordinator::new(Arc::new(runtime), 3);

        let transfer = coordinator.poll("target", &key(), 1000).await.unwrap();
        assert_eq!(
            transfer.phase,
            TransferPhase::Failed {
                message: "imageio: 403".into(),
                permanent: false
            }
        );
    }

    #[tokio::test]
    async fn crash_looping_worker_is_permanent() {
        let mut runtime = MockWorkerRuntime::new();
        runtime.expect_list().returning(|_, _| {
            let mut w = worker("w", 0, WorkerPhase::Running);
            w.restarts = 4;
            Ok(vec![w])
        });
        runtime
            .expect_logs()
            .returning(|_, _, _| Ok(r#"{"transferred": 10}"#.to_string()));
        let coordinator = Coordinator::new(Arc::new(runtime), 3);

        let transfer = coordinator.poll("target", &key(), 1000).await.unwrap();
        assert!(matches!(transfer.phase, TransferPhase::Failed { permanent: true, .. }));
    }

    #[tokio::test]
    async fn succeeded_worker_reports_full_disk() {
        let mut runtime = MockWorkerRuntime::new();
        runtime
            .expect_list()
            .returning(|_, _| Ok(vec![worker("w", 0, WorkerPhase::Succeeded)]));
        runtime.expect_logs().returning(|_, _, _| Ok(String::new()));
        let coordinator = Coordinator::new(Arc::new(runtime), 3);

        let transfer = coordinator.poll("target", &key(), 4096).await.unwrap();
        assert_eq!(transfer.phase, TransferPhase::Completed);
        assert_eq!(transfer.transferred, 4096);
        assert_eq!(transfer.percent, 100);
    }

    #[tokio::test]
    async fn gauge_is_used_when_logs_are_silent() {
        let mut runtime = MockWorkerRuntime::new();
        runtime
            .expect_list()
            .returning(|_, _| Ok(vec![worker("w", 0, WorkerPhase::Running)]));
        runtime.expect_logs().returning(|_, _, _| Ok("starting\n".into()));
        runtime
            .expect_metrics()
            .returning(|_| Ok("v2v_disk_transfers{disk_id=\"disk-1\"} 25\n".into()));
        let coordinator = Coordinator::new(Arc::new(runtime), 3);

        let transfer = coordinator.poll("target", &key(), 1 << 30).await.unwrap();
        assert_eq!(transfer.percent, 25);
        assert_eq!(transfer.transferred, 1 << 28);
    }

    #[tokio::test]
    async fn reap_deletes_every_worker_in_scope() {
        let mut runtime = MockWorkerRuntime::new();
        runtime
            .expect_list()
            .withf(|_, selector| selector.contains("vmID=vm-1"))
            .returning(|_, _| {
                Ok(vec![
                    worker("a", 0, WorkerPhase::Succeeded),
                    worker("b", 1, WorkerPhase::Running),
                ])
            });
        runtime.expect_delete().times(2).returning(|_, _| Ok(()));
        let coordinator = Coordinator::new(Arc::new(runtime), 3);

        assert_eq!(coordinator.reap("target", "mig-1", Some("vm-1")).await.unwrap(), 2);
    }

    /// Story: A precopy round ends and the next round starts from zero
    #[tokio::test]
    async fn story_retired_worker_forgets_its_high_water_mark() {
        let mut runtime = MockWorkerRuntime::new();
        runtime
            .expect_list()
            .returning(|_, _| Ok(vec![worker("w", 0, WorkerPhase::Running)]));
        let mut reports = vec![r#"{"transferred": 800}"#, r#"{"transferred": 100}"#].into_iter();
        runtime
            .expect_logs()
            .returning(move |_, _, _| Ok(reports.next().unwrap_or_default().to_string()));
        runtime
            .expect_delete()
            .withf(|_, name| name == "w")
            .times(1)
            .returning(|_, _| Ok(()));
        let coordinator = Coordinator::new(Arc::new(runtime), 3);

        assert_eq!(coordinator.poll("target", &key(), 1000).await.unwrap().transferred, 800);
        coordinator.retire("target", &key()).await.unwrap();
        assert_eq!(coordinator.poll("target", &key(), 1000).await.unwrap().transferred, 100);
    }
}

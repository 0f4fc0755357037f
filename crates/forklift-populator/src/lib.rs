//! Populator coordination for forklift
//!
//! A populator is a one-shot worker that fills one target volume from one
//! source disk. This crate names and specifies workers, starts them through
//! a [`WorkerRuntime`], and turns their output into [`DiskTransfer`]
//! progress for the plan executor.

#![deny(missing_docs)]

mod coordinator;
mod error;
pub mod progress;
mod runtime;
mod worker;

pub use coordinator::{Coordinator, DiskTransfer, Ensured, TransferPhase};
pub use error::PopulatorError;
pub use runtime::{build_pod, worker_from_pod, KubeWorkerRuntime, WorkerRuntime, METRICS_PORT};
pub use worker::{
    dns_name, label_value, scope_selector, select_worker, DiskKey, Worker, WorkerKind,
    WorkerPhase, WorkerRequest, WorkerSpec, DISK_ANNOTATION, SECRET_PATH, VOLUME_PATH,
};

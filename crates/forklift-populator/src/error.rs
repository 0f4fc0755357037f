//! Populator errors

use forklift_common::crd::ProviderType;
use forklift_common::Error;
use thiserror::Error;

/// Errors raised while coordinating populator workers
#[derive(Debug, Error)]
pub enum PopulatorError {
    /// Kubernetes API failure
    #[error(transparent)]
    Kube(#[from] kube::Error),

    /// No worker kind can populate disks from this source
    #[error("no populator for {0} sources")]
    UnsupportedSource(ProviderType),

    /// Expected worker is absent
    #[error("populator worker {name} not found")]
    WorkerMissing {
        /// Worker name
        name: String,
    },

    /// Progress could not be read from a worker
    #[error("cannot read progress of {worker}: {message}")]
    Scrape {
        /// Worker name
        worker: String,
        /// Cause
        message: String,
    },

    /// The worker failed
    #[error("populator worker {worker} failed: {message}")]
    WorkerFailed {
        /// Worker name
        worker: String,
        /// Termination message or reason
        message: String,
        /// Restart budget exhausted or exit was final
        permanent: bool,
    },
}

impl PopulatorError {
    /// Whether retrying later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(e) => forklift_common::error::is_retryable_kube(e),
            Self::UnsupportedSource(_) => false,
            Self::WorkerMissing { .. } | Self::Scrape { .. } => true,
            Self::WorkerFailed { permanent, .. } => !permanent,
        }
    }
}

impl From<PopulatorError> for Error {
    fn from(err: PopulatorError) -> Self {
        match err {
            PopulatorError::Kube(e) => Error::Kube { source: e },
            other => {
                let disk = match &other {
                    PopulatorError::WorkerMissing { name } => name.clone(),
                    PopulatorError::Scrape { worker, .. }
                    | PopulatorError::WorkerFailed { worker, .. } => worker.clone(),
                    _ => String::new(),
                };
                let retryable = other.is_retryable();
                Error::populator(disk, other.to_string(), retryable)
            }
        }
    }
}

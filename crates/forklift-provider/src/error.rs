//! Provider controller errors

use forklift_common::Error;
use forklift_inventory::InventoryError;
use thiserror::Error;

/// Errors that abort a provider reconcile and requeue it with backoff
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Inventory could not be consulted
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// Shared error
    #[error(transparent)]
    Common(#[from] Error),
}

impl ProviderError {
    /// Whether the next attempt may succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(e) => forklift_common::error::is_retryable_kube(e),
            Self::Inventory(e) => e.is_retryable(),
            Self::Common(e) => e.is_retryable(),
        }
    }
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Kube(source) => Error::Kube { source },
            ProviderError::Inventory(e) => e.into(),
            ProviderError::Common(e) => e,
        }
    }
}

//! Inventory client errors

use forklift_common::{Error, Reason};
use thiserror::Error;

/// Errors returned by the inventory client
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InventoryError {
    /// The reference resolved to nothing
    #[error("{kind} '{reference}' not found")]
    NotFound {
        /// Resource kind (vm, network, storage, provider)
        kind: &'static str,
        /// The reference as given
        reference: String,
    },

    /// A name reference resolved to more than one resource
    #[error("{kind} reference '{reference}' is not unique")]
    RefNotUnique {
        /// Resource kind
        kind: &'static str,
        /// The reference as given
        reference: String,
    },

    /// The inventory has not finished loading the provider
    #[error("provider not ready in inventory: {path}")]
    ProviderNotReady {
        /// Request path
        path: String,
    },

    /// Unexpected HTTP status
    #[error("inventory returned HTTP {status} for {path}")]
    Http {
        /// Status code
        status: u16,
        /// Request path
        path: String,
    },

    /// Request did not complete
    #[error("inventory request to {path} failed: {message}")]
    Transport {
        /// Request path
        path: String,
        /// Cause
        message: String,
    },

    /// Response body did not decode
    #[error("invalid inventory response from {path}: {message}")]
    Decode {
        /// Request path
        path: String,
        /// Cause
        message: String,
    },

    /// Client configuration is invalid
    #[error("inventory configuration error: {0}")]
    Config(String),
}

impl InventoryError {
    /// Whether retrying later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProviderNotReady { .. } | Self::Transport { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::NotFound { .. }
            | Self::RefNotUnique { .. }
            | Self::Decode { .. }
            | Self::Config(_) => false,
        }
    }

    /// Whether the error means the resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<InventoryError> for Error {
    fn from(err: InventoryError) -> Self {
        match &err {
            InventoryError::Config(msg) => Error::configuration("inventory", msg.clone()),
            InventoryError::ProviderNotReady { .. } => Error::Adapter {
                provider: "inventory".to_string(),
                message: err.to_string(),
                reason: Reason::ProviderNotReady,
                retryable: true,
            },
            _ => Error::Inventory {
                message: err.to_string(),
                retryable: err.is_retryable(),
            },
        }
    }
}

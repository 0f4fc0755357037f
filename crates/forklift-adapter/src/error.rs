//! Source adapter errors

use std::time::Duration;

use forklift_common::{Error, Reason};
use forklift_inventory::InventoryError;
use thiserror::Error;

/// Errors returned by source adapters
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The adapter does not advertise the capability
    #[error("capability {capability} is not supported by this source")]
    Unsupported {
        /// Capability name
        capability: &'static str,
    },

    /// The provider cannot act as a migration source
    #[error("invalid source provider: {0}")]
    InvalidProvider(String),

    /// Inventory lookup failed
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// The control endpoint rejected or failed a call
    #[error("{operation} failed: {message}")]
    Control {
        /// Operation name
        operation: String,
        /// HTTP status, when the call completed
        status: Option<u16>,
        /// Cause
        message: String,
    },

    /// The control endpoint returned an unexpected body
    #[error("{operation} returned an invalid response: {message}")]
    Decode {
        /// Operation name
        operation: String,
        /// Cause
        message: String,
    },

    /// A call exceeded the per-call budget
    #[error("{operation} timed out after {budget:?}")]
    Timeout {
        /// Operation name
        operation: String,
        /// Budget
        budget: Duration,
    },

    /// The source reported a snapshot failure
    #[error("snapshot {snapshot} failed: {message}")]
    SnapshotFailed {
        /// Snapshot ID
        snapshot: String,
        /// Source message
        message: String,
    },

    /// Credentials are missing or malformed
    #[error("invalid credentials: {0}")]
    Credentials(String),
}

impl AdapterError {
    /// Build an unsupported-capability error
    pub fn unsupported(capability: &'static str) -> Self {
        Self::Unsupported { capability }
    }

    /// Whether retrying later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Inventory(e) => e.is_retryable(),
            Self::Control { status: None, .. } => true,
            Self::Control {
                status: Some(code), ..
            } => *code >= 500 || *code == 409 || *code == 429,
            Self::Timeout { .. } => true,
            Self::Unsupported { .. }
            | Self::InvalidProvider(_)
            | Self::Decode { .. }
            | Self::SnapshotFailed { .. }
            | Self::Credentials(_) => false,
        }
    }

    /// Stable reason code
    pub fn reason(&self) -> Reason {
        match self {
            Self::Unsupported { .. } => Reason::Unsupported,
            Self::InvalidProvider(_) => Reason::ProviderNotValid,
            Self::Inventory(e) if e.is_not_found() => Reason::VmNotFound,
            Self::Inventory(_) => Reason::InventoryUnavailable,
            Self::Control { .. } | Self::Decode { .. } => Reason::SourceUnavailable,
            Self::Timeout { .. } => Reason::StepTimeout,
            Self::SnapshotFailed { .. } => Reason::SnapshotFailed,
            Self::Credentials(_) => Reason::SecretNotFound,
        }
    }
}

impl From<AdapterError> for Error {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Inventory(e) => e.into(),
            AdapterError::Timeout { operation, budget } => Error::timeout(operation, budget),
            other => Error::Adapter {
                provider: "source".to_string(),
                message: other.to_string(),
                reason: other.reason(),
                retryable: other.is_retryable(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn control(status: Option<u16>) -> AdapterError {
        AdapterError::Control {
            operation: "power off".into(),
            status,
            message: "boom".into(),
        }
    }

    #[rstest]
    #[case::unsupported(AdapterError::unsupported("Changes"), false, Reason::Unsupported)]
    #[case::transport(control(None), true, Reason::SourceUnavailable)]
    #[case::server_error(control(Some(502)), true, Reason::SourceUnavailable)]
    #[case::conflict(control(Some(409)), true, Reason::SourceUnavailable)]
    #[case::bad_request(control(Some(400)), false, Reason::SourceUnavailable)]
    #[case::snapshot(
        AdapterError::SnapshotFailed { snapshot: "s1".into(), message: "quiesce".into() },
        false,
        Reason::SnapshotFailed
    )]
    fn classification(#[case] err: AdapterError, #[case] retryable: bool, #[case] reason: Reason) {
        assert_eq!(err.is_retryable(), retryable);
        assert_eq!(err.reason(), reason);
    }

    #[test]
    fn timeout_keeps_its_budget_when_converted() {
        let err: Error = AdapterError::Timeout {
            operation: "inspect".into(),
            budget: Duration::from_secs(30),
        }
        .into();
        assert_eq!(err.reason(), Reason::StepTimeout);
    }
}

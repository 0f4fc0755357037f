//! Plan controller errors

use forklift_adapter::AdapterError;
use forklift_common::{Error, Reason};
use forklift_inventory::InventoryError;
use forklift_itinerary::ItineraryError;
use forklift_populator::PopulatorError;
use thiserror::Error;

/// Errors raised while reconciling a plan or executing a VM step
#[derive(Debug, Error)]
pub enum PlanError {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Inventory lookup failed
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// Source adapter call failed
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Populator coordination failed
    #[error(transparent)]
    Populator(#[from] PopulatorError),

    /// The VM's phase is not part of its itinerary
    #[error(transparent)]
    Itinerary(#[from] ItineraryError),

    /// A step failed with a specific reason
    #[error("{message}")]
    Step {
        /// Reason code recorded on the VM
        reason: Reason,
        /// Description
        message: String,
        /// Whether the step may be retried
        retryable: bool,
    },

    /// Shared error
    #[error(transparent)]
    Common(#[from] Error),
}

impl PlanError {
    /// A step failure that ends the VM
    pub fn permanent(reason: Reason, message: impl Into<String>) -> Self {
        Self::Step {
            reason,
            message: message.into(),
            retryable: false,
        }
    }

    /// A step failure worth another attempt
    pub fn transient(reason: Reason, message: impl Into<String>) -> Self {
        Self::Step {
            reason,
            message: message.into(),
            retryable: true,
        }
    }

    /// Whether the next attempt may succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(e) => forklift_common::error::is_retryable_kube(e),
            Self::Inventory(e) => e.is_retryable(),
            Self::Adapter(e) => e.is_retryable(),
            Self::Populator(e) => e.is_retryable(),
            Self::Itinerary(_) => false,
            Self::Step { retryable, .. } => *retryable,
            Self::Common(e) => e.is_retryable(),
        }
    }

    /// Stable reason code
    pub fn reason(&self) -> Reason {
        match self {
            Self::Kube(_) => Reason::KubeApi,
            Self::Inventory(e) if e.is_not_found() => Reason::VmNotFound,
            Self::Inventory(_) => Reason::InventoryUnavailable,
            Self::Adapter(e) => e.reason(),
            Self::Populator(PopulatorError::UnsupportedSource(_)) => Reason::Unsupported,
            Self::Populator(_) => Reason::TransferFailed,
            Self::Itinerary(_) => Reason::Internal,
            Self::Step { reason, .. } => *reason,
            Self::Common(e) => e.reason(),
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Kube(_) => "kube",
            Self::Inventory(_) => "inventory",
            Self::Adapter(_) => "adapter",
            Self::Populator(_) => "populator",
            Self::Itinerary(_) => "itinerary",
            Self::Step { .. } => "step",
            Self::Common(_) => "common",
        }
    }
}

impl From<PlanError> for Error {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::Kube(source) => Error::Kube { source },
            PlanError::Inventory(e) => e.into(),
            PlanError::Adapter(e) => e.into(),
            PlanError::Populator(e) => e.into(),
            PlanError::Common(e) => e,
            other => {
                if other.is_retryable() {
                    Error::internal_with_context("plan", other.to_string())
                } else {
                    Error::validation(other.reason(), other.to_string())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forklift_itinerary::Phase;
    use rstest::rstest;

    #[rstest]
    #[case::conversion(
        PlanError::permanent(Reason::ConversionFailed, "exit 1"),
        Reason::ConversionFailed,
        false
    )]
    #[case::transient_step(
        PlanError::transient(Reason::TransferFailed, "pod evicted"),
        Reason::TransferFailed,
        true
    )]
    #[case::unsupported(
        PlanError::from(AdapterError::unsupported("Snapshot")),
        Reason::Unsupported,
        false
    )]
    #[case::itinerary(
        PlanError::from(ItineraryError::PhaseNotInItinerary {
            phase: Phase::CopyDisks,
            pipeline: "warm",
        }),
        Reason::Internal,
        false
    )]
    fn reason_and_retryability(
        #[case] err: PlanError,
        #[case] reason: Reason,
        #[case] retryable: bool,
    ) {
        assert_eq!(err.reason(), reason);
        assert_eq!(err.is_retryable(), retryable);
    }

    #[test]
    fn permanent_step_errors_keep_their_reason_in_the_shared_error() {
        let err = Error::from(PlanError::permanent(Reason::HookFailed, "job failed"));
        assert_eq!(err.reason(), Reason::HookFailed);
        assert!(!err.is_retryable());
    }
}

//! Error types for the forklift operator
//!
//! Errors are structured with fields to aid debugging in production. Every
//! variant maps to a stable [`Reason`] code so that conditions, events and
//! callers can match on the code rather than on message text.

use std::fmt;
use std::panic::Location;
use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

// =============================================================================
// Reason codes
// =============================================================================

/// Stable, machine-readable reason codes.
///
/// The string form is part of the API: it appears in condition `reason`
/// fields and in Kubernetes Events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reason {
    // Validation
    /// A VM referenced by the plan is absent from the inventory
    VmNotFound,
    /// The same VM is referenced more than once
    DuplicateVm,
    /// A network used by a VM has no mapping pair
    NetworkNotMapped,
    /// A datastore/storage domain used by a VM has no mapping pair
    StorageNotMapped,
    /// A referenced NetworkMap or StorageMap does not exist
    MapNotFound,
    /// A referenced hook does not exist
    HookNotFound,
    /// A hook is malformed (image missing, playbook not base64)
    HookNotValid,
    /// A hook is attached at an unknown step
    HookStepNotValid,
    /// A provider referenced by the plan is not `Ready`
    ProviderNotReady,
    /// The provider pair is not a legal source/destination combination
    ProviderNotValid,
    /// The target namespace is missing or not a DNS-1123 label
    NamespaceNotValid,
    /// The transfer network does not exist
    TransferNetNotValid,
    /// Warm migration requested for a source without change tracking
    WarmNotSupported,
    /// Migration mode changed after the first migration started
    ModeImmutable,
    /// Provider settings contain an unrecognized key
    UnknownProviderSetting,
    /// Provider settings carry an unparseable value
    ProviderSettingNotValid,
    /// Provider credentials secret is missing
    SecretNotFound,
    /// Provider URL is malformed
    UrlNotValid,
    /// Provider could not be reached through the inventory
    ConnectionTestFailed,

    // Execution
    /// Guest conversion exited non-zero
    ConversionFailed,
    /// Disk transfer failed
    TransferFailed,
    /// Hook job failed or exceeded its retry budget
    HookFailed,
    /// Source VM could not be powered off
    PowerOffFailed,
    /// Snapshot creation or removal failed
    SnapshotFailed,
    /// Target VM could not be created
    CreateVmFailed,
    /// A step exceeded its time budget
    StepTimeout,
    /// A step exhausted its retry budget
    RetryBudgetExhausted,
    /// The source adapter does not support the requested capability
    Unsupported,
    /// The user requested cancellation
    UserRequested,
    /// Archive requested while a migration is still running
    CannotArchiveRunning,

    // Infrastructure
    /// Kubernetes API failure
    KubeApi,
    /// Inventory service failure
    InventoryUnavailable,
    /// Source platform failure
    SourceUnavailable,
    /// Populator worker failure
    PopulatorUnavailable,
    /// Encoding/decoding failure
    Serialization,
    /// Operator misconfiguration
    Configuration,
    /// Catch-all for internal failures
    Internal,
}

impl Reason {
    /// The stable string form of the reason
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::VmNotFound => "VMNotFound",
            Reason::DuplicateVm => "DuplicateVM",
            Reason::NetworkNotMapped => "NetworkNotMapped",
            Reason::StorageNotMapped => "StorageNotMapped",
            Reason::MapNotFound => "MapNotFound",
            Reason::HookNotFound => "HookNotFound",
            Reason::HookNotValid => "HookNotValid",
            Reason::HookStepNotValid => "HookStepNotValid",
            Reason::ProviderNotReady => "ProviderNotReady",
            Reason::ProviderNotValid => "ProviderNotValid",
            Reason::NamespaceNotValid => "NamespaceNotValid",
            Reason::TransferNetNotValid => "TransferNetNotValid",
            Reason::WarmNotSupported => "WarmNotSupported",
            Reason::ModeImmutable => "ModeImmutable",
            Reason::UnknownProviderSetting => "UnknownProviderSetting",
            Reason::ProviderSettingNotValid => "ProviderSettingNotValid",
            Reason::SecretNotFound => "SecretNotFound",
            Reason::UrlNotValid => "UrlNotValid",
            Reason::ConnectionTestFailed => "ConnectionTestFailed",
            Reason::ConversionFailed => "ConversionFailed",
            Reason::TransferFailed => "TransferFailed",
            Reason::HookFailed => "HookFailed",
            Reason::PowerOffFailed => "PowerOffFailed",
            Reason::SnapshotFailed => "SnapshotFailed",
            Reason::CreateVmFailed => "CreateVMFailed",
            Reason::StepTimeout => "StepTimeout",
            Reason::RetryBudgetExhausted => "RetryBudgetExhausted",
            Reason::Unsupported => "Unsupported",
            Reason::UserRequested => "UserRequested",
            Reason::CannotArchiveRunning => "CannotArchiveRunning",
            Reason::KubeApi => "KubeAPIError",
            Reason::InventoryUnavailable => "InventoryUnavailable",
            Reason::SourceUnavailable => "SourceUnavailable",
            Reason::PopulatorUnavailable => "PopulatorUnavailable",
            Reason::Serialization => "SerializationError",
            Reason::Configuration => "ConfigurationError",
            Reason::Internal => "InternalError",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Error
// =============================================================================

/// Main error type for forklift operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {object}: {message}")]
    Validation {
        /// Name of the object with invalid configuration
        object: String,
        /// Description of what's invalid
        message: String,
        /// Reason code surfaced on the condition
        reason: Reason,
        /// The invalid field path (e.g., "spec.vms[2]")
        field: Option<String>,
    },

    /// Inventory service error
    #[error("inventory error: {message}")]
    Inventory {
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Source adapter error
    #[error("source error [{provider}]: {message}")]
    Adapter {
        /// Provider type (vsphere, ovirt, openstack, hyperv, ova)
        provider: String,
        /// Description of what failed
        message: String,
        /// Reason code
        reason: Reason,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Populator worker error
    #[error("populator error for disk {disk}: {message}")]
    Populator {
        /// Disk identifier
        disk: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// An operation exceeded its time budget
    #[error("{operation} timed out after {budget:?}")]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// The budget that was exceeded
        budget: Duration,
    },

    /// Operator configuration error
    #[error("configuration error for {key}: {message}")]
    Configuration {
        /// Environment key or setting name
        key: String,
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "executor")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given reason and message
    pub fn validation(reason: Reason, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            reason,
            field: None,
        }
    }

    /// Create a validation error with object context
    pub fn validation_for(
        object: impl Into<String>,
        reason: Reason,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            reason,
            field: None,
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        reason: Reason,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            reason,
            field: Some(field.into()),
        }
    }

    /// Create a retryable inventory error
    pub fn inventory(msg: impl Into<String>) -> Self {
        Self::Inventory {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a retryable source adapter error
    pub fn adapter(provider: impl Into<String>, reason: Reason, msg: impl Into<String>) -> Self {
        Self::Adapter {
            provider: provider.into(),
            message: msg.into(),
            reason,
            retryable: true,
        }
    }

    /// Create a non-retryable source adapter error
    pub fn adapter_permanent(
        provider: impl Into<String>,
        reason: Reason,
        msg: impl Into<String>,
    ) -> Self {
        Self::Adapter {
            provider: provider.into(),
            message: msg.into(),
            reason,
            retryable: false,
        }
    }

    /// Create a populator error
    pub fn populator(disk: impl Into<String>, msg: impl Into<String>, retryable: bool) -> Self {
        Self::Populator {
            disk: disk.into(),
            message: msg.into(),
            retryable,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, budget: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            budget,
        }
    }

    /// Create a configuration error
    pub fn configuration(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// The stable reason code for this error
    pub fn reason(&self) -> Reason {
        match self {
            Error::Kube { .. } => Reason::KubeApi,
            Error::Validation { reason, .. } => *reason,
            Error::Inventory { .. } => Reason::InventoryUnavailable,
            Error::Adapter { reason, .. } => *reason,
            Error::Populator { .. } => Reason::TransferFailed,
            Error::Serialization { .. } => Reason::Serialization,
            Error::Timeout { .. } => Reason::StepTimeout,
            Error::Configuration { .. } => Reason::Configuration,
            Error::Internal { .. } => Reason::Internal,
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, serialization and configuration errors require a fix
    /// from the user. Timeouts are permanent unless the caller decides
    /// otherwise. Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => is_retryable_kube(source),
            Error::Validation { .. } => false,
            Error::Inventory { retryable, .. } => *retryable,
            Error::Adapter { retryable, .. } => *retryable,
            Error::Populator { retryable, .. } => *retryable,
            Error::Serialization { .. } => false,
            Error::Timeout { .. } => false,
            Error::Configuration { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Whether a kube error is worth retrying
///
/// 4xx responses are permanent except 409 (conflict) and 429 (throttled);
/// transport failures and 5xx are transient.
pub fn is_retryable_kube(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429,
        _ => true,
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(err.to_string())
    }
}

// =============================================================================
// Traced errors
// =============================================================================

/// An error together with the call sites it passed through.
///
/// Frames are pushed with `#[track_caller]`, so each `traced()` or
/// `frame()` records the `file:line` of its caller.
#[derive(Debug)]
pub struct Traced<E> {
    source: E,
    frames: Vec<&'static Location<'static>>,
}

impl<E> Traced<E> {
    /// Wrap an error, recording the caller as the first frame
    #[track_caller]
    pub fn new(source: E) -> Self {
        Self {
            source,
            frames: vec![Location::caller()],
        }
    }

    /// Record the caller as an additional frame
    #[track_caller]
    pub fn frame(mut self) -> Self {
        self.frames.push(Location::caller());
        self
    }

    /// The wrapped error
    pub fn inner(&self) -> &E {
        &self.source
    }

    /// Unwrap into the original error
    pub fn into_inner(self) -> E {
        self.source
    }

    /// Capture points, innermost first, formatted as `file:line`
    pub fn frames(&self) -> Vec<String> {
        self.frames
            .iter()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .collect()
    }
}

impl<E: std::error::Error> Traced<E> {
    /// Message of the innermost cause in the `source()` chain
    pub fn root_cause(&self) -> String {
        let mut current: &dyn std::error::Error = &self.source;
        while let Some(next) = current.source() {
            current = next;
        }
        current.to_string()
    }
}

impl<E: fmt::Display> fmt::Display for Traced<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.source.fmt(f)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for Traced<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Attach capture points to `Result` errors
pub trait TraceExt<T, E> {
    /// Convert the error and wrap it in [`Traced`], recording the caller
    fn traced<F>(self) -> std::result::Result<T, Traced<F>>
    where
        E: Into<F>;
}

impl<T, E> TraceExt<T, E> for std::result::Result<T, E> {
    #[track_caller]
    fn traced<F>(self) -> std::result::Result<T, Traced<F>>
    where
        E: Into<F>,
    {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(Traced::new(e.into())),
        }
    }
}

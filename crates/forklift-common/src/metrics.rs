//! OpenTelemetry instruments for forklift
//!
//! Exported through the global meter provider installed by
//! [`crate::telemetry::init_telemetry`]; without an OTLP endpoint the
//! instruments are no-ops.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("forklift"));

/// Histogram of plan reconciliation duration
///
/// Labels:
/// - `plan`: plan name
/// - `result`: success, error
pub static PLAN_RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("forklift_plan_reconcile_duration_seconds")
        .with_description("Duration of plan reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of plan reconciliation errors
///
/// Labels:
/// - `plan`: plan name
/// - `error_type`: transient, permanent
pub static PLAN_RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("forklift_plan_reconcile_errors_total")
        .with_description("Total number of plan reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of VMs reaching a terminal phase
///
/// Labels:
/// - `mode`: cold, warm
/// - `outcome`: succeeded, failed, canceled
pub static VM_MIGRATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("forklift_vm_migrations_total")
        .with_description("Total number of VM migrations by outcome")
        .with_unit("{vms}")
        .build()
});

/// Counter of itinerary step transitions
///
/// Labels:
/// - `phase`: phase entered
pub static VM_STEP_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("forklift_vm_step_transitions_total")
        .with_description("Total number of VM itinerary transitions")
        .with_unit("{transitions}")
        .build()
});

/// Gauge of bytes transferred for a disk
///
/// Labels:
/// - `migration`, `vm`, `disk`
pub static DISK_TRANSFERRED_BYTES: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("forklift_disk_transferred_bytes")
        .with_description("Bytes transferred for a disk in the current round")
        .with_unit("By")
        .build()
});

/// Counter of populator workers adopted instead of created
pub static POPULATOR_WORKERS_ADOPTED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("forklift_populator_workers_adopted_total")
        .with_description("Total number of existing populator workers adopted")
        .with_unit("{workers}")
        .build()
});

/// Terminal outcome of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmOutcome {
    /// Completed
    Succeeded,
    /// Failed
    Failed,
    /// Canceled
    Canceled,
}

impl VmOutcome {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// Record a VM reaching a terminal phase
pub fn record_vm_outcome(mode: &str, outcome: VmOutcome) {
    VM_MIGRATIONS.add(
        1,
        &[
            KeyValue::new("mode", mode.to_string()),
            KeyValue::new("outcome", outcome.as_str()),
        ],
    );
}

/// Record a VM entering a phase
pub fn record_step_transition(phase: &str) {
    VM_STEP_TRANSITIONS.add(1, &[KeyValue::new("phase", phase.to_string())]);
}

/// Record disk transfer progress
pub fn record_disk_progress(migration: &str, vm: &str, disk: &str, bytes: u64) {
    DISK_TRANSFERRED_BYTES.record(
        bytes,
        &[
            KeyValue::new("migration", migration.to_string()),
            KeyValue::new("vm", vm.to_string()),
            KeyValue::new("disk", disk.to_string()),
        ],
    );
}

/// Record an existing populator worker being adopted
pub fn record_worker_adopted(kind: &str) {
    POPULATOR_WORKERS_ADOPTED.add(1, &[KeyValue::new("kind", kind.to_string())]);
}

/// Times one plan reconciliation
pub struct ReconcileTimer {
    plan: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing
    pub fn start(plan: impl Into<String>) -> Self {
        Self {
            plan: plan.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        PLAN_RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("plan", self.plan),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    pub fn error(self, error_type: &str) {
        PLAN_RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("plan", self.plan.clone()),
                KeyValue::new("result", "error"),
            ],
        );
        PLAN_RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("plan", self.plan),
                KeyValue::new("error_type", error_type.to_string()),
            ],
        );
    }
}

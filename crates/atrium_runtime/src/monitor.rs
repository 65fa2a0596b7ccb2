//! Runtime metrics.
//!
//! Counters are plain atomics shared by every process of an office, so
//! recording never takes a lock. [`RuntimeMetrics::snapshot`] copies them
//! into a serializable value.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one office
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    processes_started: AtomicU64,
    processes_completed: AtomicU64,
    processes_failed: AtomicU64,
    jobs_executed: AtomicU64,
    functions_failed: AtomicU64,
    escalations_handled: AtomicU64,
    escalations_unhandled: AtomicU64,
    objects_sourced: AtomicU64,
    sourcing_timeouts: AtomicU64,
    governance_activities: AtomicU64,
}

macro_rules! recorder {
    ($($method:ident => $field:ident),* $(,)?) => {
        $(
            #[doc = concat!("Increment `", stringify!($field), "`")]
            pub fn $method(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl RuntimeMetrics {
    /// Create zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    recorder! {
        record_process_started => processes_started,
        record_process_completed => processes_completed,
        record_process_failed => processes_failed,
        record_job => jobs_executed,
        record_function_failure => functions_failed,
        record_escalation_handled => escalations_handled,
        record_escalation_unhandled => escalations_unhandled,
        record_object_sourced => objects_sourced,
        record_sourcing_timeout => sourcing_timeouts,
        record_governance_activity => governance_activities,
    }

    /// Copy the current counter values
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            processes_started: load(&self.processes_started),
            processes_completed: load(&self.processes_completed),
            processes_failed: load(&self.processes_failed),
            jobs_executed: load(&self.jobs_executed),
            functions_failed: load(&self.functions_failed),
            escalations_handled: load(&self.escalations_handled),
            escalations_unhandled: load(&self.escalations_unhandled),
            objects_sourced: load(&self.objects_sourced),
            sourcing_timeouts: load(&self.sourcing_timeouts),
            governance_activities: load(&self.governance_activities),
        }
    }
}

/// Point-in-time copy of [`RuntimeMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Processes triggered
    pub processes_started: u64,
    /// Processes that completed, successfully or not
    pub processes_completed: u64,
    /// Processes that completed with an unrouted escalation
    pub processes_failed: u64,
    /// Jobs executed (function bodies run)
    pub jobs_executed: u64,
    /// Function bodies that returned an escalation or panicked
    pub functions_failed: u64,
    /// Escalations matched by a procedure
    pub escalations_handled: u64,
    /// Escalations that reached the leaf handler
    pub escalations_unhandled: u64,
    /// Objects that reached ready
    pub objects_sourced: u64,
    /// Asynchronous sourcing timeouts
    pub sourcing_timeouts: u64,
    /// Governance activities run
    pub governance_activities: u64,
}

impl MetricsSnapshot {
    /// Fraction of completed processes that succeeded (0.0 - 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.processes_completed == 0 {
            return 1.0;
        }
        (self.processes_completed - self.processes_failed) as f64 / self.processes_completed as f64
    }

    /// Fraction of completed processes that failed (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.processes_completed == 0 {
            return 0.0;
        }
        self.processes_failed as f64 / self.processes_completed as f64
    }

    /// Processes started but not yet completed
    #[must_use]
    pub fn processes_in_flight(&self) -> u64 {
        self.processes_started.saturating_sub(self.processes_completed)
    }
}

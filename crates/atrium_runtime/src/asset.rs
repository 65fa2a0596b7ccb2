//! Waiting on assets without holding a worker thread.
//!
//! [`AssetMonitor`] is the waiter list a container keeps while its object is
//! still sourcing. [`AssetManager`] tracks the readiness deadlines of
//! asynchronous containers and fails those that miss them when the office
//! manager sweeps it.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::escalation::Escalation;
use crate::executor::FunctionJob;
use crate::monitor::RuntimeMetrics;
use crate::object::{ContainerState, ManagedObjectContainer};

/// Jobs parked on one asset
#[derive(Default)]
pub(crate) struct AssetMonitor {
    waiters: Vec<FunctionJob>,
}

impl AssetMonitor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn wait(&mut self, job: FunctionJob) {
        self.waiters.push(job);
    }

    pub(crate) fn take(&mut self) -> Vec<FunctionJob> {
        std::mem::take(&mut self.waiters)
    }

    /// Re-queue parked jobs onto their teams. Never call with a lock held:
    /// a passive team runs the job right here.
    pub(crate) fn activate(waiters: Vec<FunctionJob>) {
        for job in waiters {
            job.schedule();
        }
    }
}

struct Deadline {
    container: Weak<ManagedObjectContainer>,
    deadline: Instant,
    timeout: Duration,
}

/// Readiness deadlines of asynchronous containers
#[derive(Default)]
pub(crate) struct AssetManager {
    deadlines: Mutex<Vec<Deadline>>,
}

impl AssetManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, container: &Arc<ManagedObjectContainer>, timeout: Duration) {
        self.deadlines.lock().push(Deadline {
            container: Arc::downgrade(container),
            deadline: Instant::now() + timeout,
            timeout,
        });
    }

    /// Fail containers still sourcing past their deadline; returns how many
    pub(crate) fn sweep(&self, now: Instant, metrics: &RuntimeMetrics) -> usize {
        let mut expired = Vec::new();
        {
            let mut deadlines = self.deadlines.lock();
            deadlines.retain(|entry| {
                let Some(container) = entry.container.upgrade() else {
                    return false;
                };
                if container.state() != ContainerState::Sourcing {
                    return false;
                }
                if entry.deadline <= now {
                    expired.push((container, entry.timeout));
                    return false;
                }
                true
            });
        }

        let mut failed = 0;
        for (container, timeout) in expired {
            if container.fail(Escalation::source_timeout(container.name(), timeout)) {
                metrics.record_sourcing_timeout();
                tracing::warn!(
                    object = %container.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "object not ready within timeout"
                );
                failed += 1;
            }
        }
        failed
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.deadlines.lock().len()
    }
}

//! Process contexts: the top-level unit of work.
//!
//! A process owns its process-scoped object containers and its governance
//! containers. It completes when its last thread completes, then tears down
//! its objects and notifies listeners exactly once.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use atrium_core::{LogicalClock, LogicalTime, ProcessId};

use crate::escalation::Escalation;
use crate::governance::{GovernanceContainer, GovernanceState};
use crate::object::{teardown_containers, ManagedObjectContainer};
use crate::office::OfficeMetaData;
use crate::thread::{CompletionCallback, ThreadState};

/// Listener added at run time, called once with the process outcome
pub type CompletionListener = Box<dyn FnOnce(ProcessId, Option<&Escalation>) + Send>;

/// Trigger callback, called last with the process outcome
pub(crate) type ProcessCallback = Box<dyn FnOnce(Option<Escalation>) + Send>;

struct ProcessInner {
    active_threads: usize,
    threads: Vec<Weak<ThreadState>>,
    failure: Option<Escalation>,
    governance: Vec<Option<Arc<GovernanceContainer>>>,
    listeners: Vec<CompletionListener>,
    callback: Option<ProcessCallback>,
    completed: bool,
}

/// State of one running process
pub struct ProcessState {
    id: ProcessId,
    office: Arc<OfficeMetaData>,
    objects: Vec<Arc<ManagedObjectContainer>>,
    clock: LogicalClock,
    failed: AtomicBool,
    cancel_requested: AtomicBool,
    completed: AtomicBool,
    inner: Mutex<ProcessInner>,
}

impl ProcessState {
    pub(crate) fn new(office: Arc<OfficeMetaData>, callback: Option<ProcessCallback>) -> Arc<Self> {
        let objects = office
            .process_objects
            .iter()
            .map(|meta| Arc::new(ManagedObjectContainer::new(Arc::clone(meta))))
            .collect();
        let governance = vec![None; office.governance.len()];
        let process = Arc::new(Self {
            id: ProcessId::new(),
            office,
            objects,
            clock: LogicalClock::new(),
            failed: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            inner: Mutex::new(ProcessInner {
                active_threads: 0,
                threads: Vec::new(),
                failure: None,
                governance,
                listeners: Vec::new(),
                callback,
                completed: false,
            }),
        });
        process.office.metrics.record_process_started();
        tracing::debug!(process = %process.id, office = %process.office.name, "process started");
        process
    }

    /// Process identifier
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub(crate) fn office(&self) -> &Arc<OfficeMetaData> {
        &self.office
    }

    pub(crate) fn objects(&self) -> &[Arc<ManagedObjectContainer>] {
        &self.objects
    }

    /// Stamp for the next object to become ready
    pub(crate) fn tick(&self) -> LogicalTime {
        self.clock.tick()
    }

    /// Start a new thread context
    pub(crate) fn new_thread(self: &Arc<Self>, callback: Option<CompletionCallback>) -> Arc<ThreadState> {
        let thread = ThreadState::new(Arc::clone(self), callback);
        let mut inner = self.inner.lock();
        inner.active_threads += 1;
        inner.threads.retain(|weak| weak.strong_count() > 0);
        inner.threads.push(Arc::downgrade(&thread));
        thread
    }

    /// Governance container `index`, created on first use
    pub(crate) fn governance(&self, index: usize) -> Option<Arc<GovernanceContainer>> {
        let meta = self.office.governance.get(index)?;
        let mut inner = self.inner.lock();
        let slot = inner.governance.get_mut(index)?;
        Some(Arc::clone(
            slot.get_or_insert_with(|| Arc::new(GovernanceContainer::new(Arc::clone(meta)))),
        ))
    }

    /// Governance container `index` if it was ever created
    pub(crate) fn existing_governance(&self, index: usize) -> Option<Arc<GovernanceContainer>> {
        self.inner.lock().governance.get(index).cloned().flatten()
    }

    pub(crate) fn add_listener(&self, listener: CompletionListener) {
        let mut inner = self.inner.lock();
        if inner.completed {
            drop(inner);
            tracing::warn!(process = %self.id, "listener added after completion ignored");
            return;
        }
        inner.listeners.push(listener);
    }

    /// Whether an unrouted escalation terminated the process
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Whether the process has completed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Flag the process cancelled and re-queue parked jobs so one of them
    /// raises the `Cancelled` escalation.
    pub(crate) fn request_cancel(&self) {
        if self.is_complete() {
            return;
        }
        self.cancel_requested.store(true, Ordering::Release);
        self.reactivate_parked();
    }

    /// Consume a pending cancellation request
    pub(crate) fn take_cancel(&self) -> bool {
        self.cancel_requested.swap(false, Ordering::AcqRel)
    }

    /// Terminate the process with an unrouted escalation.
    ///
    /// The first failure is kept and reported to the leaf handler. Jobs
    /// parked on this process's objects or governance are re-queued so they
    /// observe the failure and release their flows.
    pub(crate) fn fail(&self, escalation: Escalation) {
        let mut inner = self.inner.lock();
        if inner.failure.is_some() {
            return;
        }
        inner.failure = Some(escalation.clone());
        self.failed.store(true, Ordering::Release);
        drop(inner);

        self.office.metrics.record_escalation_unhandled();
        self.office.escalation_handler.handle(self.id, &escalation);
        self.reactivate_parked();
    }

    /// Re-queue every job parked on this process's objects or governance
    fn reactivate_parked(&self) {
        let inner = self.inner.lock();
        let threads: Vec<_> = inner.threads.iter().filter_map(Weak::upgrade).collect();
        let governance: Vec<_> = inner.governance.iter().flatten().cloned().collect();
        drop(inner);

        let parked = self
            .objects
            .iter()
            .chain(threads.iter().flat_map(|thread| thread.objects().iter()))
            .flat_map(|container| container.take_waiters())
            .chain(governance.iter().flat_map(|container| container.take_waiters()))
            .collect::<Vec<_>>();
        for job in parked {
            job.schedule();
        }
    }

    pub(crate) fn thread_complete(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.active_threads = inner.active_threads.saturating_sub(1);
        if inner.active_threads > 0 || inner.completed {
            return;
        }

        // governance left active is deactivated on its own team, in a
        // thread that keeps the process open until the activities finish
        let active: Vec<_> = inner
            .governance
            .iter()
            .flatten()
            .filter(|container| container.state() == GovernanceState::Active)
            .cloned()
            .collect();
        if !active.is_empty() && !self.is_failed() {
            inner.active_threads += 1;
            let thread = ThreadState::new(Arc::clone(self), None);
            inner.threads.push(Arc::downgrade(&thread));
            drop(inner);
            self.deactivate_governance(&thread, &active);
            return;
        }

        inner.completed = true;
        let failure = inner.failure.clone();
        let governance: Vec<_> = inner.governance.iter().flatten().cloned().collect();
        let listeners = std::mem::take(&mut inner.listeners);
        let callback = inner.callback.take();
        inner.threads.clear();
        drop(inner);

        self.complete(failure, &governance, listeners, callback);
    }

    fn deactivate_governance(&self, thread: &Arc<ThreadState>, active: &[Arc<GovernanceContainer>]) {
        let strategy = self.office.config.governance_deactivation;
        tracing::debug!(process = %self.id, governance = active.len(), ?strategy, "deactivating governance at completion");
        let flow = thread.new_flow();
        for container in active {
            container.deactivate(strategy, &flow);
        }
        flow.release();
    }

    fn complete(
        &self,
        failure: Option<Escalation>,
        governance: &[Arc<GovernanceContainer>],
        listeners: Vec<CompletionListener>,
        callback: Option<ProcessCallback>,
    ) {
        let mut cleanup: Vec<Escalation> = failure.iter().cloned().collect();
        let strategy = self.office.config.governance_deactivation;
        for container in governance {
            cleanup.extend(container.finish(strategy));
        }
        teardown_containers(&self.objects, &cleanup);

        for listener in &self.office.listeners {
            let listener = Arc::clone(listener);
            let outcome = failure.as_ref();
            if catch_unwind(AssertUnwindSafe(|| listener.process_completed(self.id, outcome))).is_err() {
                tracing::error!(process = %self.id, "process listener panicked");
            }
        }
        for listener in listeners {
            let outcome = failure.as_ref();
            if catch_unwind(AssertUnwindSafe(|| listener(self.id, outcome))).is_err() {
                tracing::error!(process = %self.id, "process listener panicked");
            }
        }

        let metrics = &self.office.metrics;
        metrics.record_process_completed();
        if failure.is_some() {
            metrics.record_process_failed();
        }
        self.completed.store(true, Ordering::Release);
        tracing::debug!(process = %self.id, failed = failure.is_some(), "process complete");

        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(failure))).is_err() {
                tracing::error!(process = %self.id, "process completion callback panicked");
            }
        }
    }
}

/// Host handle to a triggered process
#[derive(Clone)]
pub struct ProcessManager {
    process: Arc<ProcessState>,
}

impl ProcessManager {
    pub(crate) fn new(process: Arc<ProcessState>) -> Self {
        Self { process }
    }

    /// Process identifier
    #[must_use]
    pub fn process_id(&self) -> ProcessId {
        self.process.id()
    }

    /// Whether the process has completed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.process.is_complete()
    }

    /// Whether the process ended with an unrouted escalation
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.process.is_failed()
    }

    /// Request cancellation.
    ///
    /// The next job of the process raises a `Cancelled` escalation, which
    /// is routed like any other. Jobs parked on objects or governance are
    /// woken to take it. No effect once the process completed.
    pub fn cancel(&self) {
        tracing::debug!(process = %self.process.id(), "cancel requested");
        self.process.request_cancel();
    }
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("process", &self.process.id())
            .field("complete", &self.is_complete())
            .finish()
    }
}

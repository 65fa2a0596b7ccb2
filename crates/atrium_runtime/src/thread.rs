//! Thread contexts: concurrent lines of control inside a process.

use parking_lot::{Mutex, ReentrantMutex};
use std::sync::Arc;

use atrium_core::ThreadId;

use crate::escalation::{Escalation, EscalationRouter};
use crate::flow::Flow;
use crate::object::{teardown_containers, ManagedObjectContainer};
use crate::process::ProcessState;

/// Called once when a spawned thread completes, with its unrouted escalation
pub(crate) type CompletionCallback = Box<dyn FnOnce(Option<Escalation>) + Send>;

struct ThreadInner {
    active_flows: usize,
    failure: Option<Escalation>,
    callback: Option<CompletionCallback>,
    completed: bool,
}

/// One logical thread of control.
///
/// Jobs of this thread run function bodies while holding
/// [`ThreadState::execution`], so at most one of them mutates the thread's
/// state at a time. The lock is reentrant because a passive team may run a
/// reactivated job of the same thread on the current stack.
pub struct ThreadState {
    id: ThreadId,
    process: Arc<ProcessState>,
    execution: ReentrantMutex<()>,
    inner: Mutex<ThreadInner>,
    objects: Vec<Arc<ManagedObjectContainer>>,
    router: Arc<EscalationRouter>,
}

impl ThreadState {
    pub(crate) fn new(process: Arc<ProcessState>, callback: Option<CompletionCallback>) -> Arc<Self> {
        let office = process.office();
        let objects = office
            .thread_objects
            .iter()
            .map(|meta| Arc::new(ManagedObjectContainer::new(Arc::clone(meta))))
            .collect();
        let router = Arc::clone(&office.thread_router);
        Arc::new(Self {
            id: ThreadId::new(),
            process,
            execution: ReentrantMutex::new(()),
            inner: Mutex::new(ThreadInner {
                active_flows: 0,
                failure: None,
                callback,
                completed: false,
            }),
            objects,
            router,
        })
    }

    /// Thread identifier
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Owning process
    #[must_use]
    pub fn process(&self) -> &Arc<ProcessState> {
        &self.process
    }

    pub(crate) fn execution(&self) -> &ReentrantMutex<()> {
        &self.execution
    }

    pub(crate) fn router(&self) -> &Arc<EscalationRouter> {
        &self.router
    }

    pub(crate) fn objects(&self) -> &[Arc<ManagedObjectContainer>] {
        &self.objects
    }

    /// Start a new flow in this thread
    pub(crate) fn new_flow(self: &Arc<Self>) -> Arc<Flow> {
        self.inner.lock().active_flows += 1;
        Flow::new(Arc::clone(self))
    }

    /// Record an escalation nothing routed.
    ///
    /// A spawned thread with a completion callback hands the escalation to
    /// the callback; any other thread fails its whole process.
    pub(crate) fn fail(&self, escalation: Escalation) {
        let mut inner = self.inner.lock();
        if inner.callback.is_some() {
            if inner.failure.is_none() {
                inner.failure = Some(escalation);
            }
            return;
        }
        drop(inner);
        self.process.fail(escalation);
    }

    pub(crate) fn flow_complete(&self) {
        let mut inner = self.inner.lock();
        inner.active_flows = inner.active_flows.saturating_sub(1);
        if inner.active_flows > 0 || inner.completed {
            return;
        }
        inner.completed = true;
        let callback = inner.callback.take();
        let failure = inner.failure.take();
        drop(inner);

        tracing::debug!(thread = %self.id, process = %self.process.id(), "thread complete");
        let cleanup: Vec<Escalation> = failure.iter().cloned().collect();
        teardown_containers(&self.objects, &cleanup);

        if let Some(callback) = callback {
            callback(failure);
        }
        self.process.thread_complete();
    }

    /// Whether every flow of the thread has finished
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.lock().completed
    }
}

//! Execution flows.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use atrium_core::FlowId;

use crate::thread::ThreadState;

/// An ordered chain of jobs inside one thread context.
///
/// The flow counts the jobs and reservations holding it. When the count
/// drops to zero the owning thread is told the flow finished.
pub struct Flow {
    id: FlowId,
    thread: Arc<ThreadState>,
    active: AtomicUsize,
    cancelled: AtomicBool,
}

impl Flow {
    /// Only [`ThreadState::new_flow`] creates flows, so the thread has
    /// already counted this one.
    pub(crate) fn new(thread: Arc<ThreadState>) -> Arc<Self> {
        Arc::new(Self {
            id: FlowId::new(),
            thread,
            active: AtomicUsize::new(1),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Flow identifier
    #[must_use]
    pub fn id(&self) -> FlowId {
        self.id
    }

    /// Owning thread context
    #[must_use]
    pub fn thread(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    /// Add a holder
    pub fn retain(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a holder, completing the flow on the last one
    pub fn release(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::trace!(flow = %self.id, thread = %self.thread.id(), "flow complete");
            self.thread.flow_complete();
        }
    }

    /// Stop running further jobs of this flow
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the flow was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Holders still outstanding
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

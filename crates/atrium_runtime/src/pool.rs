//! Threaded teams.
//!
//! All three variants share one worker group: a fixed set of named OS
//! threads pulling from work queues. They differ only in how many threads
//! there are and how jobs map onto queues.

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::job::Job;
use crate::queue::JobQueue;
use crate::team::{Team, TeamError};

/// How long an idle worker blocks before re-checking for shutdown
const IDLE_POLL: Duration = Duration::from_millis(100);

struct WorkerGroup {
    name: String,
    threads: usize,
    queues: Vec<Arc<JobQueue>>,
    running: Arc<AtomicBool>,
    started: AtomicBool,
    stopped: AtomicBool,
    live: Arc<AtomicUsize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    workers: Mutex<Vec<ThreadId>>,
    drained: Mutex<bool>,
    drained_signal: Condvar,
    exited_tx: Sender<()>,
    exited_rx: Receiver<()>,
    grace: Duration,
}

impl WorkerGroup {
    fn new(name: &str, threads: usize, queue_count: usize, grace: Duration) -> Self {
        let (exited_tx, exited_rx) = unbounded();
        Self {
            name: name.to_string(),
            threads: threads.max(1),
            queues: (0..queue_count.max(1)).map(|_| Arc::new(JobQueue::new())).collect(),
            running: Arc::new(AtomicBool::new(true)),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            live: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            drained: Mutex::new(false),
            drained_signal: Condvar::new(),
            exited_tx,
            exited_rx,
            grace,
        }
    }

    fn start(&self) -> Result<(), TeamError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TeamError::Stopped {
                name: self.name.clone(),
            });
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut handles = self.handles.lock();
        for worker in 0..self.threads {
            let queue = Arc::clone(&self.queues[worker % self.queues.len()]);
            let running = Arc::clone(&self.running);
            let live = Arc::clone(&self.live);
            let exited = self.exited_tx.clone();
            let team = self.name.clone();

            live.fetch_add(1, Ordering::AcqRel);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, worker))
                .spawn(move || {
                    run_worker(&team, &queue, &running);
                    live.fetch_sub(1, Ordering::AcqRel);
                    let _ = exited.send(());
                });

            match spawned {
                Ok(handle) => {
                    self.workers.lock().push(handle.thread().id());
                    handles.push(handle);
                }
                Err(error) => {
                    self.live.fetch_sub(1, Ordering::AcqRel);
                    return Err(TeamError::SpawnFailed {
                        name: self.name.clone(),
                        reason: error.to_string(),
                    });
                }
            }
        }
        tracing::debug!(team = %self.name, threads = self.threads, "workers started");
        Ok(())
    }

    fn enqueue(&self, queue: usize, job: Box<dyn Job>) {
        if self.stopped.load(Ordering::Acquire) && self.live.load(Ordering::Acquire) == 0 {
            tracing::warn!(team = %self.name, "job assigned to a stopped team will not run");
        }
        self.queues[queue % self.queues.len()].enqueue(job);
    }

    /// Stop and drain. The first caller drains; later callers wait for it,
    /// except on a worker thread of this team.
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            self.await_drained();
            return;
        }
        self.running.store(false, Ordering::Release);

        let handles = std::mem::take(&mut *self.handles.lock());
        for worker in 0..handles.len() {
            self.queues[worker % self.queues.len()].wake_up();
        }

        // A worker stopping its own team cannot wait for itself
        let current = std::thread::current().id();
        let (own, others): (Vec<_>, Vec<_>) = handles
            .into_iter()
            .partition(|handle| handle.thread().id() == current);
        drop(own);

        let deadline = Instant::now() + self.grace;
        let mut exited = 0;
        while exited < others.len() {
            match self.exited_rx.recv_deadline(deadline) {
                Ok(()) => exited += 1,
                Err(_) => break,
            }
        }

        if exited == others.len() {
            for handle in others {
                let _ = handle.join();
            }
        } else {
            tracing::warn!(
                team = %self.name,
                remaining = others.len() - exited,
                grace_ms = self.grace.as_millis() as u64,
                "grace period elapsed before workers drained"
            );
        }

        let abandoned: usize = self.queues.iter().map(|queue| queue.drain().len()).sum();
        if abandoned > 0 {
            tracing::debug!(team = %self.name, abandoned, "discarded jobs of a team that never ran them");
        }

        *self.drained.lock() = true;
        self.drained_signal.notify_all();
    }

    fn await_drained(&self) {
        let current = std::thread::current().id();
        if self.workers.lock().contains(&current) {
            return;
        }
        let deadline = Instant::now() + self.grace;
        {
            let mut drained = self.drained.lock();
            while !*drained {
                if self.drained_signal.wait_until(&mut drained, deadline).timed_out() {
                    return;
                }
            }
        }
        // a worker that stopped its own team exits after its job returns
        while self.live.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            let _ = self.exited_rx.recv_deadline(deadline.min(Instant::now() + IDLE_POLL));
        }
    }

    fn live_workers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn queued(&self) -> usize {
        self.queues.iter().map(|queue| queue.len()).sum()
    }
}

fn run_worker(team: &str, queue: &JobQueue, running: &AtomicBool) {
    loop {
        match queue.dequeue_timeout(IDLE_POLL) {
            Some(job) => execute(team, job),
            None => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
            }
        }
    }
}

fn execute(team: &str, job: Box<dyn Job>) {
    if catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
        tracing::error!(team = %team, "job panicked; worker continues");
    }
}

macro_rules! delegate_introspection {
    ($team:ty) => {
        impl $team {
            /// Worker threads currently alive
            #[must_use]
            pub fn live_workers(&self) -> usize {
                self.group.live_workers()
            }

            /// Jobs waiting in the team's queues
            #[must_use]
            pub fn queued(&self) -> usize {
                self.group.queued()
            }
        }
    };
}

/// Team with exactly one worker thread
pub struct OnePersonTeam {
    group: WorkerGroup,
}

impl OnePersonTeam {
    /// Create a single-threaded team
    #[must_use]
    pub fn new(name: &str, grace: Duration) -> Self {
        Self {
            group: WorkerGroup::new(name, 1, 1, grace),
        }
    }
}

delegate_introspection!(OnePersonTeam);

impl Team for OnePersonTeam {
    fn name(&self) -> &str {
        &self.group.name
    }

    fn start(&self) -> Result<(), TeamError> {
        self.group.start()
    }

    fn assign(&self, job: Box<dyn Job>) {
        self.group.enqueue(0, job);
    }

    fn stop(&self) {
        self.group.stop();
    }
}

/// Team of N worker threads sharing one queue
pub struct ExecutorTeam {
    group: WorkerGroup,
}

impl ExecutorTeam {
    /// Create a team of `threads` workers
    #[must_use]
    pub fn new(name: &str, threads: usize, grace: Duration) -> Self {
        Self {
            group: WorkerGroup::new(name, threads, 1, grace),
        }
    }
}

delegate_introspection!(ExecutorTeam);

impl Team for ExecutorTeam {
    fn name(&self) -> &str {
        &self.group.name
    }

    fn start(&self) -> Result<(), TeamError> {
        self.group.start()
    }

    fn assign(&self, job: Box<dyn Job>) {
        self.group.enqueue(0, job);
    }

    fn stop(&self) {
        self.group.stop();
    }
}

/// Team of N worker threads, each with its own queue.
///
/// A job always lands on the worker selected by its affinity key, so jobs of
/// one thread context stay on one OS thread.
pub struct AffinityTeam {
    group: WorkerGroup,
}

impl AffinityTeam {
    /// Create a team of `threads` workers with one queue each
    #[must_use]
    pub fn new(name: &str, threads: usize, grace: Duration) -> Self {
        let threads = threads.max(1);
        Self {
            group: WorkerGroup::new(name, threads, threads, grace),
        }
    }
}

delegate_introspection!(AffinityTeam);

impl Team for AffinityTeam {
    fn name(&self) -> &str {
        &self.group.name
    }

    fn start(&self) -> Result<(), TeamError> {
        self.group.start()
    }

    fn assign(&self, job: Box<dyn Job>) {
        let slot = (job.affinity() % self.group.queues.len() as u64) as usize;
        self.group.enqueue(slot, job);
    }

    fn stop(&self) {
        self.group.stop();
    }
}

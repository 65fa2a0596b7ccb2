//! Opaque unit of work handed to teams.

/// A single pending unit of work.
///
/// Teams know nothing about what a job does: they take ownership, run it once
/// and drop it. Running consumes the job, so it can never be delivered twice.
pub trait Job: Send + 'static {
    /// Execute the job on the current thread
    fn run(self: Box<Self>);

    /// Key used by affinity teams to keep related jobs on one worker
    fn affinity(&self) -> u64 {
        0
    }
}

impl<F> Job for F
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        (*self)()
    }
}

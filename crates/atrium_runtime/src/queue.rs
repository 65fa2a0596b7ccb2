//! Work queue handing jobs from producers to a team's worker threads.
//!
//! FIFO, safe for any number of producers. Each item is delivered to exactly
//! one consumer. A consumer blocked in [`WorkQueue::dequeue_timeout`] can be
//! woken without adding work, which is how workers notice shutdown.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::job::Job;

/// Queue of boxed jobs, as used by the threaded teams
pub type JobQueue = WorkQueue<Box<dyn Job>>;

struct QueueInner<T> {
    items: VecDeque<T>,
    /// Consumers blocked in `dequeue_timeout`
    waiting: usize,
    /// Wake-ups owed to blocked consumers, never more than `waiting`
    wakeups: usize,
}

/// Thread-safe FIFO queue
pub struct WorkQueue<T> {
    inner: Mutex<QueueInner<T>>,
    available: Condvar,
}

impl<T> WorkQueue<T> {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                waiting: 0,
                wakeups: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Append an item and wake one blocked consumer
    pub fn enqueue(&self, item: T) {
        let mut inner = self.inner.lock();
        inner.items.push_back(item);
        drop(inner);
        self.available.notify_one();
    }

    /// Take the oldest item without blocking
    pub fn dequeue(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Take the oldest item, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout, or early when [`WorkQueue::wake_up`] was
    /// called while this consumer was blocked on the empty queue.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.wakeups > 0 {
                inner.wakeups -= 1;
                return None;
            }
            inner.waiting += 1;
            let timed_out = self.available.wait_until(&mut inner, deadline).timed_out();
            inner.waiting -= 1;
            if inner.wakeups > inner.waiting {
                inner.wakeups = inner.waiting;
            }
            if timed_out {
                return inner.items.pop_front();
            }
        }
    }

    /// Force one blocked consumer to return and re-check its state.
    ///
    /// Only consumers blocked at the time of the call are affected. With none
    /// blocked the call does nothing; a later `dequeue_timeout` waits as usual.
    pub fn wake_up(&self) {
        let mut inner = self.inner.lock();
        if inner.wakeups >= inner.waiting {
            return;
        }
        inner.wakeups += 1;
        drop(inner);
        self.available.notify_one();
    }

    /// Number of queued items
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the queue holds no items
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Remove every queued item, returning them in FIFO order
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().items.drain(..).collect()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_queue_fifo() {
        let queue = WorkQueue::new();
        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(3));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dequeue_timeout_empty() {
        let queue: WorkQueue<u32> = WorkQueue::new();
        let start = Instant::now();
        assert_eq!(queue.dequeue_timeout(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_dequeue_timeout_receives_late_item() {
        let queue = Arc::new(WorkQueue::new());
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.enqueue(42u32);
        });
        assert_eq!(queue.dequeue_timeout(Duration::from_secs(5)), Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn test_wake_up_releases_blocked_consumer() {
        let queue: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new());
        let consumer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let item = consumer.dequeue_timeout(Duration::from_secs(30));
            (item, start.elapsed())
        });
        while !handle.is_finished() {
            queue.wake_up();
            std::thread::sleep(Duration::from_millis(5));
        }
        let (item, waited) = handle.join().unwrap();
        assert_eq!(item, None);
        assert!(waited < Duration::from_secs(30));
    }

    #[test]
    fn test_wake_up_does_not_hide_items() {
        let queue = WorkQueue::new();
        queue.wake_up();
        queue.enqueue(7u32);
        assert_eq!(queue.dequeue_timeout(Duration::from_millis(10)), Some(7));
    }

    #[test]
    fn test_wake_up_without_blocked_consumer_is_not_banked() {
        let queue: WorkQueue<u32> = WorkQueue::new();
        queue.wake_up();
        queue.wake_up();
        let start = Instant::now();
        assert_eq!(queue.dequeue_timeout(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_drain() {
        let queue = WorkQueue::new();
        queue.enqueue("a");
        queue.enqueue("b");
        assert_eq!(queue.drain(), vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_producers_at_most_once() {
        let queue = Arc::new(WorkQueue::new());
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        queue.enqueue(p * 1_000 + i);
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(item) = queue.dequeue_timeout(Duration::from_millis(200)) {
                        seen.push(item);
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let per_consumer: Vec<Vec<u64>> = consumers.into_iter().map(|c| c.join().unwrap()).collect();

        let mut unique = HashSet::new();
        let mut total = 0;
        for seen in &per_consumer {
            // each consumer observes every producer's items in production order
            for p in 0..4u64 {
                let from_p: Vec<u64> = seen.iter().copied().filter(|v| v / 1_000 == p).collect();
                assert!(from_p.windows(2).all(|w| w[0] < w[1]));
            }
            total += seen.len();
            unique.extend(seen.iter().copied());
        }
        assert_eq!(total, 2_000);
        assert_eq!(unique.len(), 2_000);
    }

    proptest! {
        #[test]
        fn prop_single_consumer_sees_enqueue_order(items in proptest::collection::vec(any::<u32>(), 0..200)) {
            let queue = WorkQueue::new();
            for item in &items {
                queue.enqueue(*item);
            }
            let mut out = Vec::new();
            while let Some(item) = queue.dequeue() {
                out.push(item);
            }
            prop_assert_eq!(out, items);
        }

        #[test]
        fn prop_interleaved_operations_preserve_order(ops in proptest::collection::vec(any::<Option<u16>>(), 0..300)) {
            // Some(v) enqueues v, None dequeues
            let queue = WorkQueue::new();
            let mut model = std::collections::VecDeque::new();
            for op in ops {
                match op {
                    Some(v) => {
                        queue.enqueue(v);
                        model.push_back(v);
                    }
                    None => prop_assert_eq!(queue.dequeue(), model.pop_front()),
                }
            }
            prop_assert_eq!(queue.len(), model.len());
        }
    }
}

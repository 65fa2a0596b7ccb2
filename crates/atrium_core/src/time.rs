//! Logical time for ATRIUM.
//!
//! Object sourcing is stamped with logical time rather than the wall clock,
//! so dependency ordering can be checked without timing noise.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Logical time - monotonically increasing counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalTime(u64);

impl std::fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Shared logical clock.
///
/// Every call to [`LogicalClock::tick`] returns a strictly greater time than
/// any previous call, across threads.
#[derive(Debug, Default)]
pub struct LogicalClock {
    current: AtomicU64,
}

impl LogicalClock {
    /// Create a clock at zero
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
        }
    }

    /// Advance the clock and return the new time
    pub fn tick(&self) -> LogicalTime {
        LogicalTime(self.current.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

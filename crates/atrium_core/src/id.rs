//! Unique identifiers for ATRIUM execution units.
//!
//! Every process, thread context and flow gets a random UUID. Identifiers
//! render with a short prefix so log lines stay readable.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Stable 64-bit key derived from the identifier.
            ///
            /// Used to route work with affinity to a fixed worker.
            #[must_use]
            pub fn affinity_key(&self) -> u64 {
                let (high, low) = self.0.as_u64_pair();
                high ^ low
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Process identifier - one top-level unit of work
    ProcessId,
    "proc"
);

define_id!(
    /// Thread context identifier - one logical line of control in a process
    ThreadId,
    "thr"
);

define_id!(
    /// Flow identifier - one ordered chain of jobs in a thread context
    FlowId,
    "flow"
);

//! ATRIUM Core Types
//!
//! Pure types shared by the runtime and its hosts: identifiers for the
//! nested units of execution, the logical clock used to stamp object
//! sourcing, and the core error type. No threads and no I/O live here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod id;
pub mod time;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use id::{FlowId, ProcessId, ThreadId};
pub use time::{LogicalClock, LogicalTime};

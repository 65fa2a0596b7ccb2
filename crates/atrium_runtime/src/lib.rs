//! ATRIUM Runtime
//!
//! Executes graphs of managed functions on pluggable teams of worker
//! threads. Functions declare the objects they need, the governance they
//! activate and the escalations they handle; the runtime sources objects
//! (synchronously or asynchronously, coordinating dependencies), routes
//! escalations outward through thread, process and system levels, and tears
//! everything down in reverse sourcing order when a process completes.
//!
//! An [`OfficeBuilder`] validates the graph into an [`Office`], which
//! triggers processes by function name.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::any::Any;
use std::sync::Arc;

mod asset;
mod executor;

pub mod config;
pub mod escalation;
pub mod flow;
pub mod function;
pub mod governance;
pub mod job;
pub mod monitor;
pub mod object;
pub mod office;
pub mod pool;
pub mod process;
pub mod queue;
pub mod source;
pub mod team;
pub mod thread;

/// Type-erased value passed between functions, objects and escalations
pub type Value = Arc<dyn Any + Send + Sync>;

// Re-exports
pub use config::{ConfigError, RuntimeConfig, TeamDefinition, TeamKind};
pub use escalation::{Escalation, EscalationHandler, EscalationType, LoggingEscalationHandler, SourceTimeout};
pub use function::{FlowMode, FunctionBuilder, FunctionContext, FunctionIndex, ManagedFunction, ManagedFunctionFactory};
pub use governance::{DeactivationStrategy, Governance, GovernanceBuilder, GovernanceFactory};
pub use job::Job;
pub use monitor::{MetricsSnapshot, RuntimeMetrics};
pub use object::{ContainerState, ManagedObjectBuilder, ObjectIndex, ObjectScope};
pub use office::{
    ConfigurationError, ExecuteContext, Office, OfficeBuilder, OfficeError, ProcessCompletion, ProcessListener,
};
pub use pool::{AffinityTeam, ExecutorTeam, OnePersonTeam};
pub use process::ProcessManager;
pub use queue::WorkQueue;
pub use source::{ManagedObjectSource, SourceContext, SyncSource};
pub use team::{PassiveTeam, Team, TeamError, TeamRegistry};

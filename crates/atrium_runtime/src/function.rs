//! Managed functions: the units of work an office executes.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use atrium_core::{ProcessId, ThreadId};

use crate::escalation::{Escalation, EscalationParameter, EscalationProcedure};
use crate::governance::DeactivationStrategy;
use crate::object::ObjectIndex;
use crate::process::{CompletionListener, ProcessState};
use crate::team::Team;
use crate::thread::ThreadState;
use crate::Value;

/// Position of a function in its office
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionIndex(pub usize);

impl fmt::Display for FunctionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// Executable body of a function.
///
/// Returning `Ok(value)` continues the flow with the function's `next`
/// (receiving `value` as its parameter) or ends the branch when there is
/// none. Returning `Err` raises the escalation.
pub trait ManagedFunction: Send + Sync {
    /// Run the function once
    ///
    /// # Errors
    ///
    /// Returns the escalation to raise
    fn execute(&self, context: &mut FunctionContext<'_>) -> Result<Option<Value>, Escalation>;
}

impl<F> ManagedFunction for F
where
    F: Fn(&mut FunctionContext<'_>) -> Result<Option<Value>, Escalation> + Send + Sync,
{
    fn execute(&self, context: &mut FunctionContext<'_>) -> Result<Option<Value>, Escalation> {
        self(context)
    }
}

/// Produces the executable instance for each execution
pub trait ManagedFunctionFactory: Send + Sync {
    /// Create an instance
    fn create(&self) -> Arc<dyn ManagedFunction>;
}

/// Factory handing out one shared stateless instance
struct SharedFunction(Arc<dyn ManagedFunction>);

impl ManagedFunctionFactory for SharedFunction {
    fn create(&self) -> Arc<dyn ManagedFunction> {
        Arc::clone(&self.0)
    }
}

/// How an instigated flow relates to the invoking function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    /// Runs in the same flow once the invoking function returns, before its `next`
    Sequential,
    /// New flow in the same thread; the invoker does not wait
    Parallel,
    /// New thread, or new process when `new_process` is set.
    ///
    /// With a `callback` (an index into the invoking function's flows) the
    /// invoking thread stays open until the spawned work completes, then
    /// runs the callback with the spawned work's escalation, if any.
    Spawn {
        /// Start a separate process instead of a thread in this one
        new_process: bool,
        /// Flow to run on completion
        callback: Option<usize>,
    },
}

pub(crate) struct Instigation {
    pub(crate) function: FunctionIndex,
    pub(crate) callback: Option<FunctionIndex>,
    pub(crate) parameter: Option<Value>,
    pub(crate) mode: FlowMode,
}

/// What a function sees while it executes
pub struct FunctionContext<'a> {
    function: &'a FunctionMetaData,
    parameter: Option<Value>,
    objects: Vec<Value>,
    process: &'a Arc<ProcessState>,
    thread: &'a Arc<ThreadState>,
    instigations: Vec<Instigation>,
    listeners: Vec<CompletionListener>,
}

impl<'a> FunctionContext<'a> {
    pub(crate) fn new(
        function: &'a FunctionMetaData,
        parameter: Option<Value>,
        objects: Vec<Value>,
        process: &'a Arc<ProcessState>,
        thread: &'a Arc<ThreadState>,
    ) -> Self {
        Self {
            function,
            parameter,
            objects,
            process,
            thread,
            instigations: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Name of the executing function
    #[must_use]
    pub fn function_name(&self) -> &str {
        &self.function.name
    }

    /// Owning process
    #[must_use]
    pub fn process_id(&self) -> ProcessId {
        self.process.id()
    }

    /// Owning thread context
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread.id()
    }

    /// Raw parameter
    #[must_use]
    pub fn parameter(&self) -> Option<&Value> {
        self.parameter.as_ref()
    }

    /// Parameter downcast to a concrete type
    #[must_use]
    pub fn parameter_as<T: Any>(&self) -> Option<&T> {
        self.parameter.as_deref().and_then(|p| p.downcast_ref::<T>())
    }

    /// Object at position `index` of the function's declared objects
    ///
    /// # Errors
    ///
    /// Returns a `Failure` escalation if the index is out of range or the
    /// object is not a `T`
    pub fn object<T: Any>(&self, index: usize) -> Result<&T, Escalation> {
        self.object_value(index)?.downcast_ref::<T>().ok_or_else(|| {
            Escalation::failure(format!(
                "Object {} of {} is not a {}",
                index,
                self.function.name,
                std::any::type_name::<T>()
            ))
        })
    }

    /// Shared handle to the object at position `index`
    ///
    /// # Errors
    ///
    /// Returns a `Failure` escalation if the index is out of range
    pub fn object_value(&self, index: usize) -> Result<&Value, Escalation> {
        self.objects.get(index).ok_or_else(|| {
            Escalation::failure(format!(
                "Function {} declares {} objects, asked for {}",
                self.function.name,
                self.objects.len(),
                index
            ))
        })
    }

    /// Instigate the function's flow `flow` once this function returns
    ///
    /// # Errors
    ///
    /// Returns a `Failure` escalation if the flow or callback index is not
    /// declared by the function
    pub fn do_flow(&mut self, flow: usize, parameter: Option<Value>, mode: FlowMode) -> Result<(), Escalation> {
        let function = self.flow_function(flow)?;
        let callback = match mode {
            FlowMode::Spawn {
                callback: Some(index),
                ..
            } => Some(self.flow_function(index)?),
            _ => None,
        };
        self.instigations.push(Instigation {
            function,
            callback,
            parameter,
            mode,
        });
        Ok(())
    }

    /// Register a listener invoked once when the process completes
    pub fn on_process_complete(
        &mut self,
        listener: impl FnOnce(ProcessId, Option<&Escalation>) + Send + 'static,
    ) {
        self.listeners.push(Box::new(listener));
    }

    fn flow_function(&self, flow: usize) -> Result<FunctionIndex, Escalation> {
        self.function.flows.get(flow).copied().ok_or_else(|| {
            Escalation::failure(format!(
                "Function {} has no flow {}",
                self.function.name, flow
            ))
        })
    }

    pub(crate) fn into_parts(self) -> (Vec<Instigation>, Vec<CompletionListener>) {
        (self.instigations, self.listeners)
    }
}

/// Resolved, immutable function descriptor
pub(crate) struct FunctionMetaData {
    pub(crate) name: String,
    pub(crate) index: FunctionIndex,
    pub(crate) team_name: String,
    pub(crate) team: Arc<dyn Team>,
    pub(crate) factory: Arc<dyn ManagedFunctionFactory>,
    pub(crate) objects: Vec<ObjectIndex>,
    pub(crate) governance: Vec<usize>,
    pub(crate) deactivate: Vec<(usize, DeactivationStrategy)>,
    pub(crate) escalations: EscalationProcedure,
    pub(crate) next: Option<FunctionIndex>,
    pub(crate) flows: Vec<FunctionIndex>,
}

impl FunctionMetaData {
    /// Governance indices this function touches, activation or deactivation
    pub(crate) fn governance_touched(&self) -> impl Iterator<Item = usize> + '_ {
        self.governance
            .iter()
            .copied()
            .chain(self.deactivate.iter().map(|(index, _)| *index))
    }
}

/// Declares a function for [`OfficeBuilder`](crate::office::OfficeBuilder).
///
/// Everything refers to other items by name; the office resolves and
/// validates the names when it is built.
pub struct FunctionBuilder {
    pub(crate) name: String,
    pub(crate) factory: Arc<dyn ManagedFunctionFactory>,
    pub(crate) team: Option<String>,
    pub(crate) objects: Vec<ObjectIndex>,
    pub(crate) governance: Vec<usize>,
    pub(crate) deactivate: Vec<(usize, DeactivationStrategy)>,
    pub(crate) escalations: Vec<(String, String, EscalationParameter)>,
    pub(crate) next: Option<String>,
    pub(crate) flows: Vec<String>,
}

impl FunctionBuilder {
    /// Function backed by a closure
    #[must_use]
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&mut FunctionContext<'_>) -> Result<Option<Value>, Escalation> + Send + Sync + 'static,
    {
        Self::from_function(name, function)
    }

    /// Function backed by one shared stateless instance
    #[must_use]
    pub fn from_function(name: impl Into<String>, function: impl ManagedFunction + 'static) -> Self {
        Self::with_factory(name, Arc::new(SharedFunction(Arc::new(function))))
    }

    /// Function whose instances come from a factory
    #[must_use]
    pub fn with_factory(name: impl Into<String>, factory: Arc<dyn ManagedFunctionFactory>) -> Self {
        Self {
            name: name.into(),
            factory,
            team: None,
            objects: Vec::new(),
            governance: Vec::new(),
            deactivate: Vec::new(),
            escalations: Vec::new(),
            next: None,
            flows: Vec::new(),
        }
    }

    /// Run on the named team instead of the default one
    #[must_use]
    pub fn team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    /// Require an object; objects are handed over in declaration order
    #[must_use]
    pub fn object(mut self, object: ObjectIndex) -> Self {
        self.objects.push(object);
        self
    }

    /// Activate a governance before executing
    #[must_use]
    pub fn govern(mut self, governance: usize) -> Self {
        self.governance.push(governance);
        self
    }

    /// Deactivate a governance after executing
    #[must_use]
    pub fn deactivate(mut self, governance: usize, strategy: DeactivationStrategy) -> Self {
        self.deactivate.push((governance, strategy));
        self
    }

    /// Handle an escalation type with the named function
    #[must_use]
    pub fn escalation(mut self, kind: impl Into<String>, handler: impl Into<String>) -> Self {
        self.escalations
            .push((kind.into(), handler.into(), EscalationParameter::Escalation));
        self
    }

    /// Handle an escalation type, passing its cause to the handler
    #[must_use]
    pub fn escalation_cause(mut self, kind: impl Into<String>, handler: impl Into<String>) -> Self {
        self.escalations
            .push((kind.into(), handler.into(), EscalationParameter::Cause));
        self
    }

    /// Function continuing the flow with this function's return value
    #[must_use]
    pub fn next(mut self, function: impl Into<String>) -> Self {
        self.next = Some(function.into());
        self
    }

    /// Declare a flow; its index is the number of flows declared before it
    #[must_use]
    pub fn flow(mut self, function: impl Into<String>) -> Self {
        self.flows.push(function.into());
        self
    }
}

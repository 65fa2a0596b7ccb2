//! Managed object sources: where container objects come from.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use atrium_core::{LogicalTime, ProcessId};

use crate::escalation::Escalation;
use crate::object::ManagedObjectContainer;
use crate::office::ExecuteContext;
use crate::process::ProcessState;
use crate::Value;

/// Produces objects for containers.
///
/// `source_object` either provides the object before returning
/// (synchronous) or keeps the [`SourceContext`] and calls
/// [`SourceContext::ready`] or [`SourceContext::fail`] later from any thread
/// (asynchronous objects only).
pub trait ManagedObjectSource: Send + Sync {
    /// Called once when the office is built
    ///
    /// # Errors
    ///
    /// Returns an escalation describing why the source is unusable; the
    /// office then refuses to build
    fn init(&self, _object: &str) -> Result<(), Escalation> {
        Ok(())
    }

    /// Called when the office opens
    fn start(&self, _context: ExecuteContext) {}

    /// Begin producing one object
    ///
    /// # Errors
    ///
    /// Returns the escalation that fails the container
    fn source_object(&self, context: SourceContext) -> Result<(), Escalation>;

    /// Take back an object at teardown, along with escalations raised while
    /// it was in use, so the source can decide between reuse and discard
    fn recycle(&self, _object: Value, _cleanup: &[Escalation]) {}

    /// Called when the office closes
    fn stop(&self) {}
}

/// Handle a source uses to complete one sourcing request
#[derive(Clone)]
pub struct SourceContext {
    container: Arc<ManagedObjectContainer>,
    process: Weak<ProcessState>,
    dependencies: Arc<[Value]>,
}

impl SourceContext {
    pub(crate) fn new(
        container: Arc<ManagedObjectContainer>,
        process: Weak<ProcessState>,
        dependencies: Vec<Value>,
    ) -> Self {
        Self {
            container,
            process,
            dependencies: dependencies.into(),
        }
    }

    /// Name of the object being sourced
    #[must_use]
    pub fn object_name(&self) -> &str {
        self.container.name()
    }

    /// Process the object belongs to, if it is still running
    #[must_use]
    pub fn process_id(&self) -> Option<ProcessId> {
        self.process.upgrade().map(|process| process.id())
    }

    /// Ready dependency at position `index` of the declared dependencies
    #[must_use]
    pub fn dependency(&self, index: usize) -> Option<&Value> {
        self.dependencies.get(index)
    }

    /// Dependency downcast to a concrete type
    #[must_use]
    pub fn dependency_as<T: Any>(&self, index: usize) -> Option<&T> {
        self.dependency(index).and_then(|value| value.downcast_ref::<T>())
    }

    /// Provide the object.
    ///
    /// Returns the logical time the container became ready. Returns `None`
    /// when the container already failed or was unloaded; the object is then
    /// recycled immediately.
    pub fn ready(&self, object: Value) -> Option<LogicalTime> {
        let process = self.process.upgrade();
        self.container.ready(object, process.as_deref())
    }

    /// Fail the container
    pub fn fail(&self, escalation: Escalation) {
        self.container.fail(escalation);
    }
}

impl fmt::Debug for SourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceContext")
            .field("object", &self.object_name())
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

/// Synchronous source built from a closure
pub struct SyncSource<F> {
    produce: F,
}

impl<F> SyncSource<F>
where
    F: Fn(&SourceContext) -> Result<Value, Escalation> + Send + Sync,
{
    /// Wrap a closure producing the object
    #[must_use]
    pub fn new(produce: F) -> Self {
        Self { produce }
    }
}

impl<F> ManagedObjectSource for SyncSource<F>
where
    F: Fn(&SourceContext) -> Result<Value, Escalation> + Send + Sync,
{
    fn source_object(&self, context: SourceContext) -> Result<(), Escalation> {
        let object = (self.produce)(&context)?;
        context.ready(object);
        Ok(())
    }
}

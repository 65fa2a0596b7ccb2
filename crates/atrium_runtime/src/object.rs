//! Managed object containers.
//!
//! Each container drives one dependency through
//! `Unsourced -> Sourcing -> Ready -> Recycling -> Unloaded`, with `Failed`
//! reachable while sourcing. Jobs needing an object that is still sourcing
//! park in the container's [`AssetMonitor`] instead of blocking their worker.

use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use atrium_core::LogicalTime;

use crate::asset::AssetMonitor;
use crate::escalation::Escalation;
use crate::executor::{panic_message, FunctionJob};
use crate::process::ProcessState;
use crate::source::{ManagedObjectSource, SourceContext};
use crate::thread::ThreadState;
use crate::Value;

/// Lifetime an object is shared across
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectScope {
    /// One instance per process
    Process,
    /// One instance per thread context
    Thread,
}

/// Scope plus slot of an object within its office
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIndex {
    /// Scope
    pub scope: ObjectScope,
    /// Slot within the scope
    pub slot: usize,
}

impl ObjectIndex {
    /// Process-scoped slot
    #[must_use]
    pub fn process(slot: usize) -> Self {
        Self {
            scope: ObjectScope::Process,
            slot,
        }
    }

    /// Thread-scoped slot
    #[must_use]
    pub fn thread(slot: usize) -> Self {
        Self {
            scope: ObjectScope::Thread,
            slot,
        }
    }
}

impl fmt::Display for ObjectIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            ObjectScope::Process => write!(f, "process[{}]", self.slot),
            ObjectScope::Thread => write!(f, "thread[{}]", self.slot),
        }
    }
}

/// Container lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Nothing requested yet
    Unsourced,
    /// Source invoked, object not yet provided
    Sourcing,
    /// Object available
    Ready,
    /// Object being handed back to its source
    Recycling,
    /// Torn down
    Unloaded,
    /// Sourcing failed
    Failed,
}

/// Declares an object for [`OfficeBuilder`](crate::office::OfficeBuilder)
pub struct ManagedObjectBuilder {
    pub(crate) name: String,
    pub(crate) source: Arc<dyn ManagedObjectSource>,
    pub(crate) scope: ObjectScope,
    pub(crate) dependencies: Vec<ObjectIndex>,
    pub(crate) asynchronous: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) governance: Vec<usize>,
}

impl ManagedObjectBuilder {
    /// Process-scoped, synchronous object
    #[must_use]
    pub fn new(name: impl Into<String>, source: impl ManagedObjectSource + 'static) -> Self {
        Self::from_source(name, Arc::new(source))
    }

    /// Object backed by a shared source
    #[must_use]
    pub fn from_source(name: impl Into<String>, source: Arc<dyn ManagedObjectSource>) -> Self {
        Self {
            name: name.into(),
            source,
            scope: ObjectScope::Process,
            dependencies: Vec::new(),
            asynchronous: false,
            timeout: None,
            governance: Vec::new(),
        }
    }

    /// Set the scope
    #[must_use]
    pub fn scope(mut self, scope: ObjectScope) -> Self {
        self.scope = scope;
        self
    }

    /// Require another object to be ready before this one is sourced
    #[must_use]
    pub fn depends_on(mut self, dependency: ObjectIndex) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// The source may return before providing the object
    #[must_use]
    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Asynchronous, failing with `SourceTimeout` if not ready in time
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.asynchronous = true;
        self.timeout = Some(timeout);
        self
    }

    /// Bind the object to a governance whenever that governance is active
    #[must_use]
    pub fn governed_by(mut self, governance: usize) -> Self {
        self.governance.push(governance);
        self
    }
}

/// Resolved object descriptor
pub(crate) struct ManagedObjectMetaData {
    pub(crate) name: String,
    pub(crate) index: ObjectIndex,
    pub(crate) source: Arc<dyn ManagedObjectSource>,
    pub(crate) dependencies: Vec<ObjectIndex>,
    pub(crate) asynchronous: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) governance: Vec<usize>,
}

struct ContainerInner {
    state: ContainerState,
    object: Option<Value>,
    failure: Option<Escalation>,
    sourced_at: Option<LogicalTime>,
    monitor: AssetMonitor,
}

/// Lifecycle of one object instance
pub struct ManagedObjectContainer {
    meta: Arc<ManagedObjectMetaData>,
    inner: Mutex<ContainerInner>,
}

impl ManagedObjectContainer {
    pub(crate) fn new(meta: Arc<ManagedObjectMetaData>) -> Self {
        Self {
            meta,
            inner: Mutex::new(ContainerInner {
                state: ContainerState::Unsourced,
                object: None,
                failure: None,
                sourced_at: None,
                monitor: AssetMonitor::new(),
            }),
        }
    }

    pub(crate) fn meta(&self) -> &Arc<ManagedObjectMetaData> {
        &self.meta
    }

    /// Object name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.inner.lock().state
    }

    /// Object, when ready
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        let inner = self.inner.lock();
        match inner.state {
            ContainerState::Ready => inner.object.clone(),
            _ => None,
        }
    }

    /// Failure, when failed
    #[must_use]
    pub fn failure(&self) -> Option<Escalation> {
        self.inner.lock().failure.clone()
    }

    /// Logical time the object became ready
    #[must_use]
    pub fn sourced_at(&self) -> Option<LogicalTime> {
        self.inner.lock().sourced_at
    }

    pub(crate) fn begin_sourcing(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ContainerState::Unsourced {
            return false;
        }
        inner.state = ContainerState::Sourcing;
        true
    }

    /// Provide the object. Returns the ready stamp, or `None` when the
    /// container no longer accepts it, in which case the object goes straight
    /// back to its source.
    pub(crate) fn ready(&self, object: Value, process: Option<&ProcessState>) -> Option<LogicalTime> {
        let mut inner = self.inner.lock();
        let process = match process {
            Some(process) if inner.state == ContainerState::Sourcing => process,
            _ => {
                let cleanup: Vec<Escalation> = inner.failure.iter().cloned().collect();
                let state = inner.state;
                drop(inner);
                tracing::debug!(object = %self.meta.name, ?state, "late object recycled");
                self.recycle(object, &cleanup);
                return None;
            }
        };

        let stamp = process.tick();
        inner.state = ContainerState::Ready;
        inner.object = Some(object);
        inner.sourced_at = Some(stamp);
        let waiters = inner.monitor.take();
        drop(inner);

        process.office().metrics.record_object_sourced();
        tracing::debug!(object = %self.meta.name, process = %process.id(), %stamp, "object ready");
        AssetMonitor::activate(waiters);
        Some(stamp)
    }

    /// Fail a container that is not yet ready, re-queueing its waiters
    pub(crate) fn fail(&self, escalation: Escalation) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, ContainerState::Unsourced | ContainerState::Sourcing) {
            return false;
        }
        tracing::debug!(object = %self.meta.name, escalation = %escalation, "object failed");
        inner.state = ContainerState::Failed;
        inner.failure = Some(escalation);
        let waiters = inner.monitor.take();
        drop(inner);
        AssetMonitor::activate(waiters);
        true
    }

    /// Park a job until the object settles. Hands the job back if it already has.
    pub(crate) fn wait(&self, job: FunctionJob) -> Option<FunctionJob> {
        let mut inner = self.inner.lock();
        if inner.state == ContainerState::Sourcing {
            inner.monitor.wait(job);
            None
        } else {
            Some(job)
        }
    }

    pub(crate) fn take_waiters(&self) -> Vec<FunctionJob> {
        self.inner.lock().monitor.take()
    }

    fn unload(&self, cleanup: &[Escalation]) {
        let mut inner = self.inner.lock();
        match inner.state {
            ContainerState::Ready => {
                inner.state = ContainerState::Recycling;
                let object = inner.object.take();
                drop(inner);
                if let Some(object) = object {
                    self.recycle(object, cleanup);
                }
                self.inner.lock().state = ContainerState::Unloaded;
            }
            ContainerState::Unsourced | ContainerState::Sourcing => {
                inner.state = ContainerState::Unloaded;
            }
            ContainerState::Recycling | ContainerState::Unloaded | ContainerState::Failed => {}
        }
    }

    fn recycle(&self, object: Value, cleanup: &[Escalation]) {
        let source = &self.meta.source;
        if catch_unwind(AssertUnwindSafe(|| source.recycle(object, cleanup))).is_err() {
            tracing::error!(object = %self.meta.name, "recycle panicked");
        }
    }
}

impl fmt::Debug for ManagedObjectContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectContainer")
            .field("name", &self.meta.name)
            .field("index", &self.meta.index)
            .field("state", &self.state())
            .finish()
    }
}

/// Outcome of making a set of objects ready
pub(crate) enum Readiness {
    /// Every object is ready, in the requested order
    Ready(Vec<Value>),
    /// This container is still sourcing; park on it
    Pending(Arc<ManagedObjectContainer>),
    /// An object, or one it depends on, failed
    Failed(Escalation),
}

pub(crate) fn lookup(
    process: &ProcessState,
    thread: &ThreadState,
    index: ObjectIndex,
) -> Option<Arc<ManagedObjectContainer>> {
    let containers = match index.scope {
        ObjectScope::Process => process.objects(),
        ObjectScope::Thread => thread.objects(),
    };
    containers.get(index.slot).cloned()
}

/// Make `required` ready, sourcing dependencies first.
///
/// Depth-first over the dependency graph with an explicit stack. Entries
/// marked expanded are the path from a root to the object being examined,
/// so a failure fails every container on that path too.
pub(crate) fn resolve_objects(
    process: &Arc<ProcessState>,
    thread: &ThreadState,
    required: &[ObjectIndex],
) -> Readiness {
    let mut stack: Vec<(ObjectIndex, bool)> = required.iter().rev().map(|index| (*index, false)).collect();

    while let Some((index, expanded)) = stack.pop() {
        let Some(container) = lookup(process, thread, index) else {
            return Readiness::Failed(Escalation::failure(format!("No object at {}", index)));
        };

        let failure = match container.state() {
            ContainerState::Ready => continue,
            ContainerState::Sourcing => return Readiness::Pending(container),
            ContainerState::Failed => container
                .failure()
                .unwrap_or_else(|| Escalation::sourcing_failure(container.name(), "failed")),
            ContainerState::Recycling | ContainerState::Unloaded => {
                Escalation::sourcing_failure(container.name(), "object already unloaded")
            }
            ContainerState::Unsourced if !expanded => {
                stack.push((index, true));
                for dependency in container.meta().dependencies.iter().rev() {
                    stack.push((*dependency, false));
                }
                continue;
            }
            ContainerState::Unsourced => {
                let dependencies: Option<Vec<Value>> = container
                    .meta()
                    .dependencies
                    .iter()
                    .map(|dependency| lookup(process, thread, *dependency).and_then(|c| c.value()))
                    .collect();
                match dependencies {
                    Some(dependencies) => {
                        source(&container, process, dependencies);
                        stack.push((index, true));
                        continue;
                    }
                    None => Escalation::sourcing_failure(container.name(), "dependency no longer ready"),
                }
            }
        };

        container.fail(failure.clone());
        for (dependent, _) in stack.iter().filter(|(_, expanded)| *expanded) {
            if let Some(dependent) = lookup(process, thread, *dependent) {
                let reason = format!("dependency {} failed", container.name());
                dependent.fail(Escalation::sourcing_failure(dependent.name(), reason).with_cause(failure.clone()));
            }
        }
        return Readiness::Failed(failure);
    }

    let values: Option<Vec<Value>> = required
        .iter()
        .map(|index| lookup(process, thread, *index).and_then(|c| c.value()))
        .collect();
    match values {
        Some(values) => Readiness::Ready(values),
        None => Readiness::Failed(Escalation::failure("Object unloaded while resolving")),
    }
}

/// Invoke the source of an unsourced container
fn source(container: &Arc<ManagedObjectContainer>, process: &Arc<ProcessState>, dependencies: Vec<Value>) {
    if !container.begin_sourcing() {
        return;
    }
    let meta = Arc::clone(container.meta());
    tracing::debug!(object = %meta.name, process = %process.id(), "sourcing object");

    let context = SourceContext::new(Arc::clone(container), Arc::downgrade(process), dependencies);
    let outcome = catch_unwind(AssertUnwindSafe(|| meta.source.source_object(context)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(escalation)) => {
            container.fail(escalation);
        }
        Err(panic) => {
            let reason = format!("source panicked: {}", panic_message(panic.as_ref()));
            container.fail(Escalation::sourcing_failure(&meta.name, reason));
        }
    }

    if container.state() != ContainerState::Sourcing {
        return;
    }
    if !meta.asynchronous {
        container.fail(Escalation::sourcing_failure(
            &meta.name,
            "synchronous source returned without providing the object",
        ));
    } else if let Some(timeout) = meta.timeout {
        process.office().asset_manager.register(container, timeout);
    }
}

/// Recycle every ready container, most recently sourced first
pub(crate) fn teardown_containers(containers: &[Arc<ManagedObjectContainer>], cleanup: &[Escalation]) {
    let mut ready: Vec<_> = containers
        .iter()
        .filter(|container| container.state() == ContainerState::Ready)
        .collect();
    ready.sort_by_key(|container| std::cmp::Reverse(container.sourced_at()));
    for container in ready {
        container.unload(cleanup);
    }
    for container in containers {
        container.unload(cleanup);
    }
}

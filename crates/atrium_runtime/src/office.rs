//! The office: validated metadata plus the trigger entry point.
//!
//! [`OfficeBuilder`] resolves names into indices and rejects inconsistent
//! graphs before anything runs. [`Office`] owns the teams, the object
//! sources and the office manager thread, and triggers processes.

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use atrium_core::ProcessId;

use crate::asset::AssetManager;
use crate::config::{ConfigError, RuntimeConfig};
use crate::escalation::{
    Escalation, EscalationBinding, EscalationHandler, EscalationLevel, EscalationParameter,
    EscalationProcedure, EscalationRouter, EscalationTaxonomy, EscalationType,
    LoggingEscalationHandler,
};
use crate::executor::FunctionJob;
use crate::function::{FunctionBuilder, FunctionIndex, FunctionMetaData};
use crate::governance::{GovernanceBuilder, GovernanceMetaData};
use crate::monitor::{MetricsSnapshot, RuntimeMetrics};
use crate::object::{ManagedObjectBuilder, ManagedObjectMetaData, ObjectIndex, ObjectScope};
use crate::process::{ProcessCallback, ProcessManager, ProcessState};
use crate::team::{Team, TeamError, TeamRegistry};
use crate::Value;

/// Errors detected while building an office. No process starts from an
/// office that failed to build.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    /// Runtime configuration is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Team registration failed
    #[error(transparent)]
    Team(#[from] TeamError),

    /// Reference to a team that does not exist
    #[error("{owner} refers to unknown team {team}")]
    UnknownTeam {
        /// Referring item
        owner: String,
        /// Missing team
        team: String,
    },

    /// Two functions share a name
    #[error("Duplicate function {name}")]
    DuplicateFunction {
        /// Function name
        name: String,
    },

    /// Reference to a function that does not exist
    #[error("{owner} refers to unknown function {function}")]
    UnknownFunction {
        /// Referring item
        owner: String,
        /// Missing function
        function: String,
    },

    /// Function requires an object that does not exist
    #[error("{owner} requires unknown object {object}")]
    UnknownObject {
        /// Referring function
        owner: String,
        /// Missing object index
        object: String,
    },

    /// Object depends on an object that does not exist
    #[error("Object {object} depends on unknown object {dependency}")]
    UnresolvedDependency {
        /// Dependent object
        object: String,
        /// Missing object index
        dependency: String,
    },

    /// Process-scoped object depends on a thread-scoped one
    #[error("Process object {object} cannot depend on thread object {dependency}")]
    ScopeViolation {
        /// Dependent object
        object: String,
        /// Thread-scoped dependency
        dependency: String,
    },

    /// Object dependencies form a cycle
    #[error("Dependency cycle through object {object}")]
    DependencyCycle {
        /// Object on the cycle
        object: String,
    },

    /// Reference to a governance that does not exist
    #[error("{owner} refers to unknown governance {index}")]
    UnknownGovernance {
        /// Referring item
        owner: String,
        /// Missing governance index
        index: usize,
    },

    /// Escalation type declaration rejected
    #[error("Cannot declare escalation type {kind}: {reason}")]
    EscalationType {
        /// Declared type
        kind: String,
        /// Why
        reason: String,
    },

    /// One procedure binds the same type twice
    #[error("{owner} handles escalation {kind} twice")]
    DuplicateEscalation {
        /// Procedure owner
        owner: String,
        /// Duplicated type
        kind: String,
    },

    /// Object source refused to initialize
    #[error("Source of object {object} failed to initialize: {reason}")]
    SourceInit {
        /// Object name
        object: String,
        /// Source's escalation
        reason: String,
    },
}

/// Errors triggering processes or opening the office
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OfficeError {
    /// Office has not been opened
    #[error("Office {office} is not open")]
    NotOpen {
        /// Office name
        office: String,
    },

    /// Office was closed
    #[error("Office has been closed")]
    Closed,

    /// No function with that name
    #[error("Unknown function: {name}")]
    UnknownFunction {
        /// Requested name
        name: String,
    },

    /// A team failed to start
    #[error(transparent)]
    Team(#[from] TeamError),

    /// Office manager thread could not be created
    #[error("Failed to start office manager: {reason}")]
    ManagerSpawn {
        /// OS error text
        reason: String,
    },
}

/// Observer of every process of an office
pub trait ProcessListener: Send + Sync {
    /// Called once per process, after teardown
    fn process_completed(&self, process: ProcessId, failure: Option<&Escalation>);
}

impl<F> ProcessListener for F
where
    F: Fn(ProcessId, Option<&Escalation>) + Send + Sync,
{
    fn process_completed(&self, process: ProcessId, failure: Option<&Escalation>) {
        self(process, failure)
    }
}

/// Everything a running process reads from its office
pub(crate) struct OfficeMetaData {
    pub(crate) name: String,
    pub(crate) config: RuntimeConfig,
    pub(crate) teams: TeamRegistry,
    pub(crate) functions: Vec<FunctionMetaData>,
    pub(crate) function_names: IndexMap<String, FunctionIndex>,
    pub(crate) process_objects: Vec<Arc<ManagedObjectMetaData>>,
    pub(crate) thread_objects: Vec<Arc<ManagedObjectMetaData>>,
    pub(crate) governance: Vec<Arc<GovernanceMetaData>>,
    pub(crate) thread_router: Arc<EscalationRouter>,
    pub(crate) process_router: Arc<EscalationRouter>,
    pub(crate) escalation_handler: Arc<dyn EscalationHandler>,
    pub(crate) listeners: Vec<Arc<dyn ProcessListener>>,
    pub(crate) metrics: RuntimeMetrics,
    pub(crate) asset_manager: AssetManager,
    open: AtomicBool,
}

impl OfficeMetaData {
    fn objects(&self) -> impl DoubleEndedIterator<Item = &Arc<ManagedObjectMetaData>> {
        self.process_objects.iter().chain(self.thread_objects.iter())
    }
}

/// Create a process running `function` and schedule its first job
pub(crate) fn start_process(
    office: &Arc<OfficeMetaData>,
    function: FunctionIndex,
    parameter: Option<Value>,
    callback: Option<ProcessCallback>,
) -> Arc<ProcessState> {
    let process = ProcessState::new(Arc::clone(office), callback);
    let thread = process.new_thread(None);
    let flow = thread.new_flow();
    let router = Some(Arc::clone(thread.router()));
    FunctionJob::new(function, flow, parameter, router).schedule();
    process
}

fn invoke_process(
    office: &Arc<OfficeMetaData>,
    function: &str,
    parameter: Option<Value>,
    callback: ProcessCallback,
) -> Result<ProcessManager, OfficeError> {
    if !office.open.load(Ordering::Acquire) {
        return Err(OfficeError::NotOpen {
            office: office.name.clone(),
        });
    }
    let index = office
        .function_names
        .get(function)
        .copied()
        .ok_or_else(|| OfficeError::UnknownFunction {
            name: function.to_string(),
        })?;
    let process = start_process(office, index, parameter, Some(callback));
    Ok(ProcessManager::new(process))
}

/// Handed to object sources when the office opens, so event-driven sources
/// can trigger processes of their own
#[derive(Clone)]
pub struct ExecuteContext {
    office: Weak<OfficeMetaData>,
}

impl ExecuteContext {
    /// Trigger a process
    ///
    /// # Errors
    ///
    /// Returns error if the office is gone, not open, or has no such function
    pub fn invoke_process(
        &self,
        function: &str,
        parameter: Option<Value>,
        on_complete: impl FnOnce(Option<Escalation>) + Send + 'static,
    ) -> Result<ProcessManager, OfficeError> {
        let office = self.office.upgrade().ok_or(OfficeError::Closed)?;
        invoke_process(&office, function, parameter, Box::new(on_complete))
    }
}

/// Future resolving when a process completes, to its unrouted escalation
pub struct ProcessCompletion {
    process: ProcessManager,
    receiver: oneshot::Receiver<Option<Escalation>>,
}

impl ProcessCompletion {
    /// Handle to the process
    #[must_use]
    pub fn process(&self) -> &ProcessManager {
        &self.process
    }

    /// Block until completion. Must not be called from within an async runtime.
    #[must_use]
    pub fn wait(self) -> Option<Escalation> {
        self.receiver.blocking_recv().unwrap_or_else(|_| Some(dropped()))
    }
}

fn dropped() -> Escalation {
    Escalation::failure("Process dropped before completing")
}

impl Future for ProcessCompletion {
    type Output = Option<Escalation>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or_else(|_| Some(dropped())))
    }
}

/// Background sweep enforcing asynchronous sourcing timeouts
struct OfficeManager {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl OfficeManager {
    fn start(office: &Arc<OfficeMetaData>) -> Result<Self, OfficeError> {
        let (shutdown, receiver) = bounded::<()>(1);
        let weak = Arc::downgrade(office);
        let interval = office.config.monitor_interval();
        let handle = std::thread::Builder::new()
            .name(format!("{}-manager", office.name))
            .spawn(move || loop {
                match receiver.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(office) = weak.upgrade() else {
                            break;
                        };
                        office.asset_manager.sweep(Instant::now(), &office.metrics);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|error| OfficeError::ManagerSpawn {
                reason: error.to_string(),
            })?;
        Ok(Self { shutdown, handle })
    }

    fn stop(self) {
        let _ = self.shutdown.send(());
        if self.handle.thread().id() != std::thread::current().id() {
            let _ = self.handle.join();
        }
    }
}

/// A built office
pub struct Office {
    meta: Arc<OfficeMetaData>,
    manager: Mutex<Option<OfficeManager>>,
    closed: AtomicBool,
}

impl Office {
    /// Office name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Configuration the office was built with
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.meta.config
    }

    /// Function names in declaration order
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.meta.function_names.keys().map(String::as_str)
    }

    /// Whether processes can be triggered
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.meta.open.load(Ordering::Acquire)
    }

    /// Start teams, object sources and the office manager
    ///
    /// # Errors
    ///
    /// Returns error if the office was closed, a team fails to start or the
    /// manager thread cannot be spawned
    pub fn open(&self) -> Result<(), OfficeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OfficeError::Closed);
        }
        if self.is_open() {
            return Ok(());
        }
        self.meta.teams.start_all()?;
        let manager = OfficeManager::start(&self.meta)?;
        *self.manager.lock() = Some(manager);
        self.meta.open.store(true, Ordering::Release);

        for object in self.meta.objects() {
            object.source.start(ExecuteContext {
                office: Arc::downgrade(&self.meta),
            });
        }
        tracing::info!(
            office = %self.meta.name,
            teams = self.meta.teams.len(),
            functions = self.meta.functions.len(),
            "office opened"
        );
        Ok(())
    }

    /// Stop the manager, the object sources and the teams. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.meta.open.store(false, Ordering::Release);
        if let Some(manager) = self.manager.lock().take() {
            manager.stop();
        }
        for object in self.meta.objects().rev() {
            object.source.stop();
        }
        self.meta.teams.stop_all();
        tracing::info!(office = %self.meta.name, "office closed");
    }

    /// Trigger a process running `function`. `on_complete` is called exactly
    /// once with the process's unrouted escalation, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the office is not open or has no such function
    pub fn invoke(
        &self,
        function: &str,
        parameter: Option<Value>,
        on_complete: impl FnOnce(Option<Escalation>) + Send + 'static,
    ) -> Result<ProcessManager, OfficeError> {
        invoke_process(&self.meta, function, parameter, Box::new(on_complete))
    }

    /// Trigger a process and get a future of its outcome
    ///
    /// # Errors
    ///
    /// Returns error if the office is not open or has no such function
    pub fn invoke_async(&self, function: &str, parameter: Option<Value>) -> Result<ProcessCompletion, OfficeError> {
        let (sender, receiver) = oneshot::channel();
        let process = self.invoke(function, parameter, move |outcome| {
            let _ = sender.send(outcome);
        })?;
        Ok(ProcessCompletion { process, receiver })
    }

    /// Context for triggering processes outside of object sources
    #[must_use]
    pub fn execute_context(&self) -> ExecuteContext {
        ExecuteContext {
            office: Arc::downgrade(&self.meta),
        }
    }

    /// Current metrics
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.meta.metrics.snapshot()
    }
}

impl Drop for Office {
    fn drop(&mut self) {
        self.close();
    }
}

/// Collects the office graph and validates it into an [`Office`]
pub struct OfficeBuilder {
    name: String,
    config: RuntimeConfig,
    teams: Vec<Arc<dyn Team>>,
    functions: Vec<FunctionBuilder>,
    process_objects: Vec<ManagedObjectBuilder>,
    thread_objects: Vec<ManagedObjectBuilder>,
    governance: Vec<GovernanceBuilder>,
    escalation_types: Vec<(String, String)>,
    thread_escalations: Vec<(String, String, EscalationParameter)>,
    process_escalations: Vec<(String, String, EscalationParameter)>,
    system_escalations: Vec<(String, String, EscalationParameter)>,
    escalation_handler: Arc<dyn EscalationHandler>,
    listeners: Vec<Arc<dyn ProcessListener>>,
}

impl OfficeBuilder {
    /// Start an office using the teams and settings of `config`
    #[must_use]
    pub fn new(name: impl Into<String>, config: RuntimeConfig) -> Self {
        Self {
            name: name.into(),
            config,
            teams: Vec::new(),
            functions: Vec::new(),
            process_objects: Vec::new(),
            thread_objects: Vec::new(),
            governance: Vec::new(),
            escalation_types: Vec::new(),
            thread_escalations: Vec::new(),
            process_escalations: Vec::new(),
            system_escalations: Vec::new(),
            escalation_handler: Arc::new(LoggingEscalationHandler),
            listeners: Vec::new(),
        }
    }

    /// Register a host-provided team in addition to the configured ones
    pub fn add_team(&mut self, team: Arc<dyn Team>) -> &mut Self {
        self.teams.push(team);
        self
    }

    /// Add a function
    pub fn add_function(&mut self, function: FunctionBuilder) -> FunctionIndex {
        self.functions.push(function);
        FunctionIndex(self.functions.len() - 1)
    }

    /// Add an object, returning the index functions and dependents use
    pub fn add_object(&mut self, object: ManagedObjectBuilder) -> ObjectIndex {
        let objects = match object.scope {
            ObjectScope::Process => &mut self.process_objects,
            ObjectScope::Thread => &mut self.thread_objects,
        };
        objects.push(object);
        ObjectIndex {
            scope: objects[objects.len() - 1].scope,
            slot: objects.len() - 1,
        }
    }

    /// Add a governance, returning its index
    pub fn add_governance(&mut self, governance: GovernanceBuilder) -> usize {
        self.governance.push(governance);
        self.governance.len() - 1
    }

    /// Declare an escalation type under an already declared parent
    pub fn declare_escalation(&mut self, kind: impl Into<String>, parent: impl Into<String>) -> &mut Self {
        self.escalation_types.push((kind.into(), parent.into()));
        self
    }

    /// Thread-level binding, consulted after the function's own table
    pub fn thread_escalation(&mut self, kind: impl Into<String>, handler: impl Into<String>) -> &mut Self {
        self.thread_escalations
            .push((kind.into(), handler.into(), EscalationParameter::Escalation));
        self
    }

    /// Process-level binding
    pub fn process_escalation(&mut self, kind: impl Into<String>, handler: impl Into<String>) -> &mut Self {
        self.process_escalations
            .push((kind.into(), handler.into(), EscalationParameter::Escalation));
        self
    }

    /// System-level binding, the last one consulted
    pub fn system_escalation(&mut self, kind: impl Into<String>, handler: impl Into<String>) -> &mut Self {
        self.system_escalations
            .push((kind.into(), handler.into(), EscalationParameter::Escalation));
        self
    }

    /// Leaf handler for escalations nothing matched
    pub fn escalation_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(ProcessId, &Escalation) + Send + Sync + 'static,
    {
        self.escalation_handler = Arc::new(handler);
        self
    }

    /// Shared leaf handler for escalations nothing matched
    pub fn set_escalation_handler(&mut self, handler: Arc<dyn EscalationHandler>) -> &mut Self {
        self.escalation_handler = handler;
        self
    }

    /// Observe every process completion
    pub fn process_listener<F>(&mut self, listener: F) -> &mut Self
    where
        F: Fn(ProcessId, Option<&Escalation>) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Observe every process completion through a shared listener
    pub fn add_process_listener(&mut self, listener: Arc<dyn ProcessListener>) -> &mut Self {
        self.listeners.push(listener);
        self
    }

    /// Validate and resolve the graph
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found: invalid configuration, unknown
    /// team, function, object or governance references, duplicate names or
    /// bindings, dependency cycles or scope violations, or a source that
    /// fails to initialize
    pub fn build(self) -> Result<Office, ConfigurationError> {
        self.config.validate()?;

        let mut teams = TeamRegistry::from_config(&self.config)?;
        for team in &self.teams {
            teams.register(Arc::clone(team))?;
        }

        let mut taxonomy = EscalationTaxonomy::new();
        for (kind, parent) in &self.escalation_types {
            taxonomy
                .declare(kind.as_str(), parent.as_str())
                .map_err(|error| ConfigurationError::EscalationType {
                    kind: kind.clone(),
                    reason: error.to_string(),
                })?;
        }
        let taxonomy = Arc::new(taxonomy);

        let mut function_names = IndexMap::new();
        for (position, function) in self.functions.iter().enumerate() {
            if function_names
                .insert(function.name.clone(), FunctionIndex(position))
                .is_some()
            {
                return Err(ConfigurationError::DuplicateFunction {
                    name: function.name.clone(),
                });
            }
        }

        let resolver = Resolver {
            config: &self.config,
            teams: &teams,
            functions: &function_names,
            taxonomy: &taxonomy,
        };

        let system = EscalationRouter::new(
            EscalationLevel::System,
            resolver.procedure("system", &self.system_escalations)?,
            None,
        );
        let process_router = EscalationRouter::new(
            EscalationLevel::Process,
            resolver.procedure("process", &self.process_escalations)?,
            Some(system),
        );
        let thread_router = EscalationRouter::new(
            EscalationLevel::Thread,
            resolver.procedure("thread", &self.thread_escalations)?,
            Some(Arc::clone(&process_router)),
        );

        let mut governance = Vec::with_capacity(self.governance.len());
        for builder in self.governance {
            let (_, team) = resolver.team(&builder.name, builder.team.as_deref())?;
            let escalations = resolver.procedure(&builder.name, &builder.escalations)?;
            governance.push(Arc::new(GovernanceMetaData {
                name: builder.name,
                factory: builder.factory,
                team,
                escalations,
            }));
        }

        check_objects(&self.process_objects, &self.thread_objects, governance.len())?;
        let process_objects = resolve_objects(self.process_objects, ObjectScope::Process, &self.config)?;
        let thread_objects = resolve_objects(self.thread_objects, ObjectScope::Thread, &self.config)?;

        let object_exists = |index: &ObjectIndex| match index.scope {
            ObjectScope::Process => index.slot < process_objects.len(),
            ObjectScope::Thread => index.slot < thread_objects.len(),
        };

        let mut functions = Vec::with_capacity(self.functions.len());
        for (position, builder) in self.functions.into_iter().enumerate() {
            let name = builder.name;
            let (team_name, team) = resolver.team(&name, builder.team.as_deref())?;
            if let Some(object) = builder.objects.iter().find(|index| !object_exists(index)) {
                return Err(ConfigurationError::UnknownObject {
                    owner: name,
                    object: object.to_string(),
                });
            }
            let governance_used = builder
                .governance
                .iter()
                .chain(builder.deactivate.iter().map(|(index, _)| index));
            for index in governance_used {
                if *index >= governance.len() {
                    return Err(ConfigurationError::UnknownGovernance {
                        owner: name,
                        index: *index,
                    });
                }
            }
            let escalations = resolver.procedure(&name, &builder.escalations)?;
            let next = builder
                .next
                .as_deref()
                .map(|next| resolver.function(&name, next))
                .transpose()?;
            let flows = builder
                .flows
                .iter()
                .map(|flow| resolver.function(&name, flow))
                .collect::<Result<Vec<_>, _>>()?;

            functions.push(FunctionMetaData {
                name,
                index: FunctionIndex(position),
                team_name,
                team,
                factory: builder.factory,
                objects: builder.objects,
                governance: builder.governance,
                deactivate: builder.deactivate,
                escalations,
                next,
                flows,
            });
        }

        tracing::info!(
            office = %self.name,
            functions = functions.len(),
            objects = process_objects.len() + thread_objects.len(),
            governance = governance.len(),
            "office built"
        );

        let meta = OfficeMetaData {
            name: self.name,
            config: self.config,
            teams,
            functions,
            function_names,
            process_objects,
            thread_objects,
            governance,
            thread_router,
            process_router,
            escalation_handler: self.escalation_handler,
            listeners: self.listeners,
            metrics: RuntimeMetrics::new(),
            asset_manager: AssetManager::new(),
            open: AtomicBool::new(false),
        };
        Ok(Office {
            meta: Arc::new(meta),
            manager: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }
}

/// Name resolution shared by the build steps
struct Resolver<'a> {
    config: &'a RuntimeConfig,
    teams: &'a TeamRegistry,
    functions: &'a IndexMap<String, FunctionIndex>,
    taxonomy: &'a Arc<EscalationTaxonomy>,
}

impl Resolver<'_> {
    fn team(&self, owner: &str, team: Option<&str>) -> Result<(String, Arc<dyn Team>), ConfigurationError> {
        let name = team.unwrap_or(&self.config.default_team);
        self.teams
            .get(name)
            .map(|team| (name.to_string(), team))
            .map_err(|_| ConfigurationError::UnknownTeam {
                owner: owner.to_string(),
                team: name.to_string(),
            })
    }

    fn function(&self, owner: &str, function: &str) -> Result<FunctionIndex, ConfigurationError> {
        self.functions
            .get(function)
            .copied()
            .ok_or_else(|| ConfigurationError::UnknownFunction {
                owner: owner.to_string(),
                function: function.to_string(),
            })
    }

    fn procedure(
        &self,
        owner: &str,
        bindings: &[(String, String, EscalationParameter)],
    ) -> Result<EscalationProcedure, ConfigurationError> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(bindings.len());
        for (kind, handler, parameter) in bindings {
            if !seen.insert(kind.as_str()) {
                return Err(ConfigurationError::DuplicateEscalation {
                    owner: owner.to_string(),
                    kind: kind.clone(),
                });
            }
            resolved.push(EscalationBinding {
                kind: EscalationType::new(kind),
                handler: self.function(owner, handler)?,
                parameter: *parameter,
            });
        }
        Ok(EscalationProcedure::new(resolved, Arc::clone(self.taxonomy)))
    }
}

/// Check dependency references, scopes, governance indices and cycles
fn check_objects(
    process_objects: &[ManagedObjectBuilder],
    thread_objects: &[ManagedObjectBuilder],
    governance: usize,
) -> Result<(), ConfigurationError> {
    let builder = |index: ObjectIndex| match index.scope {
        ObjectScope::Process => process_objects.get(index.slot),
        ObjectScope::Thread => thread_objects.get(index.slot),
    };

    let mut graph: IndexMap<ObjectIndex, &[ObjectIndex]> = IndexMap::new();
    let all = process_objects
        .iter()
        .enumerate()
        .map(|(slot, object)| (ObjectIndex::process(slot), object))
        .chain(
            thread_objects
                .iter()
                .enumerate()
                .map(|(slot, object)| (ObjectIndex::thread(slot), object)),
        );
    for (index, object) in all {
        for dependency in &object.dependencies {
            if builder(*dependency).is_none() {
                return Err(ConfigurationError::UnresolvedDependency {
                    object: object.name.clone(),
                    dependency: dependency.to_string(),
                });
            }
            if index.scope == ObjectScope::Process && dependency.scope == ObjectScope::Thread {
                return Err(ConfigurationError::ScopeViolation {
                    object: object.name.clone(),
                    dependency: dependency.to_string(),
                });
            }
        }
        if let Some(missing) = object.governance.iter().find(|g| **g >= governance) {
            return Err(ConfigurationError::UnknownGovernance {
                owner: object.name.clone(),
                index: *missing,
            });
        }
        graph.insert(index, &object.dependencies);
    }

    for index in graph.keys() {
        if reaches(&graph, *index, *index) {
            let object = builder(*index).map_or_else(|| index.to_string(), |b| b.name.clone());
            return Err(ConfigurationError::DependencyCycle { object });
        }
    }
    Ok(())
}

/// Whether `target` is reachable from `from` by following dependencies
fn reaches(graph: &IndexMap<ObjectIndex, &[ObjectIndex]>, from: ObjectIndex, target: ObjectIndex) -> bool {
    let mut stack: Vec<ObjectIndex> = graph.get(&from).map(|deps| deps.to_vec()).unwrap_or_default();
    let mut seen = HashSet::new();
    while let Some(index) = stack.pop() {
        if index == target {
            return true;
        }
        if seen.insert(index) {
            if let Some(deps) = graph.get(&index) {
                stack.extend_from_slice(deps);
            }
        }
    }
    false
}

fn resolve_objects(
    builders: Vec<ManagedObjectBuilder>,
    scope: ObjectScope,
    config: &RuntimeConfig,
) -> Result<Vec<Arc<ManagedObjectMetaData>>, ConfigurationError> {
    builders
        .into_iter()
        .enumerate()
        .map(|(slot, builder)| {
            builder
                .source
                .init(&builder.name)
                .map_err(|escalation| ConfigurationError::SourceInit {
                    object: builder.name.clone(),
                    reason: escalation.to_string(),
                })?;
            let timeout: Option<Duration> = builder.timeout.or_else(|| {
                if builder.asynchronous {
                    config.default_source_timeout()
                } else {
                    None
                }
            });
            Ok(Arc::new(ManagedObjectMetaData {
                name: builder.name,
                index: ObjectIndex { scope, slot },
                source: builder.source,
                dependencies: builder.dependencies,
                asynchronous: builder.asynchronous,
                timeout,
                governance: builder.governance,
            }))
        })
        .collect()
}

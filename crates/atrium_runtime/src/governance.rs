//! Governance: cross-cutting oversight of a process's objects.
//!
//! A function may activate a governance before it runs and deactivate it
//! after. While active, every object of the running function that declares
//! the governance is bound to it and handed to [`Governance::govern`]. All
//! governance activities run as jobs on the governance's own team, and their
//! failures route through the governance's own escalation procedure before
//! reaching the process and system levels.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::asset::AssetMonitor;
use crate::escalation::{Escalation, EscalationLevel, EscalationParameter, EscalationProcedure};
use crate::executor::{panic_message, FunctionJob};
use crate::flow::Flow;
use crate::job::Job;
use crate::object::ManagedObjectContainer;
use crate::team::Team;
use crate::Value;

/// What happens to a governance when it is deactivated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationStrategy {
    /// Abandon the governance: call `disregard` without waiting for it
    Disregard,
    /// Wait for in-flight activities, then `enforce`; the flow continues
    /// only after enforcement finished
    Enforce,
}

/// Oversight applied to a set of objects
pub trait Governance: Send + Sync {
    /// Bind an object
    ///
    /// # Errors
    ///
    /// Returns the escalation to route through the governance's procedure
    fn govern(&self, object: &Value) -> Result<(), Escalation>;

    /// Apply the governance to everything bound
    ///
    /// # Errors
    ///
    /// Returns the escalation to route through the governance's procedure
    fn enforce(&self) -> Result<(), Escalation>;

    /// Abandon the governance
    ///
    /// # Errors
    ///
    /// Returns the escalation to route through the governance's procedure
    fn disregard(&self) -> Result<(), Escalation> {
        Ok(())
    }
}

/// Creates one governance instance per process
pub trait GovernanceFactory: Send + Sync {
    /// Create an instance
    ///
    /// # Errors
    ///
    /// Returns the escalation to route through the governance's procedure
    fn create(&self) -> Result<Arc<dyn Governance>, Escalation>;
}

impl<F> GovernanceFactory for F
where
    F: Fn() -> Result<Arc<dyn Governance>, Escalation> + Send + Sync,
{
    fn create(&self) -> Result<Arc<dyn Governance>, Escalation> {
        self()
    }
}

/// Declares a governance for [`OfficeBuilder`](crate::office::OfficeBuilder)
pub struct GovernanceBuilder {
    pub(crate) name: String,
    pub(crate) factory: Arc<dyn GovernanceFactory>,
    pub(crate) team: Option<String>,
    pub(crate) escalations: Vec<(String, String, EscalationParameter)>,
}

impl GovernanceBuilder {
    /// Governance created by a closure
    #[must_use]
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Governance>, Escalation> + Send + Sync + 'static,
    {
        Self::from_factory(name, Arc::new(factory))
    }

    /// Governance created by a shared factory
    #[must_use]
    pub fn from_factory(name: impl Into<String>, factory: Arc<dyn GovernanceFactory>) -> Self {
        Self {
            name: name.into(),
            factory,
            team: None,
            escalations: Vec::new(),
        }
    }

    /// Run activities on the named team instead of the default one
    #[must_use]
    pub fn team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    /// Handle an escalation type raised by an activity
    #[must_use]
    pub fn escalation(mut self, kind: impl Into<String>, handler: impl Into<String>) -> Self {
        self.escalations
            .push((kind.into(), handler.into(), EscalationParameter::Escalation));
        self
    }
}

pub(crate) struct GovernanceMetaData {
    pub(crate) name: String,
    pub(crate) factory: Arc<dyn GovernanceFactory>,
    pub(crate) team: Arc<dyn Team>,
    pub(crate) escalations: EscalationProcedure,
}

/// Lifecycle of a governance within one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernanceState {
    /// Not governing anything
    Inactive,
    /// Bound objects are governed
    Active,
    /// The factory failed; activation is a no-op
    Failed,
}

#[derive(Clone, Copy)]
enum Activity {
    Govern,
    Enforce,
    Disregard,
}

struct GovernanceInner {
    state: GovernanceState,
    governance: Option<Arc<dyn Governance>>,
    bound: Vec<Arc<ManagedObjectContainer>>,
    in_flight: usize,
    monitor: AssetMonitor,
}

/// Per-process governance state, created the first time it is used
pub(crate) struct GovernanceContainer {
    meta: Arc<GovernanceMetaData>,
    inner: Mutex<GovernanceInner>,
}

impl GovernanceContainer {
    pub(crate) fn new(meta: Arc<GovernanceMetaData>) -> Self {
        Self {
            meta,
            inner: Mutex::new(GovernanceInner {
                state: GovernanceState::Inactive,
                governance: None,
                bound: Vec::new(),
                in_flight: 0,
                monitor: AssetMonitor::new(),
            }),
        }
    }

    pub(crate) fn state(&self) -> GovernanceState {
        self.inner.lock().state
    }

    /// Activate and bind objects not yet bound, scheduling one `govern`
    /// activity per newly bound object in `flow`. Returns how many were
    /// scheduled.
    pub(crate) fn activate(
        self: &Arc<Self>,
        objects: Vec<(Arc<ManagedObjectContainer>, Value)>,
        flow: &Arc<Flow>,
    ) -> usize {
        let governance = match self.instance() {
            Ok(Some(governance)) => governance,
            Ok(None) => return 0,
            Err(escalation) => {
                escalate(&self.meta, flow, escalation);
                return 0;
            }
        };

        let mut scheduled = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.state = GovernanceState::Active;
            if inner.governance.is_none() {
                inner.governance = Some(Arc::clone(&governance));
            }
            for (container, object) in objects {
                if inner.bound.iter().any(|bound| Arc::ptr_eq(bound, &container)) {
                    continue;
                }
                inner.bound.push(container);
                inner.in_flight += 1;
                scheduled.push(object);
            }
        }

        let count = scheduled.len();
        for object in scheduled {
            self.schedule(Arc::clone(&governance), Activity::Govern, Some(object), flow);
        }
        count
    }

    /// Existing instance, or a new one from the factory. `None` once failed.
    fn instance(&self) -> Result<Option<Arc<dyn Governance>>, Escalation> {
        {
            let inner = self.inner.lock();
            match inner.state {
                GovernanceState::Failed => return Ok(None),
                _ => {
                    if let Some(governance) = &inner.governance {
                        return Ok(Some(Arc::clone(governance)));
                    }
                }
            }
        }

        let created = catch_unwind(AssertUnwindSafe(|| self.meta.factory.create()))
            .unwrap_or_else(|panic| {
                Err(Escalation::failure(format!(
                    "governance factory panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        let mut inner = self.inner.lock();
        match created {
            Ok(governance) => {
                let governance = inner.governance.get_or_insert(governance);
                Ok(Some(Arc::clone(governance)))
            }
            Err(escalation) => {
                inner.state = GovernanceState::Failed;
                Err(escalation)
            }
        }
    }

    /// Deactivate, scheduling `enforce` or `disregard` in `flow`.
    /// Returns whether anything was scheduled.
    pub(crate) fn deactivate(self: &Arc<Self>, strategy: DeactivationStrategy, flow: &Arc<Flow>) -> bool {
        let governance = {
            let mut inner = self.inner.lock();
            if inner.state != GovernanceState::Active {
                return false;
            }
            inner.state = GovernanceState::Inactive;
            inner.bound.clear();
            match inner.governance.take() {
                Some(governance) => {
                    inner.in_flight += 1;
                    governance
                }
                None => return false,
            }
        };
        let activity = match strategy {
            DeactivationStrategy::Enforce => Activity::Enforce,
            DeactivationStrategy::Disregard => Activity::Disregard,
        };
        self.schedule(governance, activity, None, flow);
        true
    }

    /// Park a job until no activity is in flight. Hands the job back if idle.
    pub(crate) fn wait_idle(&self, job: FunctionJob) -> Option<FunctionJob> {
        let mut inner = self.inner.lock();
        if inner.in_flight > 0 {
            inner.monitor.wait(job);
            None
        } else {
            Some(job)
        }
    }

    pub(crate) fn take_waiters(&self) -> Vec<FunctionJob> {
        self.inner.lock().monitor.take()
    }

    fn activity_done(&self) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if inner.in_flight > 0 {
            return;
        }
        let waiters = inner.monitor.take();
        drop(inner);
        AssetMonitor::activate(waiters);
    }

    /// Deactivate inline when a failed process completes. Returns the
    /// failures, to be handed to object recycling as cleanup escalations.
    pub(crate) fn finish(&self, strategy: DeactivationStrategy) -> Vec<Escalation> {
        let governance = {
            let mut inner = self.inner.lock();
            if inner.state != GovernanceState::Active {
                return Vec::new();
            }
            inner.state = GovernanceState::Inactive;
            inner.bound.clear();
            inner.governance.take()
        };
        let Some(governance) = governance else {
            return Vec::new();
        };

        tracing::debug!(governance = %self.meta.name, ?strategy, "deactivating at process completion");
        let activity = match strategy {
            DeactivationStrategy::Enforce => Activity::Enforce,
            DeactivationStrategy::Disregard => Activity::Disregard,
        };
        match perform(governance.as_ref(), activity, None) {
            Ok(()) => Vec::new(),
            Err(escalation) => vec![Escalation::governance_failure(&self.meta.name, escalation)],
        }
    }

    fn schedule(
        self: &Arc<Self>,
        governance: Arc<dyn Governance>,
        activity: Activity,
        object: Option<Value>,
        flow: &Arc<Flow>,
    ) {
        flow.retain();
        let job = GovernanceJob {
            container: Arc::clone(self),
            governance,
            activity,
            object,
            flow: Arc::clone(flow),
        };
        self.meta.team.assign(Box::new(job));
    }
}

fn perform(governance: &dyn Governance, activity: Activity, object: Option<&Value>) -> Result<(), Escalation> {
    let outcome = catch_unwind(AssertUnwindSafe(|| match (activity, object) {
        (Activity::Govern, Some(object)) => governance.govern(object),
        (Activity::Govern, None) => Ok(()),
        (Activity::Enforce, _) => governance.enforce(),
        (Activity::Disregard, _) => governance.disregard(),
    }));
    outcome.unwrap_or_else(|panic| {
        Err(Escalation::failure(format!(
            "governance activity panicked: {}",
            panic_message(panic.as_ref())
        )))
    })
}

/// Route an activity failure: the governance's own procedure first, then
/// the process and system levels as a `GovernanceFailure`
fn escalate(meta: &GovernanceMetaData, flow: &Arc<Flow>, escalation: Escalation) {
    let thread = flow.thread();
    let process = thread.process();
    let office = process.office();

    let (level, binding, resume, raised) = match meta.escalations.find(&escalation) {
        Some(binding) => (
            EscalationLevel::Governance,
            binding.clone(),
            Some(Arc::clone(&office.process_router)),
            escalation,
        ),
        None => {
            let wrapped = Escalation::governance_failure(&meta.name, escalation);
            match office.process_router.route(&wrapped) {
                Some(found) => (found.level, found.binding, found.resume, wrapped),
                None => {
                    tracing::debug!(governance = %meta.name, process = %process.id(), "governance escalation unrouted");
                    thread.fail(wrapped);
                    return;
                }
            }
        }
    };

    office.metrics.record_escalation_handled();
    tracing::debug!(
        governance = %meta.name,
        process = %process.id(),
        %level,
        kind = %raised.kind(),
        "governance escalation routed"
    );
    let parameter = binding.parameter.extract(&raised);
    FunctionJob::new(binding.handler, thread.new_flow(), Some(parameter), resume).schedule();
}

/// One governance activity, run on the governance's team
struct GovernanceJob {
    container: Arc<GovernanceContainer>,
    governance: Arc<dyn Governance>,
    activity: Activity,
    object: Option<Value>,
    flow: Arc<Flow>,
}

impl Job for GovernanceJob {
    fn run(self: Box<Self>) {
        let process = Arc::clone(self.flow.thread().process());
        if !process.is_failed() {
            process.office().metrics.record_governance_activity();
            if let Err(escalation) = perform(self.governance.as_ref(), self.activity, self.object.as_ref()) {
                escalate(&self.container.meta, &self.flow, escalation);
            }
        }
        self.container.activity_done();
        self.flow.release();
    }

    fn affinity(&self) -> u64 {
        self.flow.thread().id().affinity_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_serde() {
        let json = serde_json::to_string(&DeactivationStrategy::Enforce).unwrap();
        assert_eq!(json, "\"enforce\"");
        let back: DeactivationStrategy = serde_json::from_str("\"disregard\"").unwrap();
        assert_eq!(back, DeactivationStrategy::Disregard);
    }

    struct Counting;

    impl Governance for Counting {
        fn govern(&self, _object: &Value) -> Result<(), Escalation> {
            Ok(())
        }

        fn enforce(&self) -> Result<(), Escalation> {
            Err(Escalation::failure("commit failed"))
        }
    }

    fn container(factory: Arc<dyn GovernanceFactory>) -> GovernanceContainer {
        let meta = GovernanceMetaData {
            name: "audit".to_string(),
            factory,
            team: Arc::new(crate::team::PassiveTeam::new("passive")),
            escalations: EscalationProcedure::empty(Arc::new(crate::escalation::EscalationTaxonomy::new())),
        };
        GovernanceContainer::new(Arc::new(meta))
    }

    #[test]
    fn test_failed_factory_disables_governance() {
        let factory = || -> Result<Arc<dyn Governance>, Escalation> { Err(Escalation::failure("no audit log")) };
        let container = container(Arc::new(factory));
        assert_eq!(container.state(), GovernanceState::Inactive);

        match container.instance() {
            Err(escalation) => assert_eq!(escalation.message(), "no audit log"),
            Ok(_) => panic!("factory failure not reported"),
        }
        assert_eq!(container.state(), GovernanceState::Failed);
        assert!(container.instance().unwrap().is_none());
        assert!(container.finish(DeactivationStrategy::Enforce).is_empty());
    }

    #[test]
    fn test_instance_is_created_once() {
        let factory = || -> Result<Arc<dyn Governance>, Escalation> { Ok(Arc::new(Counting)) };
        let container = container(Arc::new(factory));
        let first = container.instance().unwrap().unwrap();
        let second = container.instance().unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(container.state(), GovernanceState::Inactive);
    }

    #[test]
    fn test_perform_catches_panics() {
        struct Panicking;
        impl Governance for Panicking {
            fn govern(&self, _object: &Value) -> Result<(), Escalation> {
                panic!("bad object")
            }
            fn enforce(&self) -> Result<(), Escalation> {
                Ok(())
            }
        }
        let object: Value = Arc::new(1u8);
        let err = perform(&Panicking, Activity::Govern, Some(&object)).unwrap_err();
        assert!(err.message().contains("bad object"));
        assert!(perform(&Panicking, Activity::Enforce, None).is_ok());
        assert!(perform(&Counting, Activity::Disregard, None).is_ok());
        assert!(perform(&Counting, Activity::Enforce, None).is_err());
    }
}

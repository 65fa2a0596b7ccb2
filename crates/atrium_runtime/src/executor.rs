//! Function job execution.
//!
//! A [`FunctionJob`] is one pending execution of a function within a flow.
//! Running it is an explicit state machine: each [`FunctionJob::step`]
//! either finishes the branch, parks the job on an asset, or yields the next
//! job of the flow. Continuations on the same team run in a loop on the
//! current worker; nothing recurses across jobs.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::escalation::{Escalation, EscalationLevel, EscalationRouter, RouteMatch};
use crate::flow::Flow;
use crate::function::{FlowMode, FunctionContext, FunctionIndex, FunctionMetaData};
use crate::governance::DeactivationStrategy;
use crate::job::Job;
use crate::object::{lookup, resolve_objects, Readiness};
use crate::office::start_process;
use crate::process::ProcessState;
use crate::team::Team;
use crate::thread::{CompletionCallback, ThreadState};
use crate::Value;

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Continuation {
    function: FunctionIndex,
    parameter: Option<Value>,
}

enum Step {
    /// Branch finished; the flow was released
    Done,
    /// Job handed to an asset monitor
    Parked,
    /// Run this next
    Next(FunctionJob),
}

/// One pending function execution
pub(crate) struct FunctionJob {
    function: FunctionIndex,
    flow: Arc<Flow>,
    parameter: Option<Value>,
    /// Where escalations not handled by the function itself go
    router: Option<Arc<EscalationRouter>>,
    /// Pending sequential flows and `next` functions, innermost last
    continuations: Vec<Continuation>,
}

impl FunctionJob {
    pub(crate) fn new(
        function: FunctionIndex,
        flow: Arc<Flow>,
        parameter: Option<Value>,
        router: Option<Arc<EscalationRouter>>,
    ) -> Self {
        Self {
            function,
            flow,
            parameter,
            router,
            continuations: Vec::new(),
        }
    }

    fn team(&self) -> Arc<dyn Team> {
        let office = self.flow.thread().process().office();
        Arc::clone(&office.functions[self.function.0].team)
    }

    /// Hand the job to its function's team
    pub(crate) fn schedule(self) {
        self.team().assign(Box::new(self));
    }

    fn release(self) {
        self.flow.release();
    }

    fn step(mut self) -> Step {
        let thread = Arc::clone(self.flow.thread());
        let process = Arc::clone(thread.process());
        let office = Arc::clone(process.office());
        let meta = &office.functions[self.function.0];

        if process.is_failed() || self.flow.is_cancelled() {
            self.release();
            return Step::Done;
        }
        if process.take_cancel() {
            return self.escalate(Escalation::cancelled());
        }

        for index in meta.governance_touched() {
            if let Some(container) = process.existing_governance(index) {
                match container.wait_idle(self) {
                    Some(job) => self = job,
                    None => return Step::Parked,
                }
            }
        }

        let objects = match resolve_objects(&process, &thread, &meta.objects) {
            Readiness::Ready(objects) => objects,
            Readiness::Pending(container) => {
                tracing::debug!(function = %meta.name, object = %container.name(), "waiting on object");
                return match container.wait(self) {
                    Some(job) => Step::Next(job),
                    None => Step::Parked,
                };
            }
            Readiness::Failed(escalation) => return self.escalate(escalation),
        };

        // newly bound objects are governed before the function sees them
        if self.activate_governance(&process, &thread, meta, &objects) > 0 {
            return Step::Next(self);
        }

        self.execute(&process, &thread, meta, objects)
    }

    fn activate_governance(
        &self,
        process: &Arc<ProcessState>,
        thread: &ThreadState,
        meta: &FunctionMetaData,
        objects: &[Value],
    ) -> usize {
        let mut scheduled = 0;
        for governance in &meta.governance {
            let Some(container) = process.governance(*governance) else {
                continue;
            };
            let governed = meta
                .objects
                .iter()
                .zip(objects)
                .filter_map(|(index, object)| {
                    let object_container = lookup(process, thread, *index)?;
                    object_container
                        .meta()
                        .governance
                        .contains(governance)
                        .then(|| (object_container, Arc::clone(object)))
                })
                .collect();
            scheduled += container.activate(governed, &self.flow);
        }
        scheduled
    }

    fn execute(
        mut self,
        process: &Arc<ProcessState>,
        thread: &Arc<ThreadState>,
        meta: &FunctionMetaData,
        objects: Vec<Value>,
    ) -> Step {
        let office = process.office();
        office.metrics.record_job();
        tracing::debug!(
            function = %meta.name,
            index = %meta.index,
            process = %process.id(),
            thread = %thread.id(),
            team = %meta.team_name,
            "executing function"
        );

        let (outcome, instigations, listeners) = {
            let _execution = thread.execution().lock();
            let function = meta.factory.create();
            let mut context = FunctionContext::new(meta, self.parameter.take(), objects, process, thread);
            let outcome = catch_unwind(AssertUnwindSafe(|| function.execute(&mut context)));
            let (instigations, listeners) = context.into_parts();
            (outcome, instigations, listeners)
        };

        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(escalation)) => {
                office.metrics.record_function_failure();
                return self.escalate(escalation);
            }
            Err(panic) => {
                office.metrics.record_function_failure();
                let escalation = Escalation::function_panic(&meta.name, panic_message(panic.as_ref()));
                return self.escalate(escalation);
            }
        };

        for listener in listeners {
            process.add_listener(listener);
        }

        let mut enforced = Vec::new();
        for (index, strategy) in &meta.deactivate {
            if let Some(container) = process.existing_governance(*index) {
                if container.deactivate(*strategy, &self.flow) && *strategy == DeactivationStrategy::Enforce {
                    enforced.push(container);
                }
            }
        }

        let mut sequential = Vec::new();
        for instigation in instigations {
            match instigation.mode {
                FlowMode::Sequential => sequential.push(Continuation {
                    function: instigation.function,
                    parameter: instigation.parameter,
                }),
                FlowMode::Parallel => {
                    let flow = thread.new_flow();
                    FunctionJob::new(instigation.function, flow, instigation.parameter, self.router.clone())
                        .schedule();
                }
                FlowMode::Spawn { new_process: false, .. } => {
                    let callback = instigation.callback.map(|handler| self.callback(thread, handler));
                    let spawned = process.new_thread(callback);
                    let flow = spawned.new_flow();
                    let router = Some(Arc::clone(spawned.router()));
                    FunctionJob::new(instigation.function, flow, instigation.parameter, router).schedule();
                }
                FlowMode::Spawn { new_process: true, .. } => {
                    let callback = instigation.callback.map(|handler| self.callback(thread, handler));
                    start_process(office, instigation.function, instigation.parameter, callback);
                }
            }
        }

        if let Some(next) = meta.next {
            self.continuations.push(Continuation {
                function: next,
                parameter: value,
            });
        }
        self.continuations.extend(sequential.into_iter().rev());

        let Some(continuation) = self.continuations.pop() else {
            self.release();
            return Step::Done;
        };
        self.function = continuation.function;
        self.parameter = continuation.parameter;

        for container in enforced {
            match container.wait_idle(self) {
                Some(job) => self = job,
                None => return Step::Parked,
            }
        }
        Step::Next(self)
    }

    /// Reserve a flow in the invoking thread for a spawn callback, keeping
    /// that thread open until the spawned work completes
    fn callback(&self, thread: &Arc<ThreadState>, handler: FunctionIndex) -> CompletionCallback {
        let flow = thread.new_flow();
        let router = self.router.clone();
        Box::new(move |failure: Option<Escalation>| {
            let parameter = failure.map(|escalation| Arc::new(escalation) as Value);
            FunctionJob::new(handler, flow, parameter, router).schedule();
        })
    }

    /// Route an escalation: the function's own procedure, then the job's
    /// router chain. A match runs the handler as a new flow of this thread.
    fn escalate(self, escalation: Escalation) -> Step {
        let thread = Arc::clone(self.flow.thread());
        let process = Arc::clone(thread.process());
        let office = Arc::clone(process.office());
        let meta = &office.functions[self.function.0];

        let found = match meta.escalations.find(&escalation) {
            Some(binding) => Some(RouteMatch {
                level: EscalationLevel::Function,
                binding: binding.clone(),
                resume: self.router.clone(),
            }),
            None => self.router.as_ref().and_then(|router| router.route(&escalation)),
        };

        let Some(found) = found else {
            tracing::debug!(
                function = %meta.name,
                process = %process.id(),
                kind = %escalation.kind(),
                "escalation unrouted"
            );
            thread.fail(escalation);
            self.release();
            return Step::Done;
        };

        office.metrics.record_escalation_handled();
        tracing::debug!(
            function = %meta.name,
            process = %process.id(),
            level = %found.level,
            kind = %escalation.kind(),
            handler = %office.functions[found.binding.handler.0].name,
            "escalation routed"
        );
        let parameter = found.binding.parameter.extract(&escalation);
        // the handler flow exists before this one is released
        let handler = FunctionJob::new(found.binding.handler, thread.new_flow(), Some(parameter), found.resume);
        self.flow.cancel();
        self.release();
        Step::Next(handler)
    }
}

impl Job for FunctionJob {
    fn run(self: Box<Self>) {
        let mut job = *self;
        loop {
            let team = job.team();
            match job.step() {
                Step::Done | Step::Parked => return,
                Step::Next(next) => {
                    if std::ptr::addr_eq(Arc::as_ptr(&team), Arc::as_ptr(&next.team())) {
                        job = next;
                    } else {
                        next.schedule();
                        return;
                    }
                }
            }
        }
    }

    fn affinity(&self) -> u64 {
        self.flow.thread().id().affinity_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload = catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static text");

        let payload = catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 42");

        let payload = catch_unwind(|| std::panic::panic_any(7u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}

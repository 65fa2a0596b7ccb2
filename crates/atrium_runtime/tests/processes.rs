//! Flows, threads and processes end to end.

use atrium_runtime::{
    ConfigurationError, DeactivationStrategy, Escalation, EscalationType, FlowMode, FunctionBuilder, FunctionContext,
    Governance, GovernanceBuilder, ManagedObjectBuilder, ManagedObjectSource, Office, OfficeBuilder, OfficeError,
    RuntimeConfig, SourceContext, SyncSource, TeamDefinition, TeamKind, Value,
};
use crossbeam::channel::bounded;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

type Log = Arc<Mutex<Vec<String>>>;

fn run(office: &Office, function: &str) -> Option<Escalation> {
    let (tx, rx) = bounded(1);
    office
        .invoke(function, None, move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

fn step(log: &Log, name: &'static str) -> FunctionBuilder {
    let log = Arc::clone(log);
    FunctionBuilder::new(name, move |_ctx: &mut FunctionContext<'_>| {
        log.lock().push(name.to_string());
        Ok(None)
    })
}

fn threaded() -> RuntimeConfig {
    RuntimeConfig::default().with_team(TeamDefinition::new("single", TeamKind::OnePerson, 1))
}

#[test]
fn test_process_isolation() {
    let mut builder = OfficeBuilder::new("isolation", threaded());
    builder.add_function(FunctionBuilder::new("fail", |_ctx: &mut FunctionContext<'_>| {
        Err(Escalation::failure("unrouted"))
    }));
    builder.add_function(FunctionBuilder::new("work", |_ctx: &mut FunctionContext<'_>| {
        std::thread::sleep(Duration::from_millis(10));
        Ok(Some(Arc::new(1u8) as Value))
    }));
    builder.escalation_handler(|_process, _escalation: &Escalation| {});
    let office = builder.build().unwrap();
    office.open().unwrap();

    let (tx, rx) = bounded(2);
    let failing = tx.clone();
    office
        .invoke("fail", None, move |outcome| {
            let _ = failing.send(("fail", outcome.is_some()));
        })
        .unwrap();
    office
        .invoke("work", None, move |outcome| {
            let _ = tx.send(("work", outcome.is_some()));
        })
        .unwrap();

    let mut outcomes: Vec<_> = (0..2)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    outcomes.sort();
    assert_eq!(outcomes, vec![("fail", true), ("work", false)]);

    let metrics = office.metrics();
    assert_eq!(metrics.processes_completed, 2);
    assert_eq!(metrics.processes_failed, 1);
    assert_eq!(metrics.processes_in_flight(), 0);
}

#[test]
fn test_next_receives_return_value() {
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let mut builder = OfficeBuilder::new("next", RuntimeConfig::passive());
    builder.add_function(
        FunctionBuilder::new("first", |_ctx: &mut FunctionContext<'_>| Ok(Some(Arc::new(41u32) as Value)))
            .next("second"),
    );
    builder.add_function(FunctionBuilder::new("second", move |ctx: &mut FunctionContext<'_>| {
        *sink.lock() = ctx.parameter_as::<u32>().map(|value| value + 1);
        Ok(None)
    }));
    let office = builder.build().unwrap();
    office.open().unwrap();

    assert!(run(&office, "first").is_none());
    assert_eq!(*seen.lock(), Some(42));
}

#[test]
fn test_sequential_flows_run_before_next() {
    let log = Log::default();
    let sink = Arc::clone(&log);
    let mut builder = OfficeBuilder::new("sequential", RuntimeConfig::passive());
    builder.add_function(
        FunctionBuilder::new("start", move |ctx: &mut FunctionContext<'_>| {
            sink.lock().push("start".to_string());
            ctx.do_flow(0, None, FlowMode::Sequential)?;
            ctx.do_flow(1, None, FlowMode::Sequential)?;
            Ok(None)
        })
        .flow("a")
        .flow("b")
        .next("end"),
    );
    builder.add_function(step(&log, "a").next("a2"));
    builder.add_function(step(&log, "a2"));
    builder.add_function(step(&log, "b"));
    builder.add_function(step(&log, "end"));
    let office = builder.build().unwrap();
    office.open().unwrap();

    assert!(run(&office, "start").is_none());
    assert_eq!(*log.lock(), vec!["start", "a", "a2", "b", "end"]);
}

#[test]
fn test_undeclared_flow_is_an_escalation() {
    let mut builder = OfficeBuilder::new("flows", RuntimeConfig::passive());
    builder.add_function(FunctionBuilder::new("start", |ctx: &mut FunctionContext<'_>| {
        ctx.do_flow(3, None, FlowMode::Parallel)?;
        Ok(None)
    }));
    builder.escalation_handler(|_process, _escalation: &Escalation| {});
    let office = builder.build().unwrap();
    office.open().unwrap();

    let outcome = run(&office, "start").unwrap();
    assert!(outcome.is(EscalationType::FAILURE));
}

#[test]
fn test_parallel_flows_complete_before_process() {
    let log = Log::default();
    let sink = Arc::clone(&log);
    let mut builder = OfficeBuilder::new("parallel", threaded());
    builder.add_function(
        FunctionBuilder::new("fan_out", move |ctx: &mut FunctionContext<'_>| {
            sink.lock().push("fan_out".to_string());
            for _ in 0..8 {
                ctx.do_flow(0, None, FlowMode::Parallel)?;
            }
            Ok(None)
        })
        .flow("branch"),
    );
    builder.add_function(step(&log, "branch"));
    let office = builder.build().unwrap();
    office.open().unwrap();

    assert!(run(&office, "fan_out").is_none());
    let log = log.lock();
    assert_eq!(log.len(), 9);
    assert_eq!(log.iter().filter(|entry| *entry == "branch").count(), 8);
}

#[test]
fn test_spawned_thread_failure_goes_to_callback() {
    let log = Log::default();
    let sink = Arc::clone(&log);
    let mut builder = OfficeBuilder::new("spawn", threaded());
    builder.add_function(
        FunctionBuilder::new("parent", |ctx: &mut FunctionContext<'_>| {
            ctx.do_flow(
                0,
                None,
                FlowMode::Spawn {
                    new_process: false,
                    callback: Some(1),
                },
            )?;
            Ok(None)
        })
        .flow("child")
        .flow("joined"),
    );
    builder.add_function(FunctionBuilder::new("child", |_ctx: &mut FunctionContext<'_>| {
        Err(Escalation::failure("child broke"))
    }));
    builder.add_function(FunctionBuilder::new("joined", move |ctx: &mut FunctionContext<'_>| {
        let failure = ctx
            .parameter_as::<Escalation>()
            .map_or_else(|| "ok".to_string(), |e| e.message().to_string());
        sink.lock().push(failure);
        Ok(None)
    }));
    let office = builder.build().unwrap();
    office.open().unwrap();

    assert!(run(&office, "parent").is_none());
    assert_eq!(*log.lock(), vec!["child broke".to_string()]);
}

#[test]
fn test_spawned_process_reports_to_invoker() {
    let log = Log::default();
    let mut builder = OfficeBuilder::new("spawn", threaded());
    builder.add_function(
        FunctionBuilder::new("parent", |ctx: &mut FunctionContext<'_>| {
            ctx.do_flow(
                0,
                Some(Arc::new(5u32) as Value),
                FlowMode::Spawn {
                    new_process: true,
                    callback: Some(1),
                },
            )?;
            Ok(None)
        })
        .flow("child")
        .flow("joined"),
    );
    let sink = Arc::clone(&log);
    builder.add_function(FunctionBuilder::new("child", move |ctx: &mut FunctionContext<'_>| {
        sink.lock().push(format!("child:{}", ctx.parameter_as::<u32>().copied().unwrap_or_default()));
        Ok(None)
    }));
    builder.add_function(step(&log, "joined"));
    let office = builder.build().unwrap();
    office.open().unwrap();

    assert!(run(&office, "parent").is_none());
    assert_eq!(*log.lock(), vec!["child:5", "joined"]);
    assert_eq!(office.metrics().processes_started, 2);
}

#[test]
fn test_listeners_run_in_order_then_callback() {
    let log = Log::default();
    let office_sink = Arc::clone(&log);
    let function_sink = Arc::clone(&log);
    let mut builder = OfficeBuilder::new("listeners", RuntimeConfig::passive());
    builder.process_listener(move |_process, _failure: Option<&Escalation>| {
        office_sink.lock().push("office".to_string());
    });
    builder.add_function(FunctionBuilder::new("work", move |ctx: &mut FunctionContext<'_>| {
        let sink = Arc::clone(&function_sink);
        ctx.on_process_complete(move |_process, _failure| sink.lock().push("function".to_string()));
        Ok(None)
    }));
    let office = builder.build().unwrap();
    office.open().unwrap();

    let callback_sink = Arc::clone(&log);
    office
        .invoke("work", None, move |_outcome| {
            callback_sink.lock().push("callback".to_string());
        })
        .unwrap();
    assert_eq!(*log.lock(), vec!["office", "function", "callback"]);
}

#[test]
fn test_cancel_raises_on_next_job() {
    let (release, gate) = bounded::<()>(1);
    let mut builder = OfficeBuilder::new("cancel", threaded());
    builder.add_function(
        FunctionBuilder::new("block", move |_ctx: &mut FunctionContext<'_>| {
            let _ = gate.recv_timeout(Duration::from_secs(5));
            Ok(None)
        })
        .next("after"),
    );
    builder.add_function(FunctionBuilder::new("after", |_ctx: &mut FunctionContext<'_>| Ok(None)));
    builder.escalation_handler(|_process, _escalation: &Escalation| {});
    let office = builder.build().unwrap();
    office.open().unwrap();

    let (tx, rx) = bounded(1);
    let process = office
        .invoke("block", None, move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();
    process.cancel();
    release.send(()).unwrap();

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert!(outcome.is(EscalationType::CANCELLED));
    assert!(process.is_complete());
    assert!(process.is_failed());
}

#[test]
fn test_invoke_requires_open_office() {
    let mut builder = OfficeBuilder::new("closed", RuntimeConfig::passive());
    builder.add_function(FunctionBuilder::new("work", |_ctx: &mut FunctionContext<'_>| Ok(None)));
    let office = builder.build().unwrap();

    assert!(matches!(
        office.invoke("work", None, |_| {}),
        Err(OfficeError::NotOpen { .. })
    ));
    office.open().unwrap();
    assert!(matches!(
        office.invoke("missing", None, |_| {}),
        Err(OfficeError::UnknownFunction { .. })
    ));
    office.close();
    office.close();
    assert_eq!(office.open(), Err(OfficeError::Closed));
}

#[test]
fn test_configuration_errors() {
    let work = || FunctionBuilder::new("work", |_ctx: &mut FunctionContext<'_>| Ok(None));

    let mut builder = OfficeBuilder::new("dup", RuntimeConfig::passive());
    builder.add_function(work());
    builder.add_function(work());
    assert!(matches!(
        builder.build(),
        Err(ConfigurationError::DuplicateFunction { .. })
    ));

    let mut builder = OfficeBuilder::new("team", RuntimeConfig::passive());
    builder.add_function(work().team("nowhere"));
    assert!(matches!(builder.build(), Err(ConfigurationError::UnknownTeam { .. })));

    let mut builder = OfficeBuilder::new("next", RuntimeConfig::passive());
    builder.add_function(work().next("missing"));
    assert!(matches!(
        builder.build(),
        Err(ConfigurationError::UnknownFunction { .. })
    ));

    let mut builder = OfficeBuilder::new("handler", RuntimeConfig::passive());
    builder.add_function(work().escalation("Failure", "missing"));
    assert!(matches!(
        builder.build(),
        Err(ConfigurationError::UnknownFunction { .. })
    ));

    let mut builder = OfficeBuilder::new("twice", RuntimeConfig::passive());
    builder.add_function(work());
    builder.process_escalation("Failure", "work").process_escalation("Failure", "work");
    assert!(matches!(
        builder.build(),
        Err(ConfigurationError::DuplicateEscalation { .. })
    ));

    let mut builder = OfficeBuilder::new("taxonomy", RuntimeConfig::passive());
    builder.declare_escalation("Orphan", "NoSuchParent");
    assert!(matches!(
        builder.build(),
        Err(ConfigurationError::EscalationType { .. })
    ));

    let mut builder = OfficeBuilder::new("governance", RuntimeConfig::passive());
    builder.add_function(work().govern(2));
    assert!(matches!(
        builder.build(),
        Err(ConfigurationError::UnknownGovernance { .. })
    ));

    let mut config = RuntimeConfig::passive();
    config.default_team = "absent".to_string();
    assert!(matches!(
        OfficeBuilder::new("config", config).build(),
        Err(ConfigurationError::Config(_))
    ));
}

#[tokio::test]
async fn test_invoke_async_resolves() {
    let mut builder = OfficeBuilder::new("async", threaded());
    builder.add_function(FunctionBuilder::new("work", |_ctx: &mut FunctionContext<'_>| Ok(None)));
    builder.add_function(FunctionBuilder::new("fail", |_ctx: &mut FunctionContext<'_>| {
        Err(Escalation::failure("nope"))
    }));
    builder.escalation_handler(|_process, _escalation: &Escalation| {});
    let office = builder.build().unwrap();
    office.open().unwrap();

    let completion = office.invoke_async("work", None).unwrap();
    let process = completion.process().clone();
    assert!(completion.await.is_none());
    assert!(process.is_complete());

    let failure = office.invoke_async("fail", None).unwrap().await.unwrap();
    assert_eq!(failure.message(), "nope");
}

#[test]
fn test_completion_wait_blocks() {
    let mut builder = OfficeBuilder::new("wait", threaded());
    builder.add_function(FunctionBuilder::new("work", |_ctx: &mut FunctionContext<'_>| {
        std::thread::sleep(Duration::from_millis(5));
        Ok(None)
    }));
    let office = builder.build().unwrap();
    office.open().unwrap();

    assert!(office.invoke_async("work", None).unwrap().wait().is_none());
}

/// Governance that records its activities
struct Journal {
    log: Log,
    fail_enforce: bool,
}

impl Governance for Journal {
    fn govern(&self, object: &Value) -> Result<(), Escalation> {
        let name = object.downcast_ref::<&str>().copied().unwrap_or("?");
        self.log.lock().push(format!("govern:{}", name));
        Ok(())
    }

    fn enforce(&self) -> Result<(), Escalation> {
        self.log.lock().push("enforce".to_string());
        if self.fail_enforce {
            return Err(Escalation::failure("commit rejected"));
        }
        Ok(())
    }

    fn disregard(&self) -> Result<(), Escalation> {
        self.log.lock().push("disregard".to_string());
        Ok(())
    }
}

fn governed_office(log: &Log, config: RuntimeConfig, deactivate: Option<DeactivationStrategy>, fail: bool) -> Office {
    let mut builder = OfficeBuilder::new("governance", config);
    let journal_log = Arc::clone(log);
    let governance = builder.add_governance(GovernanceBuilder::new("transaction", move || {
        Ok(Arc::new(Journal {
            log: Arc::clone(&journal_log),
            fail_enforce: fail,
        }) as Arc<dyn Governance>)
    }));
    let connection = builder.add_object(
        ManagedObjectBuilder::new("connection", SyncSource::new(|_| Ok(Arc::new("connection") as Value)))
            .governed_by(governance),
    );
    let mut work = step(log, "work").object(connection).govern(governance);
    if let Some(strategy) = deactivate {
        work = work.deactivate(governance, strategy).next("after");
    }
    builder.add_function(work);
    builder.add_function(step(log, "after"));
    builder.add_function(FunctionBuilder::new("on_governance", {
        let log = Arc::clone(log);
        move |ctx: &mut FunctionContext<'_>| {
            let kind = ctx.parameter_as::<Escalation>().map(|e| e.kind().to_string());
            log.lock().extend(kind);
            Ok(None)
        }
    }));
    builder.process_escalation(EscalationType::GOVERNANCE_FAILURE, "on_governance");
    let office = builder.build().unwrap();
    office.open().unwrap();
    office
}

#[test]
fn test_governance_enforced_before_next() {
    let log = Log::default();
    let office = governed_office(&log, RuntimeConfig::passive(), Some(DeactivationStrategy::Enforce), false);
    assert!(run(&office, "work").is_none());
    assert_eq!(*log.lock(), vec!["govern:connection", "work", "enforce", "after"]);
    assert_eq!(office.metrics().governance_activities, 2);
}

#[test]
fn test_governance_enforced_with_worker_teams() {
    let log = Log::default();
    let office = governed_office(&log, threaded(), Some(DeactivationStrategy::Enforce), false);
    assert!(run(&office, "work").is_none());
    assert_eq!(*log.lock(), vec!["govern:connection", "work", "enforce", "after"]);
}

#[test]
fn test_governance_disregarded_at_completion() {
    let log = Log::default();
    let office = governed_office(&log, RuntimeConfig::passive(), None, false);
    assert!(run(&office, "work").is_none());
    assert_eq!(*log.lock(), vec!["govern:connection", "work", "disregard"]);
}

#[test]
fn test_governance_failure_routes_past_function() {
    let log = Log::default();
    let office = governed_office(&log, RuntimeConfig::passive(), Some(DeactivationStrategy::Enforce), true);
    assert!(run(&office, "work").is_none());
    assert_eq!(
        *log.lock(),
        vec!["govern:connection", "work", "enforce", "GovernanceFailure", "after"]
    );
}

#[test]
fn test_governance_enforced_at_completion_routes_failure() {
    let log = Log::default();
    let config = RuntimeConfig::passive().with_governance_deactivation(DeactivationStrategy::Enforce);
    let office = governed_office(&log, config, None, true);
    assert!(run(&office, "work").is_none());
    assert_eq!(
        *log.lock(),
        vec!["govern:connection", "work", "enforce", "GovernanceFailure"]
    );
    let metrics = office.metrics();
    assert_eq!(metrics.governance_activities, 2);
    assert_eq!(metrics.escalations_handled, 1);
}

#[test]
fn test_governance_enforced_at_completion_on_worker_team() {
    let log = Log::default();
    let config = threaded().with_governance_deactivation(DeactivationStrategy::Enforce);
    let office = governed_office(&log, config, None, false);
    assert!(run(&office, "work").is_none());
    assert_eq!(*log.lock(), vec!["govern:connection", "work", "enforce"]);
}

#[test]
fn test_unrouted_completion_governance_failure_fails_process() {
    let log = Log::default();
    let reported = Arc::new(Mutex::new(Vec::new()));
    let mut builder = OfficeBuilder::new(
        "completion",
        RuntimeConfig::passive().with_governance_deactivation(DeactivationStrategy::Enforce),
    );
    let journal_log = Arc::clone(&log);
    let governance = builder.add_governance(GovernanceBuilder::new("transaction", move || {
        Ok(Arc::new(Journal {
            log: Arc::clone(&journal_log),
            fail_enforce: true,
        }) as Arc<dyn Governance>)
    }));
    let connection = builder.add_object(
        ManagedObjectBuilder::new("connection", SyncSource::new(|_| Ok(Arc::new("connection") as Value)))
            .governed_by(governance),
    );
    builder.add_function(step(&log, "work").object(connection).govern(governance));
    let sink = Arc::clone(&reported);
    builder.escalation_handler(move |_process, escalation: &Escalation| {
        sink.lock().push(escalation.kind().to_string());
    });
    let office = builder.build().unwrap();
    office.open().unwrap();

    let outcome = run(&office, "work").unwrap();
    assert!(outcome.is(EscalationType::GOVERNANCE_FAILURE));
    assert_eq!(outcome.cause().map(Escalation::message), Some("commit rejected"));
    assert_eq!(*reported.lock(), vec![EscalationType::GOVERNANCE_FAILURE]);
    assert_eq!(office.metrics().escalations_unhandled, 1);
}

/// Source that never produces its object
#[derive(Default)]
struct Silent {
    pending: Mutex<Vec<SourceContext>>,
}

impl ManagedObjectSource for Silent {
    fn source_object(&self, context: SourceContext) -> Result<(), Escalation> {
        self.pending.lock().push(context);
        Ok(())
    }
}

#[test]
fn test_cancel_wakes_job_parked_on_object() {
    let mut builder = OfficeBuilder::new("cancel-parked", threaded());
    let feed = builder.add_object(ManagedObjectBuilder::new("feed", Silent::default()).asynchronous());
    builder.add_function(FunctionBuilder::new("consume", |_ctx: &mut FunctionContext<'_>| Ok(None)).object(feed));
    builder.escalation_handler(|_process, _escalation: &Escalation| {});
    let office = builder.build().unwrap();
    office.open().unwrap();

    let (tx, rx) = bounded(1);
    let process = office
        .invoke("consume", None, move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(!process.is_complete());
    process.cancel();

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert!(outcome.is(EscalationType::CANCELLED));
    assert!(process.is_complete());
}

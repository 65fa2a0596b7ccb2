//! Escalation routing through a running office.

use atrium_runtime::{
    Escalation, EscalationType, FunctionBuilder, FunctionContext, Office, OfficeBuilder, RuntimeConfig,
};
use crossbeam::channel::bounded;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

type Log = Arc<Mutex<Vec<String>>>;

fn recorder(log: &Log, entry: &'static str) -> FunctionBuilder {
    let log = Arc::clone(log);
    FunctionBuilder::new(entry, move |ctx: &mut FunctionContext<'_>| {
        let kind = ctx
            .parameter_as::<Escalation>()
            .map(|escalation| escalation.kind().to_string())
            .unwrap_or_default();
        log.lock().push(format!("{}:{}", entry, kind));
        Ok(None)
    })
}

fn raising(name: &str, kind: &'static str) -> FunctionBuilder {
    FunctionBuilder::new(name, move |_ctx: &mut FunctionContext<'_>| Err(Escalation::new(kind, "raised")))
}

fn run(office: &Office, function: &str) -> Option<Escalation> {
    let (tx, rx) = bounded(1);
    office
        .invoke(function, None, move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

fn builder() -> OfficeBuilder {
    let mut builder = OfficeBuilder::new("escalation", RuntimeConfig::passive());
    builder
        .declare_escalation("IOException", "Failure")
        .declare_escalation("FileNotFoundException", "IOException")
        .declare_escalation("SQLException", "Failure");
    builder
}

#[test]
fn test_most_specific_handler_wins() {
    let log = Log::default();
    let mut builder = builder();
    builder.add_function(
        raising("read", "FileNotFoundException")
            .escalation("IOException", "on_io")
            .escalation("FileNotFoundException", "on_missing"),
    );
    builder.add_function(recorder(&log, "on_io"));
    builder.add_function(recorder(&log, "on_missing"));
    let office = builder.build().unwrap();
    office.open().unwrap();

    assert!(run(&office, "read").is_none());
    assert_eq!(*log.lock(), vec!["on_missing:FileNotFoundException".to_string()]);
}

#[test]
fn test_supertype_handler_catches_subtype() {
    let log = Log::default();
    let mut builder = builder();
    builder.add_function(raising("read", "FileNotFoundException").escalation("IOException", "on_io"));
    builder.add_function(recorder(&log, "on_io"));
    let office = builder.build().unwrap();
    office.open().unwrap();

    assert!(run(&office, "read").is_none());
    assert_eq!(*log.lock(), vec!["on_io:FileNotFoundException".to_string()]);
}

#[test]
fn test_process_level_fallback_skips_inner_levels() {
    let log = Log::default();
    let mut builder = builder();
    builder.add_function(raising("read", "IOException").escalation("SQLException", "on_function"));
    builder.add_function(recorder(&log, "on_function"));
    builder.add_function(recorder(&log, "on_thread"));
    builder.add_function(recorder(&log, "on_process"));
    builder
        .thread_escalation("SQLException", "on_thread")
        .process_escalation("IOException", "on_process");
    let office = builder.build().unwrap();
    office.open().unwrap();

    assert!(run(&office, "read").is_none());
    assert_eq!(*log.lock(), vec!["on_process:IOException".to_string()]);
}

#[test]
fn test_handler_escalation_continues_outward() {
    let log = Log::default();
    let mut builder = builder();
    builder.add_function(
        raising("read", "IOException")
            .escalation("IOException", "retry")
            .escalation("SQLException", "never"),
    );
    builder.add_function(raising("retry", "SQLException"));
    builder.add_function(recorder(&log, "never"));
    builder.add_function(recorder(&log, "on_system"));
    builder.system_escalation("SQLException", "on_system");
    let office = builder.build().unwrap();
    office.open().unwrap();

    assert!(run(&office, "read").is_none());
    assert_eq!(*log.lock(), vec!["on_system:SQLException".to_string()]);
}

#[test]
fn test_unrouted_escalation_reaches_leaf_handler() {
    let reported = Log::default();
    let sink = Arc::clone(&reported);
    let mut builder = builder();
    builder.add_function(raising("read", "SQLException"));
    builder.escalation_handler(move |_process, escalation: &Escalation| {
        sink.lock().push(escalation.kind().to_string());
    });
    let office = builder.build().unwrap();
    office.open().unwrap();

    let outcome = run(&office, "read").unwrap();
    assert!(outcome.is("SQLException"));
    assert_eq!(*reported.lock(), vec!["SQLException".to_string()]);

    let metrics = office.metrics();
    assert_eq!(metrics.escalations_unhandled, 1);
    assert_eq!(metrics.processes_failed, 1);
    assert_eq!(metrics.processes_completed, 1);
}

#[test]
fn test_panic_becomes_function_panic() {
    let mut builder = builder();
    builder.add_function(FunctionBuilder::new("explode", |_ctx: &mut FunctionContext<'_>| {
        panic!("boom")
    }));
    builder.escalation_handler(|_process, _escalation: &Escalation| {});
    let office = builder.build().unwrap();
    office.open().unwrap();

    let outcome = run(&office, "explode").unwrap();
    assert!(outcome.is(EscalationType::FUNCTION_PANIC));
    assert!(outcome.message().contains("boom"));
    assert_eq!(office.metrics().functions_failed, 1);
}

#[test]
fn test_cause_parameter() {
    let log = Log::default();
    let sink = Arc::clone(&log);
    let mut builder = builder();
    builder.add_function(
        FunctionBuilder::new("wrap", |_ctx: &mut FunctionContext<'_>| {
            Err(Escalation::new("SQLException", "query failed")
                .with_cause(Escalation::new("IOException", "socket closed")))
        })
        .escalation_cause("SQLException", "inspect"),
    );
    builder.add_function(FunctionBuilder::new("inspect", move |ctx: &mut FunctionContext<'_>| {
        let cause = ctx.parameter_as::<Escalation>().map(|e| e.message().to_string());
        sink.lock().extend(cause);
        Ok(None)
    }));
    let office = builder.build().unwrap();
    office.open().unwrap();

    assert!(run(&office, "wrap").is_none());
    assert_eq!(*log.lock(), vec!["socket closed".to_string()]);
}

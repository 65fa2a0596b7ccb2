//! Demonstration office used by `atrium run`.
//!
//! A small ingest pipeline touching every part of the runtime: an
//! asynchronous feed object, a process-scoped ledger, a thread-scoped batch
//! depending on the ledger, an audit governance, parallel and spawned flows,
//! and a declared escalation type recovered at the process level.

use atrium_runtime::{
    ConfigurationError, DeactivationStrategy, Escalation, FlowMode, FunctionBuilder, FunctionContext, Governance,
    GovernanceBuilder, ManagedObjectBuilder, ManagedObjectSource, ObjectScope, Office, OfficeBuilder, RuntimeConfig,
    SourceContext, SyncSource, Value,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Declared escalation type raised by `reject`
pub const REJECTED: &str = "Rejected";

/// Functions a host can trigger
pub const ENTRY_POINTS: [&str; 2] = ["ingest", "reject"];

type Ledger = Mutex<Vec<u64>>;

/// Produces readings on a background thread
struct Feed {
    next: AtomicU64,
    delay: Duration,
}

impl ManagedObjectSource for Feed {
    fn source_object(&self, context: SourceContext) -> Result<(), Escalation> {
        let reading = self.next.fetch_add(1, Ordering::Relaxed);
        let delay = self.delay;
        std::thread::Builder::new()
            .name("feed".to_string())
            .spawn(move || {
                std::thread::sleep(delay);
                context.ready(Arc::new(reading));
            })
            .map_err(|error| Escalation::failure(format!("feed thread: {}", error)))?;
        Ok(())
    }

    fn recycle(&self, object: Value, cleanup: &[Escalation]) {
        if let Some(reading) = object.downcast_ref::<u64>() {
            tracing::debug!(reading, cleanup = cleanup.len(), "reading recycled");
        }
    }
}

/// Counts governed readings and reports them on enforcement
#[derive(Default)]
struct Audit {
    governed: AtomicU64,
}

impl Governance for Audit {
    fn govern(&self, _object: &Value) -> Result<(), Escalation> {
        self.governed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn enforce(&self) -> Result<(), Escalation> {
        tracing::info!(governed = self.governed.load(Ordering::Relaxed), "audit enforced");
        Ok(())
    }
}

/// Build the demonstration office
///
/// # Errors
///
/// Returns error if `config` is invalid for the office, for example when it
/// declares no team named by its `default_team`
pub fn build(config: RuntimeConfig) -> Result<Office, ConfigurationError> {
    let mut builder = OfficeBuilder::new("demo", config);
    builder.declare_escalation(REJECTED, "Failure");

    let audit = builder.add_governance(GovernanceBuilder::new("audit", || {
        Ok(Arc::new(Audit::default()) as Arc<dyn Governance>)
    }));

    let feed = builder.add_object(
        ManagedObjectBuilder::new(
            "feed",
            Feed {
                next: AtomicU64::new(1),
                delay: Duration::from_millis(5),
            },
        )
        .timeout(Duration::from_secs(1))
        .governed_by(audit),
    );
    let ledger = builder.add_object(ManagedObjectBuilder::new(
        "ledger",
        SyncSource::new(|_| Ok(Arc::new(Ledger::default()) as Value)),
    ));
    let batch = builder.add_object(
        ManagedObjectBuilder::new(
            "batch",
            SyncSource::new(|context| {
                let entries = context.dependency_as::<Ledger>(0).map_or(0, |ledger| ledger.lock().len());
                Ok(Arc::new(entries) as Value)
            }),
        )
        .scope(ObjectScope::Thread)
        .depends_on(ledger),
    );

    builder.add_function(
        FunctionBuilder::new("ingest", |ctx: &mut FunctionContext<'_>| {
            let reading = *ctx.object::<u64>(0)?;
            ctx.object::<Ledger>(1)?.lock().push(reading);
            for _ in 0..2 {
                ctx.do_flow(0, Some(Arc::new(reading) as Value), FlowMode::Parallel)?;
            }
            ctx.do_flow(
                1,
                None,
                FlowMode::Spawn {
                    new_process: false,
                    callback: Some(2),
                },
            )?;
            ctx.on_process_complete(|process, failure| {
                tracing::info!(%process, failed = failure.is_some(), "ingest process complete");
            });
            Ok(Some(Arc::new(reading) as Value))
        })
        .object(feed)
        .object(ledger)
        .govern(audit)
        .deactivate(audit, DeactivationStrategy::Enforce)
        .flow("inspect")
        .flow("summarize")
        .flow("summarized")
        .next("report"),
    );
    builder.add_function(FunctionBuilder::new("inspect", |ctx: &mut FunctionContext<'_>| {
        let reading = ctx.parameter_as::<u64>().copied().unwrap_or_default();
        tracing::debug!(reading, thread = %ctx.thread_id(), "inspected");
        Ok(None)
    }));
    builder.add_function(
        FunctionBuilder::new("summarize", |ctx: &mut FunctionContext<'_>| {
            let entries = *ctx.object::<usize>(0)?;
            tracing::debug!(entries, "batch summarized");
            Ok(None)
        })
        .object(batch),
    );
    builder.add_function(FunctionBuilder::new("summarized", |ctx: &mut FunctionContext<'_>| {
        if let Some(failure) = ctx.parameter_as::<Escalation>() {
            tracing::warn!(%failure, "summary failed");
        }
        Ok(None)
    }));
    builder.add_function(FunctionBuilder::new("report", |ctx: &mut FunctionContext<'_>| {
        let reading = ctx.parameter_as::<u64>().copied().unwrap_or_default();
        tracing::info!(reading, process = %ctx.process_id(), "reading ingested");
        Ok(None)
    }));

    builder.add_function(FunctionBuilder::new("reject", |_ctx: &mut FunctionContext<'_>| {
        Err(Escalation::new(REJECTED, "input rejected"))
    }));
    builder.add_function(FunctionBuilder::new("recover", |ctx: &mut FunctionContext<'_>| {
        if let Some(escalation) = ctx.parameter_as::<Escalation>() {
            tracing::info!(%escalation, "recovered at process level");
        }
        Ok(None)
    }));
    builder.process_escalation(REJECTED, "recover");

    builder.process_listener(|process, failure: Option<&Escalation>| {
        tracing::debug!(%process, failed = failure.is_some(), "process listener");
    });

    builder.build()
}

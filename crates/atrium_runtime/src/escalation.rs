//! Escalations and their routing.
//!
//! An [`Escalation`] is a typed failure value. Types form a single-parent
//! tree rooted at `Failure`, declared up front in an [`EscalationTaxonomy`].
//! Each level of the runtime (function, thread, process, system, governance)
//! owns an [`EscalationProcedure`]: an ordered binding table sorted once when
//! the office is built, so the first assignable binding is the most specific
//! one. Routers chain the levels outward.

use indexmap::IndexMap;
use std::any::Any;
use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use atrium_core::{CoreError, CoreResult, ProcessId};

use crate::function::FunctionIndex;
use crate::Value;

/// Name of an escalation type
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EscalationType(Arc<str>);

impl EscalationType {
    /// Root of every escalation type
    pub const FAILURE: &'static str = "Failure";
    /// An object could not be sourced
    pub const SOURCING_FAILURE: &'static str = "SourcingFailure";
    /// An asynchronous object did not become ready in time
    pub const SOURCE_TIMEOUT: &'static str = "SourceTimeout";
    /// A function body panicked
    pub const FUNCTION_PANIC: &'static str = "FunctionPanic";
    /// A governance activity failed
    pub const GOVERNANCE_FAILURE: &'static str = "GovernanceFailure";
    /// The process was cancelled by its host
    pub const CANCELLED: &'static str = "Cancelled";

    /// Create a type name
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Type name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EscalationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for EscalationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EscalationType({})", self.0)
    }
}

impl From<&str> for EscalationType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Payload carried by `SourceTimeout` escalations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTimeout {
    /// Object that timed out
    pub object: String,
    /// Configured readiness timeout
    pub timeout: Duration,
}

/// A typed failure raised during execution
#[derive(Clone)]
pub struct Escalation {
    kind: EscalationType,
    message: String,
    cause: Option<Box<Escalation>>,
    payload: Option<Value>,
}

impl Escalation {
    /// Create an escalation of the given type
    #[must_use]
    pub fn new(kind: impl Into<EscalationType>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
            payload: None,
        }
    }

    /// Generic `Failure`
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(EscalationType::FAILURE, message)
    }

    /// `SourcingFailure` for an object
    #[must_use]
    pub fn sourcing_failure(object: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            EscalationType::SOURCING_FAILURE,
            format!("Failed to source {}: {}", object, reason),
        )
    }

    /// `SourceTimeout` for an object, carrying a [`SourceTimeout`] payload
    #[must_use]
    pub fn source_timeout(object: &str, timeout: Duration) -> Self {
        Self::new(
            EscalationType::SOURCE_TIMEOUT,
            format!("Object {} not ready within {:?}", object, timeout),
        )
        .with_payload(Arc::new(SourceTimeout {
            object: object.to_string(),
            timeout,
        }))
    }

    /// `FunctionPanic` for a function body
    #[must_use]
    pub fn function_panic(function: &str, message: impl fmt::Display) -> Self {
        Self::new(
            EscalationType::FUNCTION_PANIC,
            format!("Function {} panicked: {}", function, message),
        )
    }

    /// `GovernanceFailure` wrapping the activity's own escalation
    #[must_use]
    pub fn governance_failure(governance: &str, cause: Escalation) -> Self {
        Self::new(
            EscalationType::GOVERNANCE_FAILURE,
            format!("Governance {} failed", governance),
        )
        .with_cause(cause)
    }

    /// `Cancelled`
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(EscalationType::CANCELLED, "Process cancelled")
    }

    /// Attach a cause
    #[must_use]
    pub fn with_cause(mut self, cause: Escalation) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Attach an arbitrary payload
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Escalation type
    #[must_use]
    pub fn kind(&self) -> &EscalationType {
        &self.kind
    }

    /// Whether the type is exactly `kind` (ignores the hierarchy)
    #[must_use]
    pub fn is(&self, kind: &str) -> bool {
        self.kind.name() == kind
    }

    /// Human-readable message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Underlying escalation, if any
    #[must_use]
    pub fn cause(&self) -> Option<&Escalation> {
        self.cause.as_deref()
    }

    /// Raw payload
    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Payload downcast to a concrete type
    #[must_use]
    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref::<T>())
    }
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {})", cause)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Escalation")
            .field("kind", &self.kind.name())
            .field("message", &self.message)
            .field("cause", &self.cause)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

impl std::error::Error for Escalation {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// Single-parent hierarchy of escalation types.
///
/// Types never declared are treated as direct children of `Failure`.
#[derive(Debug, Clone)]
pub struct EscalationTaxonomy {
    parents: IndexMap<EscalationType, Option<EscalationType>>,
}

impl Default for EscalationTaxonomy {
    fn default() -> Self {
        Self::new()
    }
}

impl EscalationTaxonomy {
    /// Taxonomy holding the built-in types
    #[must_use]
    pub fn new() -> Self {
        let failure = EscalationType::new(EscalationType::FAILURE);
        let sourcing = EscalationType::new(EscalationType::SOURCING_FAILURE);
        let mut parents = IndexMap::new();
        parents.insert(failure.clone(), None);
        parents.insert(sourcing.clone(), Some(failure.clone()));
        parents.insert(EscalationType::new(EscalationType::SOURCE_TIMEOUT), Some(sourcing));
        for name in [
            EscalationType::FUNCTION_PANIC,
            EscalationType::GOVERNANCE_FAILURE,
            EscalationType::CANCELLED,
        ] {
            parents.insert(EscalationType::new(name), Some(failure.clone()));
        }
        Self { parents }
    }

    /// Declare `kind` as a subtype of `parent`
    ///
    /// # Errors
    ///
    /// Returns error if `parent` is unknown or `kind` was already declared
    /// under a different parent
    pub fn declare(&mut self, kind: impl Into<EscalationType>, parent: impl Into<EscalationType>) -> CoreResult<()> {
        let kind = kind.into();
        let parent = parent.into();
        if !self.parents.contains_key(&parent) {
            return Err(CoreError::not_found("Escalation type", parent.name()));
        }
        match self.parents.get(&kind) {
            Some(existing) if existing.as_ref() == Some(&parent) => Ok(()),
            Some(_) => Err(CoreError::already_exists("Escalation type", kind.name())),
            None => {
                self.parents.insert(kind, Some(parent));
                Ok(())
            }
        }
    }

    /// Whether the type has been declared
    #[must_use]
    pub fn contains(&self, kind: &EscalationType) -> bool {
        self.parents.contains_key(kind)
    }

    /// Parent of a type; `None` only for the root
    #[must_use]
    pub fn parent_of(&self, kind: &EscalationType) -> Option<EscalationType> {
        match self.parents.get(kind) {
            Some(parent) => parent.clone(),
            None => Some(EscalationType::new(EscalationType::FAILURE)),
        }
    }

    /// Distance from the root
    #[must_use]
    pub fn depth(&self, kind: &EscalationType) -> usize {
        let mut depth = 0;
        let mut current = self.parent_of(kind);
        while let Some(parent) = current {
            depth += 1;
            current = self.parent_of(&parent);
        }
        depth
    }

    /// Whether a raised type can be handled by a binding declared for `declared`
    #[must_use]
    pub fn is_assignable(&self, raised: &EscalationType, declared: &EscalationType) -> bool {
        let mut current = Some(raised.clone());
        while let Some(kind) = current {
            if &kind == declared {
                return true;
            }
            current = self.parent_of(&kind);
        }
        false
    }
}

/// What a handler function receives as its parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationParameter {
    /// The escalation itself
    Escalation,
    /// The escalation's cause, falling back to the escalation when it has none
    Cause,
}

impl EscalationParameter {
    /// Build the handler parameter for a raised escalation
    #[must_use]
    pub fn extract(self, escalation: &Escalation) -> Value {
        match (self, escalation.cause()) {
            (Self::Cause, Some(cause)) => Arc::new(cause.clone()),
            _ => Arc::new(escalation.clone()),
        }
    }
}

/// One entry of a procedure: escalation type to handler function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationBinding {
    /// Declared type
    pub kind: EscalationType,
    /// Function run as a new flow when matched
    pub handler: FunctionIndex,
    /// Parameter handed to the handler
    pub parameter: EscalationParameter,
}

/// Ordered binding table for one level
#[derive(Debug, Clone)]
pub struct EscalationProcedure {
    bindings: Vec<EscalationBinding>,
    taxonomy: Arc<EscalationTaxonomy>,
}

impl EscalationProcedure {
    /// Sort bindings most specific first: deeper types before their
    /// ancestors, then case-insensitive name for a total order
    #[must_use]
    pub fn new(mut bindings: Vec<EscalationBinding>, taxonomy: Arc<EscalationTaxonomy>) -> Self {
        bindings.sort_by_cached_key(|binding| {
            (
                Reverse(taxonomy.depth(&binding.kind)),
                binding.kind.name().to_lowercase(),
                binding.kind.name().to_string(),
            )
        });
        Self { bindings, taxonomy }
    }

    /// Procedure with no bindings
    #[must_use]
    pub fn empty(taxonomy: Arc<EscalationTaxonomy>) -> Self {
        Self {
            bindings: Vec::new(),
            taxonomy,
        }
    }

    /// First binding able to handle the escalation
    #[must_use]
    pub fn find(&self, escalation: &Escalation) -> Option<&EscalationBinding> {
        self.bindings
            .iter()
            .find(|binding| self.taxonomy.is_assignable(escalation.kind(), &binding.kind))
    }

    /// Bindings in match order
    #[must_use]
    pub fn bindings(&self) -> &[EscalationBinding] {
        &self.bindings
    }

    /// Whether the procedure has no bindings
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Level at which an escalation was matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EscalationLevel {
    /// The raising function's own table
    Function,
    /// Office-wide thread table
    Thread,
    /// Office-wide process table
    Process,
    /// Office-wide system table
    System,
    /// A governance's own table
    Governance,
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Function => "function",
            Self::Thread => "thread",
            Self::Process => "process",
            Self::System => "system",
            Self::Governance => "governance",
        };
        f.write_str(name)
    }
}

/// A routing match
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// Level whose procedure matched
    pub level: EscalationLevel,
    /// Matching binding
    pub binding: EscalationBinding,
    /// Router the handler escalates to
    pub resume: Option<Arc<EscalationRouter>>,
}

/// One level of the routing chain plus a link to the next outer level
#[derive(Debug)]
pub struct EscalationRouter {
    level: EscalationLevel,
    procedure: EscalationProcedure,
    parent: Option<Arc<EscalationRouter>>,
}

impl EscalationRouter {
    /// Create a router level
    #[must_use]
    pub fn new(
        level: EscalationLevel,
        procedure: EscalationProcedure,
        parent: Option<Arc<EscalationRouter>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            level,
            procedure,
            parent,
        })
    }

    /// Level of this router
    #[must_use]
    pub fn level(&self) -> EscalationLevel {
        self.level
    }

    /// Next outer router
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<EscalationRouter>> {
        self.parent.as_ref()
    }

    /// Walk outward from this level, stopping at the first matching binding
    #[must_use]
    pub fn route(&self, escalation: &Escalation) -> Option<RouteMatch> {
        let mut level = Some(self);
        while let Some(router) = level {
            if let Some(binding) = router.procedure.find(escalation) {
                return Some(RouteMatch {
                    level: router.level,
                    binding: binding.clone(),
                    resume: router.parent.clone(),
                });
            }
            level = router.parent.as_deref();
        }
        None
    }
}

/// Leaf handler receiving escalations that no router matched
pub trait EscalationHandler: Send + Sync {
    /// Report a fatal process failure
    fn handle(&self, process: ProcessId, escalation: &Escalation);
}

impl<F> EscalationHandler for F
where
    F: Fn(ProcessId, &Escalation) + Send + Sync,
{
    fn handle(&self, process: ProcessId, escalation: &Escalation) {
        self(process, escalation)
    }
}

/// Leaf handler that logs and carries on
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEscalationHandler;

impl EscalationHandler for LoggingEscalationHandler {
    fn handle(&self, process: ProcessId, escalation: &Escalation) {
        tracing::error!(process = %process, kind = %escalation.kind(), "unhandled escalation: {}", escalation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taxonomy() -> Arc<EscalationTaxonomy> {
        let mut taxonomy = EscalationTaxonomy::new();
        taxonomy.declare("IOException", "Failure").unwrap();
        taxonomy.declare("FileNotFoundException", "IOException").unwrap();
        taxonomy.declare("SQLException", "Failure").unwrap();
        Arc::new(taxonomy)
    }

    fn binding(kind: &str, handler: usize) -> EscalationBinding {
        EscalationBinding {
            kind: EscalationType::new(kind),
            handler: FunctionIndex(handler),
            parameter: EscalationParameter::Escalation,
        }
    }

    #[test]
    fn test_builtin_hierarchy() {
        let taxonomy = EscalationTaxonomy::new();
        let timeout = EscalationType::new(EscalationType::SOURCE_TIMEOUT);
        assert!(taxonomy.is_assignable(&timeout, &EscalationType::new("SourcingFailure")));
        assert!(taxonomy.is_assignable(&timeout, &EscalationType::new("Failure")));
        assert_eq!(taxonomy.depth(&EscalationType::new("Failure")), 0);
        assert_eq!(taxonomy.depth(&timeout), 2);
    }

    #[test]
    fn test_undeclared_is_failure_child() {
        let taxonomy = EscalationTaxonomy::new();
        let odd = EscalationType::new("Odd");
        assert!(!taxonomy.contains(&odd));
        assert!(taxonomy.is_assignable(&odd, &EscalationType::new("Failure")));
        assert!(!taxonomy.is_assignable(&odd, &EscalationType::new("Cancelled")));
        assert_eq!(taxonomy.depth(&odd), 1);
    }

    #[test]
    fn test_declare_rejects_unknown_parent_and_reparenting() {
        let mut taxonomy = EscalationTaxonomy::new();
        assert!(matches!(
            taxonomy.declare("A", "Missing"),
            Err(CoreError::NotFound { .. })
        ));
        taxonomy.declare("A", "Failure").unwrap();
        taxonomy.declare("A", "Failure").unwrap();
        assert!(matches!(
            taxonomy.declare("A", "Cancelled"),
            Err(CoreError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_most_specific_binding_wins() {
        let taxonomy = taxonomy();
        // declaration order puts the ancestor first
        let procedure = EscalationProcedure::new(
            vec![binding("IOException", 1), binding("FileNotFoundException", 2)],
            Arc::clone(&taxonomy),
        );
        let raised = Escalation::new("FileNotFoundException", "missing.txt");
        assert_eq!(procedure.find(&raised).unwrap().handler, FunctionIndex(2));

        let raised = Escalation::new("IOException", "disk");
        assert_eq!(procedure.find(&raised).unwrap().handler, FunctionIndex(1));

        assert!(procedure.find(&Escalation::new("SQLException", "db")).is_none());
    }

    #[test]
    fn test_tie_break_is_case_insensitive_name() {
        let taxonomy = taxonomy();
        let procedure = EscalationProcedure::new(
            vec![binding("sqlexception", 1), binding("IOException", 2), binding("Failure", 3)],
            taxonomy,
        );
        let order: Vec<&str> = procedure.bindings().iter().map(|b| b.kind.name()).collect();
        assert_eq!(order, vec!["IOException", "sqlexception", "Failure"]);
    }

    #[test]
    fn test_router_walks_outward() {
        let taxonomy = taxonomy();
        let system = EscalationRouter::new(
            EscalationLevel::System,
            EscalationProcedure::new(vec![binding("Failure", 9)], Arc::clone(&taxonomy)),
            None,
        );
        let process = EscalationRouter::new(
            EscalationLevel::Process,
            EscalationProcedure::new(vec![binding("IOException", 5)], Arc::clone(&taxonomy)),
            Some(Arc::clone(&system)),
        );
        let thread = EscalationRouter::new(
            EscalationLevel::Thread,
            EscalationProcedure::empty(Arc::clone(&taxonomy)),
            Some(Arc::clone(&process)),
        );

        let found = thread.route(&Escalation::new("FileNotFoundException", "x")).unwrap();
        assert_eq!(found.level, EscalationLevel::Process);
        assert_eq!(found.binding.handler, FunctionIndex(5));
        assert_eq!(found.resume.unwrap().level(), EscalationLevel::System);

        let found = thread.route(&Escalation::new("SQLException", "x")).unwrap();
        assert_eq!(found.level, EscalationLevel::System);
        assert!(found.resume.is_none());
    }

    #[test]
    fn test_source_timeout_payload() {
        let escalation = Escalation::source_timeout("socket", Duration::from_millis(1));
        assert!(escalation.is(EscalationType::SOURCE_TIMEOUT));
        assert!(escalation.message().contains("1ms"));
        let payload = escalation.payload_as::<SourceTimeout>().unwrap();
        assert_eq!(payload.timeout, Duration::from_millis(1));
        assert_eq!(payload.object, "socket");
    }

    #[test]
    fn test_cause_parameter() {
        let inner = Escalation::new("IOException", "disk");
        let outer = Escalation::governance_failure("tx", inner);
        let value = EscalationParameter::Cause.extract(&outer);
        assert!(value.downcast_ref::<Escalation>().unwrap().is("IOException"));

        let plain = Escalation::failure("plain");
        let value = EscalationParameter::Cause.extract(&plain);
        assert_eq!(value.downcast_ref::<Escalation>().unwrap().message(), "plain");
        assert!(outer.to_string().contains("caused by IOException: disk"));
    }
}

//! The per-run command instance.
//!
//! # Key Properties
//!
//! - **Single use**: created by `run`, driven to one terminal state, dropped
//! - **Write-once fields**: typed inputs and the result are set exactly once
//! - **Append-only errors**: the collection freezes at the terminal state
//! - **Explicit records**: loaded records live in a named [`Records`] map
//!
//! Callbacks and phase bodies receive `&mut CommandContext<C>`; there is no
//! other way to touch a run's state.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::warn;

use crate::collection::ErrorCollection;
use crate::core::{Command, CorrelationId, Halted, Interrupt, RawInputs, Step};
use crate::engine::Engine;
use crate::error::{CommandError, PathSegment};
use crate::state::LifecycleState;
use crate::transaction::TransactionScope;

/// Whether an appended error stops the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    /// Stop phase advancement at the next check.
    Halt,
    /// Record and keep going; collected errors still fail the run before
    /// the execute phase (or after it, if collected during execute).
    Collect,
}

// =============================================================================
// Execution Path
// =============================================================================

/// Identities of the commands from the root run down to this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPath(SmallVec<[&'static str; 4]>);

impl ExecutionPath {
    pub(crate) fn root(name: &'static str) -> Self {
        let mut path = SmallVec::new();
        path.push(name);
        Self(path)
    }

    pub(crate) fn child(&self, name: &'static str) -> Self {
        let mut path = self.0.clone();
        path.push(name);
        Self(path)
    }

    /// Nesting depth; the root run is depth 0.
    pub fn depth(&self) -> usize {
        self.0.len().saturating_sub(1)
    }

    pub fn root_name(&self) -> Option<&'static str> {
        self.0.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().copied()
    }
}

impl fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" > "))
    }
}

// =============================================================================
// Records
// =============================================================================

/// Named records loaded for one run.
#[derive(Clone, Default)]
pub struct Records {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Records {
    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, record: T) {
        self.entries.insert(name.into(), Arc::new(record));
    }

    /// Get a record by name, if present and of type `T`.
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.entries.get(name).and_then(|r| r.downcast_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl fmt::Debug for Records {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("Records").field("names", &names).finish()
    }
}

// =============================================================================
// Command Context
// =============================================================================

/// State of one command run.
pub struct CommandContext<C: Command> {
    pub(crate) engine: Engine<C::Deps>,
    correlation_id: CorrelationId,
    path: ExecutionPath,
    raw_inputs: RawInputs,
    inputs: Option<C::Inputs>,
    records: Records,
    state: LifecycleState,
    errors: ErrorCollection,
    halted: bool,
    frozen: bool,
    result: Option<C::Output>,
    pub(crate) scope: TransactionScope,
}

impl<C: Command> CommandContext<C> {
    pub(crate) fn new(
        engine: Engine<C::Deps>,
        raw_inputs: RawInputs,
        scope: TransactionScope,
        path: ExecutionPath,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            engine,
            correlation_id,
            path,
            raw_inputs,
            inputs: None,
            records: Records::default(),
            state: LifecycleState::Pending,
            errors: ErrorCollection::new(),
            halted: false,
            frozen: false,
            result: None,
            scope,
        }
    }

    /// Identity of the command being run.
    pub fn name(&self) -> &'static str {
        C::NAME
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn path(&self) -> &ExecutionPath {
        &self.path
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Get shared dependencies.
    pub fn deps(&self) -> &C::Deps {
        self.engine.deps()
    }

    pub fn engine(&self) -> &Engine<C::Deps> {
        &self.engine
    }

    pub fn transaction(&self) -> &TransactionScope {
        &self.scope
    }

    pub fn raw_inputs(&self) -> &RawInputs {
        &self.raw_inputs
    }

    /// Typed inputs.
    ///
    /// # Panics
    ///
    /// Panics if called before the `validate_inputs` phase completed. Every
    /// phase after it, and every callback on those phases, may rely on it.
    pub fn inputs(&self) -> &C::Inputs {
        match &self.inputs {
            Some(inputs) => inputs,
            None => panic!("inputs of {} read before validate_inputs", C::NAME),
        }
    }

    pub fn try_inputs(&self) -> Option<&C::Inputs> {
        self.inputs.as_ref()
    }

    pub fn records(&self) -> &Records {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut Records {
        &mut self.records
    }

    /// Shorthand for `records().get::<T>(name)`.
    pub fn record<T: Any>(&self, name: &str) -> Option<&T> {
        self.records.get(name)
    }

    /// Store `found` as record `name`, or halt with `runtime/not_found` at `path`.
    pub fn require_record<T, I, S>(&mut self, name: &str, found: Option<T>, path: I) -> Step<()>
    where
        T: Any + Send + Sync,
        I: IntoIterator<Item = S>,
        S: Into<PathSegment>,
    {
        match found {
            Some(record) => {
                self.records.insert(name, record);
                Ok(())
            }
            None => Err(self.halt(CommandError::not_found(name).at(path))),
        }
    }

    /// The execute phase's value, once the execute phase has completed.
    pub fn result(&self) -> Option<&C::Output> {
        self.result.as_ref()
    }

    // -------------------------------------------------------------------------
    // Errors
    // -------------------------------------------------------------------------

    pub fn errors(&self) -> &ErrorCollection {
        &self.errors
    }

    /// True once a halting error has been recorded.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Append an error. The caller chooses whether it halts.
    ///
    /// Errors added once the outcome is settled (after commit or in a terminal
    /// state) are dropped.
    pub fn add_error(&mut self, error: CommandError, mode: ErrorMode) {
        if self.frozen {
            warn!(
                command = C::NAME,
                state = %self.state,
                error = %error,
                "error added after the outcome was settled, dropped"
            );
            return;
        }
        self.errors.push(error);
        if mode == ErrorMode::Halt {
            self.halted = true;
        }
    }

    /// Append a halting error and return the interrupt to propagate.
    ///
    /// ```ignore
    /// return Err(ctx.halt(CommandError::runtime("insufficient_funds", "balance too low")));
    /// ```
    pub fn halt(&mut self, error: CommandError) -> Interrupt {
        self.add_error(error, ErrorMode::Halt);
        Interrupt::Halt(Halted::new())
    }

    /// Append a non-halting error.
    pub fn collect(&mut self, error: CommandError) {
        self.add_error(error, ErrorMode::Collect);
    }

    // -------------------------------------------------------------------------
    // Driver-only mutation
    // -------------------------------------------------------------------------

    /// Halt on the errors already collected.
    pub(crate) fn halt_collected(&mut self) -> Interrupt {
        self.halted = true;
        Interrupt::Halt(Halted::new())
    }

    pub(crate) fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
    }

    pub(crate) fn set_inputs(&mut self, inputs: C::Inputs) {
        if self.inputs.is_some() {
            warn!(command = C::NAME, "typed inputs already set, ignoring");
            return;
        }
        self.inputs = Some(inputs);
    }

    pub(crate) fn set_result(&mut self, result: C::Output) {
        if self.result.is_some() {
            warn!(command = C::NAME, "result already set, ignoring");
            return;
        }
        self.result = Some(result);
    }

    pub(crate) fn take_result(&mut self) -> Option<C::Output> {
        self.result.take()
    }

    /// Enter a terminal state and freeze the error collection.
    pub(crate) fn finish(&mut self, state: LifecycleState) {
        self.state = state;
        self.freeze();
    }

    /// Stop accepting errors; the outcome can no longer change.
    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    pub(crate) fn take_errors(&mut self) -> ErrorCollection {
        std::mem::take(&mut self.errors)
    }
}

impl<C: Command> fmt::Debug for CommandContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("command", &C::NAME)
            .field("cid", &self.correlation_id)
            .field("path", &self.path)
            .field("state", &self.state)
            .field("errors", &self.errors.len())
            .field("halted", &self.halted)
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Step;
    use crate::engine::Engine;
    use crate::error::ErrorCategory;
    use crate::transaction::NoopBackend;
    use async_trait::async_trait;
    use serde_json::json;

    struct Probe;

    #[async_trait]
    impl Command for Probe {
        const NAME: &'static str = "probe";
        type Deps = ();
        type Inputs = serde_json::Value;
        type Output = ();

        async fn execute(&self, _ctx: &mut CommandContext<Self>) -> Step<()> {
            Ok(())
        }
    }

    fn context() -> CommandContext<Probe> {
        let engine = Engine::builder(()).build();
        let scope = TransactionScope::root(Arc::new(NoopBackend));
        CommandContext::new(
            engine,
            json!({"id": 7}),
            scope,
            ExecutionPath::root(Probe::NAME),
            CorrelationId::new(),
        )
    }

    #[test]
    fn test_collect_does_not_halt() {
        let mut ctx = context();
        ctx.collect(CommandError::data("invalid_type", "a").at_field("a"));
        ctx.collect(CommandError::data("invalid_type", "b").at_field("b"));
        assert_eq!(ctx.errors().len(), 2);
        assert!(!ctx.is_halted());
    }

    #[test]
    fn test_halt_marks_halted() {
        let mut ctx = context();
        let interrupt = ctx.halt(CommandError::runtime("locked", "account locked"));
        assert!(interrupt.is_halt());
        assert!(ctx.is_halted());
        assert_eq!(ctx.errors().first().unwrap().symbol(), "locked");
    }

    #[test]
    fn test_frozen_collection_drops_errors() {
        let mut ctx = context();
        ctx.collect(CommandError::runtime("first", "kept"));
        ctx.finish(LifecycleState::Failed);
        ctx.collect(CommandError::runtime("late", "dropped"));
        assert_eq!(ctx.errors().len(), 1);
        assert_eq!(ctx.state(), LifecycleState::Failed);
    }

    #[test]
    fn test_require_record() {
        let mut ctx = context();
        assert!(ctx.require_record("user", Some(42u64), ["id"]).is_ok());
        assert_eq!(ctx.record::<u64>("user"), Some(&42));
        assert_eq!(ctx.record::<String>("user"), None);

        let missing = ctx.require_record::<u64, _, _>("account", None, ["account_id"]);
        assert!(missing.unwrap_err().is_halt());
        let error = ctx.errors().first().unwrap();
        assert_eq!(error.category(), ErrorCategory::Runtime);
        assert_eq!(error.symbol(), "not_found");
        assert_eq!(error.path(), &[PathSegment::from("account_id")]);
    }

    #[test]
    fn test_inputs_are_write_once() {
        let mut ctx = context();
        assert!(ctx.try_inputs().is_none());
        ctx.set_inputs(json!({"id": 7}));
        ctx.set_inputs(json!({"id": 8}));
        assert_eq!(ctx.inputs(), &json!({"id": 7}));
    }

    #[test]
    #[should_panic(expected = "read before validate_inputs")]
    fn test_inputs_before_validation_panics() {
        let ctx = context();
        let _ = ctx.inputs();
    }

    #[test]
    fn test_execution_path() {
        let root = ExecutionPath::root("checkout");
        let child = root.child("reserve_stock");
        assert_eq!(root.depth(), 0);
        assert_eq!(child.depth(), 1);
        assert_eq!(child.root_name(), Some("checkout"));
        assert_eq!(child.to_string(), "checkout > reserve_stock");
    }
}

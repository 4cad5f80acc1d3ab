//! Engine and builder.
//!
//! The engine owns the shared dependencies, the command registry and the
//! transaction backend. It is cheap to clone: every clone shares the same
//! `Arc`-wrapped state, and concurrent runs share nothing mutable.
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::builder(deps)
//!     .with_backend(Arc::new(PgBackend::new(pool)))
//!     .with_config(EngineConfig::from_env()?)
//!     .register(PlaceOrder)
//!     .register(ReserveStock)
//!     .domain_dependency("ordering", "inventory")
//!     .with_mapper(CartToReservation)
//!     .build();
//!
//! match engine.run::<PlaceOrder>(json!({"cart_id": "c-1"})).await {
//!     Outcome::Success(receipt) => respond_ok(receipt),
//!     Outcome::Failure(errors) => respond_errors(errors.to_records()),
//! }
//! ```

use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::callback::CallbackRegistry;
use crate::config::EngineConfig;
use crate::context::ExecutionPath;
use crate::core::{Command, CorrelationId, RawInputs};
use crate::error::{CommandError, RatchetError};
use crate::lifecycle::{drive, RunReport};
use crate::mapper::DomainMapper;
use crate::outcome::Outcome;
use crate::registry::{CommandRegistry, RegisteredCommand};
use crate::transaction::{NoopBackend, TransactionBackend, TransactionScope};

// =============================================================================
// Engine
// =============================================================================

struct EngineInner<D> {
    deps: Arc<D>,
    registry: CommandRegistry<D>,
    backend: Arc<dyn TransactionBackend>,
    config: EngineConfig,
}

/// Runs registered commands.
pub struct Engine<D> {
    inner: Arc<EngineInner<D>>,
}

impl<D> Clone for Engine<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Send + Sync + 'static> Engine<D> {
    /// Create a new engine builder.
    pub fn builder(deps: D) -> EngineBuilder<D> {
        EngineBuilder::new(deps)
    }

    /// Get shared dependencies.
    pub fn deps(&self) -> &D {
        &self.inner.deps
    }

    pub fn registry(&self) -> &CommandRegistry<D> {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<dyn TransactionBackend> {
        &self.inner.backend
    }

    /// Run `C` as a top-level command.
    ///
    /// Opens and commits (or rolls back) exactly one transaction. Never
    /// returns a raw fault: panics and unexpected errors come back as a
    /// single `system/internal_error`.
    pub async fn run<C>(&self, inputs: RawInputs) -> Outcome<C::Output>
    where
        C: Command<Deps = D>,
    {
        self.run_detailed::<C>(inputs).await.outcome
    }

    /// Like [`run`](Self::run), also reporting the terminal state and
    /// correlation id.
    pub async fn run_detailed<C>(&self, inputs: RawInputs) -> RunReport<C::Output>
    where
        C: Command<Deps = D>,
    {
        let scope = TransactionScope::root(self.inner.backend.clone());
        drive::<C>(
            self.clone(),
            inputs,
            scope,
            ExecutionPath::root(C::NAME),
            CorrelationId::new(),
        )
        .await
    }

    /// Run a command by identity, returning its output as JSON.
    pub async fn run_named(&self, name: &str, inputs: RawInputs) -> Outcome<Value> {
        match self.inner.registry.runner(name) {
            Some(runner) => runner(self.clone(), inputs).await,
            None => {
                warn!(command = name, "run_named on unregistered command");
                Outcome::Failure(
                    CommandError::from(RatchetError::CommandNotRegistered {
                        name: name.to_string(),
                    })
                    .into(),
                )
            }
        }
    }

    /// Run `C`, giving up after `duration`.
    ///
    /// On expiry the run is dropped mid-flight and no outcome is reported;
    /// the open transaction is released by dropping it, so backends must
    /// discard uncommitted work on drop.
    pub async fn run_with_timeout<C>(
        &self,
        inputs: RawInputs,
        duration: Duration,
    ) -> Result<Outcome<C::Output>, RatchetError>
    where
        C: Command<Deps = D>,
    {
        match tokio::time::timeout(duration, self.run::<C>(inputs)).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => {
                warn!(command = C::NAME, ?duration, "command timed out");
                Err(RatchetError::Timeout {
                    name: C::NAME,
                    duration,
                })
            }
        }
    }

    /// [`run_with_timeout`](Self::run_with_timeout) using
    /// `EngineConfig::default_timeout`, or a plain run if none is set.
    pub async fn run_with_default_timeout<C>(
        &self,
        inputs: RawInputs,
    ) -> Result<Outcome<C::Output>, RatchetError>
    where
        C: Command<Deps = D>,
    {
        match self.inner.config.default_timeout {
            Some(duration) => self.run_with_timeout::<C>(inputs, duration).await,
            None => Ok(self.run::<C>(inputs).await),
        }
    }
}

impl<D> fmt::Debug for Engine<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.inner.registry)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Engine Builder
// =============================================================================

type Registration<D> =
    Box<dyn FnOnce(&mut CommandRegistry<D>, &EngineConfig) -> Result<(), RatchetError> + Send>;

/// Builder for constructing an [`Engine`].
///
/// Commands are materialized at [`build`](Self::build), so the order of
/// `with_config` and `register` calls does not matter.
pub struct EngineBuilder<D> {
    deps: Arc<D>,
    backend: Arc<dyn TransactionBackend>,
    config: EngineConfig,
    registered: HashSet<TypeId>,
    names: HashSet<&'static str>,
    registrations: Vec<Registration<D>>,
    domain_dependencies: Vec<(&'static str, &'static str)>,
    mappers: Vec<Box<dyn FnOnce(&mut CommandRegistry<D>) -> Result<(), RatchetError> + Send>>,
}

impl<D> fmt::Debug for EngineBuilder<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("commands", &self.names)
            .field("domain_dependencies", &self.domain_dependencies)
            .field("mappers", &self.mappers.len())
            .finish_non_exhaustive()
    }
}

impl<D: Send + Sync + 'static> EngineBuilder<D> {
    /// Create a new engine builder with the given dependencies.
    pub fn new(deps: D) -> Self {
        Self::with_arc(Arc::new(deps))
    }

    /// Create a new engine builder with Arc-wrapped dependencies.
    pub fn with_arc(deps: Arc<D>) -> Self {
        Self {
            deps,
            backend: Arc::new(NoopBackend),
            config: EngineConfig::default(),
            registered: HashSet::new(),
            names: HashSet::new(),
            registrations: Vec::new(),
            domain_dependencies: Vec::new(),
            mappers: Vec::new(),
        }
    }

    /// Use this transaction backend instead of [`NoopBackend`].
    pub fn with_backend(mut self, backend: Arc<dyn TransactionBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a command.
    ///
    /// # Panics
    ///
    /// Panics if a command of this type or identity is already registered.
    /// Use [`try_register`](Self::try_register) for a non-panicking version.
    pub fn register<C>(self, definition: C) -> Self
    where
        C: Command<Deps = D>,
    {
        self.try_register(definition).unwrap_or_else(|e| {
            panic!("{}", e);
        })
    }

    /// Register a command, returning an error if it is already registered.
    pub fn try_register<C>(self, definition: C) -> Result<Self, RatchetError>
    where
        C: Command<Deps = D>,
    {
        self.try_register_with(definition, |_| {})
    }

    /// Register a command with extra callbacks, installed before the ones
    /// from `define_callbacks`.
    ///
    /// ```ignore
    /// fn audited<C: Command>(callbacks: &mut CallbackRegistry<C>) {
    ///     callbacks.after(CallbackCondition::on(Transition::Succeed), 0, |ctx| {
    ///         tracing::info!(command = ctx.name(), "audit");
    ///     });
    /// }
    ///
    /// builder.register_with(PlaceOrder, audited)
    /// ```
    ///
    /// # Panics
    ///
    /// Panics on a duplicate, like [`register`](Self::register).
    pub fn register_with<C, F>(self, definition: C, install: F) -> Self
    where
        C: Command<Deps = D>,
        F: FnOnce(&mut CallbackRegistry<C>) + Send + 'static,
    {
        self.try_register_with(definition, install)
            .unwrap_or_else(|e| {
                panic!("{}", e);
            })
    }

    fn try_register_with<C, F>(mut self, definition: C, install: F) -> Result<Self, RatchetError>
    where
        C: Command<Deps = D>,
        F: FnOnce(&mut CallbackRegistry<C>) + Send + 'static,
    {
        if !self.registered.insert(TypeId::of::<C>()) || !self.names.insert(C::NAME) {
            return Err(RatchetError::DuplicateCommand { name: C::NAME });
        }
        self.registrations.push(Box::new(
            move |registry: &mut CommandRegistry<D>, config: &EngineConfig| {
                let mut callbacks = CallbackRegistry::new();
                callbacks.set_caching(config.cache_callback_chains);
                install(&mut callbacks);
                registry.insert(RegisteredCommand::new(definition, callbacks))
            },
        ));
        Ok(self)
    }

    /// Declare that commands in domain `from` may call commands in `to`.
    pub fn domain_dependency(mut self, from: &'static str, to: &'static str) -> Self {
        self.domain_dependencies.push((from, to));
        self
    }

    /// Register a domain mapper.
    ///
    /// # Panics
    ///
    /// Panics at [`build`](Self::build) if a mapper for the same type pair
    /// was already registered.
    pub fn with_mapper<M: DomainMapper>(mut self, mapper: M) -> Self {
        self.mappers.push(Box::new(move |registry: &mut CommandRegistry<D>| {
            registry.mappers.register(mapper)
        }));
        self
    }

    /// Register a closure as the domain mapper from `A` to `B`.
    pub fn with_mapper_fn<A, B, F>(mut self, f: F) -> Self
    where
        A: Send + 'static,
        B: Send + 'static,
        F: Fn(A) -> Result<B, CommandError> + Send + Sync + 'static,
    {
        self.mappers.push(Box::new(move |registry: &mut CommandRegistry<D>| {
            registry.mappers.register_fn(f)
        }));
        self
    }

    /// Build the engine.
    ///
    /// # Panics
    ///
    /// Panics on a duplicate mapper. Use [`try_build`](Self::try_build) for
    /// a non-panicking version.
    pub fn build(self) -> Engine<D> {
        self.try_build().unwrap_or_else(|e| {
            panic!("{}", e);
        })
    }

    pub fn try_build(self) -> Result<Engine<D>, RatchetError> {
        let mut registry = CommandRegistry::new();
        for register in self.registrations {
            register(&mut registry, &self.config)?;
        }
        for (from, to) in self.domain_dependencies {
            registry.domains.declare(from, to);
        }
        for add_mapper in self.mappers {
            add_mapper(&mut registry)?;
        }

        Ok(Engine {
            inner: Arc::new(EngineInner {
                deps: self.deps,
                registry,
                backend: self.backend,
                config: self.config,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CommandContext;
    use crate::core::Step;
    use crate::error::ErrorCategory;
    use crate::state::LifecycleState;
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;

    struct Counter {
        start: i64,
    }

    #[derive(Deserialize)]
    struct AddInputs {
        by: i64,
    }

    struct Add;

    #[async_trait]
    impl Command for Add {
        const NAME: &'static str = "add";
        type Deps = Counter;
        type Inputs = AddInputs;
        type Output = i64;

        async fn execute(&self, ctx: &mut CommandContext<Self>) -> Step<i64> {
            Ok(ctx.deps().start + ctx.inputs().by)
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Command for Sleepy {
        const NAME: &'static str = "sleepy";
        type Deps = Counter;
        type Inputs = Value;
        type Output = ();

        async fn execute(&self, _ctx: &mut CommandContext<Self>) -> Step<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn engine() -> Engine<Counter> {
        Engine::builder(Counter { start: 40 })
            .register(Add)
            .register(Sleepy)
            .build()
    }

    #[tokio::test]
    async fn test_run_uses_deps_and_inputs() {
        let outcome = engine().run::<Add>(json!({"by": 2})).await;
        assert_eq!(outcome.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_run_detailed_reports_state() {
        let report = engine().run_detailed::<Add>(json!({"by": 1})).await;
        assert_eq!(report.state, LifecycleState::Succeeded);
        assert!(!report.correlation_id.is_none());

        let report = engine().run_detailed::<Add>(json!({"by": "one"})).await;
        assert_eq!(report.state, LifecycleState::Failed);
        assert_eq!(report.outcome.errors().first().unwrap().symbol(), "invalid_inputs");
    }

    #[tokio::test]
    async fn test_run_named() {
        let engine = engine();
        let outcome = engine.run_named("add", json!({"by": 0})).await;
        assert_eq!(outcome.unwrap(), json!(40));

        let missing = engine.run_named("subtract", json!({})).await;
        let error = missing.unwrap_failure().into_vec().remove(0);
        assert_eq!(error.category(), ErrorCategory::System);
        assert_eq!(error.symbol(), "command_not_registered");
    }

    #[tokio::test]
    async fn test_unregistered_type_fails() {
        let engine = Engine::builder(Counter { start: 0 }).build();
        let outcome = engine.run::<Add>(json!({"by": 1})).await;
        crate::assert_failed_with!(outcome, "command_not_registered");
    }

    #[tokio::test]
    async fn test_run_with_timeout() {
        let engine = engine();
        let err = engine
            .run_with_timeout::<Sleepy>(json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RatchetError::Timeout { name: "sleepy", .. }));

        let ok = engine
            .run_with_timeout::<Add>(json!({"by": 1}), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(ok.unwrap(), 41);
    }

    #[tokio::test]
    async fn test_default_timeout_unset_runs_plainly() {
        let outcome = engine()
            .run_with_default_timeout::<Add>(json!({"by": 3}))
            .await
            .unwrap();
        assert_eq!(outcome.unwrap(), 43);
    }

    #[test]
    fn test_try_register_duplicate() {
        let err = Engine::builder(Counter { start: 0 })
            .register(Add)
            .try_register(Add)
            .unwrap_err();
        assert!(matches!(err, RatchetError::DuplicateCommand { name: "add" }));
    }

    #[test]
    #[should_panic(expected = "command add is already registered")]
    fn test_register_duplicate_panics() {
        let _ = Engine::builder(Counter { start: 0 }).register(Add).register(Add);
    }

    #[test]
    fn test_duplicate_mapper_fails_build() {
        let err = Engine::builder(Counter { start: 0 })
            .with_mapper_fn(|n: i64| Ok(n.to_string()))
            .with_mapper_fn(|n: i64| Ok(format!("#{n}")))
            .try_build()
            .unwrap_err();
        assert!(matches!(err, RatchetError::DuplicateMapper { .. }));
    }

    #[test]
    fn test_engine_is_clone_and_shares_registry() {
        let engine = engine();
        let clone = engine.clone();
        assert_eq!(clone.registry().names(), vec!["add", "sleepy"]);
        assert!(std::ptr::eq(engine.deps(), clone.deps()));
    }
}

//! Running commands from inside other commands.
//!
//! Three modes, all methods on [`CommandContext`]:
//!
//! | Mode        | Method                   | Transaction       | Errors                          |
//! |-------------|--------------------------|-------------------|---------------------------------|
//! | Isolated    | `run_subcommand`         | its own           | returned in the `Outcome`       |
//! | Propagating | `run_subcommand_or_halt` | the caller's      | merged into the caller, halts   |
//! | Mapped      | `run_mapped_subcommand`  | the caller's      | merged into the caller, halts   |
//!
//! Propagated errors get the subcommand's identity prepended to their
//! runtime path, so the root caller can tell which leaf failed.
//!
//! ```ignore
//! async fn execute(&self, ctx: &mut CommandContext<Self>) -> Step<Receipt> {
//!     let reservation = ctx
//!         .run_subcommand_or_halt::<ReserveStock>(json!({"sku": ctx.inputs().sku}))
//!         .await?;
//!     // only reached if ReserveStock succeeded
//! }
//! ```
//!
//! Before any mode runs, a call from one domain into another is checked
//! against the [`DomainGraph`]; undeclared crossings fail with
//! `system/cross_domain_call_not_allowed`.

use std::collections::{BTreeSet, HashMap};

use anyhow::Context as _;
use serde::Serialize;
use tracing::warn;

use crate::collection::ErrorCollection;
use crate::context::{CommandContext, ErrorMode};
use crate::core::{Command, Interrupt, RawInputs, Step};
use crate::error::{CommandError, RatchetError};
use crate::lifecycle::drive;
use crate::outcome::Outcome;
use crate::transaction::TransactionScope;

/// Declared dependencies between logical domains.
///
/// Dependencies are explicit and not transitive: `a -> b` and `b -> c` do
/// not allow `a` to call into `c`.
#[derive(Debug, Clone, Default)]
pub struct DomainGraph {
    dependencies: HashMap<&'static str, BTreeSet<&'static str>>,
}

impl DomainGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, from: &'static str, to: &'static str) {
        self.dependencies.entry(from).or_default().insert(to);
    }

    /// Whether commands in `caller` may run commands in `callee`.
    pub fn allows(&self, caller: &str, callee: &str) -> bool {
        caller == callee
            || self
                .dependencies
                .get(caller)
                .is_some_and(|deps| deps.contains(callee))
    }

    pub fn dependencies_of(&self, domain: &str) -> impl Iterator<Item = &'static str> + '_ {
        self.dependencies
            .get(domain)
            .into_iter()
            .flat_map(|deps| deps.iter().copied())
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}

impl<C: Command> CommandContext<C> {
    /// Run `S` with its own transaction and return its outcome untouched.
    ///
    /// Nothing is merged into this command's errors; the caller decides what
    /// a failure means.
    pub async fn run_subcommand<S>(&mut self, inputs: RawInputs) -> Outcome<S::Output>
    where
        S: Command<Deps = C::Deps>,
    {
        if let Err(error) = self.check_domain::<S>() {
            return Outcome::Failure(error.into());
        }
        let scope = TransactionScope::root(self.engine.backend().clone());
        let report = Box::pin(drive::<S>(
            self.engine.clone(),
            inputs,
            scope,
            self.path().child(S::NAME),
            self.correlation_id(),
        ))
        .await;
        report.outcome
    }

    /// Run `S` inside this command's transaction.
    ///
    /// On success returns `S`'s output. On failure every error of `S` is
    /// added to this command as a halting error, with `S::NAME` prepended to
    /// its runtime path, and the returned interrupt halts this command.
    pub async fn run_subcommand_or_halt<S>(&mut self, inputs: RawInputs) -> Step<S::Output>
    where
        S: Command<Deps = C::Deps>,
    {
        if let Err(error) = self.check_domain::<S>() {
            return Err(self.halt(error));
        }
        let scope = self.scope.delegate();
        let report = Box::pin(drive::<S>(
            self.engine.clone(),
            inputs,
            scope,
            self.path().child(S::NAME),
            self.correlation_id(),
        ))
        .await;

        match report.outcome {
            Outcome::Success(output) => Ok(output),
            Outcome::Failure(errors) => Err(self.absorb(S::NAME, errors)),
        }
    }

    /// Map `value` into `S`'s inputs, run `S` like
    /// [`run_subcommand_or_halt`](Self::run_subcommand_or_halt), and map its
    /// output back into `B`.
    ///
    /// Needs mappers `A -> S::Inputs` and `S::Output -> B`; a missing mapper
    /// halts with `system/mapper_not_found` before `S` starts.
    pub async fn run_mapped_subcommand<S, A, B>(&mut self, value: A) -> Step<B>
    where
        S: Command<Deps = C::Deps>,
        S::Inputs: Serialize,
        A: Send + 'static,
        B: Send + 'static,
    {
        let output_mapped = self.engine.registry().mappers().contains::<S::Output, B>();
        if !output_mapped {
            let missing = RatchetError::MapperNotFound {
                source_type: std::any::type_name::<S::Output>(),
                target_type: std::any::type_name::<B>(),
            };
            return Err(self.halt(missing.into()));
        }

        let mapped = self.engine.registry().mappers().map::<A, S::Inputs>(value);
        let inputs = match mapped {
            Ok(inputs) => inputs,
            Err(error) => return Err(self.halt(error)),
        };
        let raw = serde_json::to_value(&inputs)
            .with_context(|| format!("serializing mapped inputs for {}", S::NAME))?;

        let output = self.run_subcommand_or_halt::<S>(raw).await?;

        let mapped_back = self.engine.registry().mappers().map::<S::Output, B>(output);
        mapped_back.map_err(|error| self.halt(error))
    }

    fn check_domain<S: Command>(&self) -> Result<(), CommandError> {
        if !self.engine.config().enforce_domain_boundaries {
            return Ok(());
        }
        match (C::DOMAIN, S::DOMAIN) {
            (Some(caller), Some(callee))
                if !self.engine.registry().domains().allows(caller, callee) =>
            {
                warn!(
                    caller = C::NAME,
                    callee = S::NAME,
                    caller_domain = caller,
                    callee_domain = callee,
                    "undeclared cross-domain subcommand call"
                );
                Err(RatchetError::CrossDomainCall { caller, callee }.into())
            }
            _ => Ok(()),
        }
    }

    fn absorb(&mut self, identity: &'static str, errors: ErrorCollection) -> Interrupt {
        if errors.is_empty() {
            return self.halt(CommandError::system(
                "subcommand_failed",
                format!("{identity} failed without errors"),
            ));
        }
        for error in errors.with_runtime_prefix(identity) {
            self.add_error(error, ErrorMode::Halt);
        }
        self.halt_collected()
    }
}

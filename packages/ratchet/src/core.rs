//! Core traits for the ratchet command engine.
//!
//! # Overview
//!
//! A [`Command`] is a type-level definition of one unit of business logic.
//! Each `run` creates a fresh [`CommandContext`] (the command instance) and
//! drives it through the phases in [`Phase::ALL`](crate::Phase::ALL).
//!
//! The key principle: **One Run = One Transaction**. Nested propagating
//! subcommands share the outermost run's transaction; only the outermost run
//! commits or rolls back.
//!
//! # Phase Results
//!
//! Every phase body returns a [`Step`]:
//! - `Ok(value)` continues to the next phase
//! - `Err(Interrupt::Halt(_))` stops the run; the halting errors are already
//!   recorded on the context
//! - `Err(Interrupt::Fault(_))` is an unexpected fault and becomes a single
//!   `system/internal_error`
//!
//! `Interrupt::Halt` can only be created by the context (see
//! [`CommandContext::halt`]), so a halt always carries at least one error.

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::callback::CallbackRegistry;
use crate::context::CommandContext;
use crate::error::CommandError;
use crate::validation;

/// Raw, untyped inputs as handed to `run`.
pub type RawInputs = serde_json::Value;

/// Result of a phase body or callback chain.
pub type Step<T> = Result<T, Interrupt>;

/// Why a phase stopped early.
#[derive(Debug)]
pub enum Interrupt {
    /// A halting error was recorded; later phases must not run.
    Halt(Halted),
    /// An unexpected fault (a bug or an unplanned collaborator failure).
    Fault(anyhow::Error),
}

impl Interrupt {
    pub fn is_halt(&self) -> bool {
        matches!(self, Interrupt::Halt(_))
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Interrupt::Fault(_))
    }
}

impl From<anyhow::Error> for Interrupt {
    fn from(error: anyhow::Error) -> Self {
        Interrupt::Fault(error)
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Halt(_) => write!(f, "halted"),
            Interrupt::Fault(error) => write!(f, "fault: {error}"),
        }
    }
}

/// Proof that a halting error was recorded. Only the context can mint one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Halted {
    _private: (),
}

impl Halted {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// Correlation ID shared by a top-level run and every subcommand it starts.
///
/// # Example
///
/// ```ignore
/// let report = engine.run_detailed::<Transfer>(inputs).await;
/// tracing::info!(cid = %report.correlation_id, "transfer finished");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Sentinel value; uses the nil UUID.
    pub const NONE: Self = Self(Uuid::nil());

    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A unit of business logic driven through the ratchet lifecycle.
///
/// Implementors are definitions, not instances: they are registered once on
/// the [`EngineBuilder`](crate::EngineBuilder) and shared by every run.
/// Per-run state lives in the [`CommandContext`].
///
/// # Example
///
/// ```ignore
/// struct Transfer;
///
/// #[async_trait]
/// impl Command for Transfer {
///     const NAME: &'static str = "transfer";
///     const DOMAIN: Option<&'static str> = Some("billing");
///
///     type Deps = AppDeps;
///     type Inputs = TransferInputs;
///     type Output = Receipt;
///
///     fn validate_inputs(&self, raw: &RawInputs) -> Result<TransferInputs, Vec<CommandError>> {
///         InputShape::new()
///             .required("from", FieldType::String)
///             .required("to", FieldType::String)
///             .required("amount", FieldType::Integer)
///             .validate(raw)
///     }
///
///     async fn load_records(&self, ctx: &mut CommandContext<Self>) -> Step<()> {
///         let from = ctx.deps().accounts.find(&ctx.inputs().from).await?;
///         ctx.require_record("from", from, ["from"])
///     }
///
///     async fn execute(&self, ctx: &mut CommandContext<Self>) -> Step<Receipt> {
///         let account: &Account = ctx.record("from").context("from not loaded")?;
///         if account.balance < ctx.inputs().amount {
///             return Err(ctx.halt(CommandError::runtime("insufficient_funds", "balance too low")));
///         }
///         // ...
///     }
/// }
/// ```
#[async_trait]
pub trait Command: Send + Sync + Sized + 'static {
    /// Stable identity; used in runtime paths, logs and `run_named`.
    const NAME: &'static str;

    /// Logical domain. `None` means the command may be called from anywhere
    /// and may call anything.
    const DOMAIN: Option<&'static str> = None;

    /// Shared dependencies handed to every run (repositories, clients).
    type Deps: Send + Sync + 'static;

    /// Typed inputs produced by the input validation phase.
    type Inputs: DeserializeOwned + Send + Sync + 'static;

    /// Value produced by the execute phase.
    type Output: Serialize + Send + 'static;

    /// Turn raw inputs into typed inputs, or report every `data` error found.
    ///
    /// Must be total: invalid input is reported, never panicked on.
    fn validate_inputs(&self, raw: &RawInputs) -> Result<Self::Inputs, Vec<CommandError>> {
        validation::deserialize_inputs(raw)
    }

    /// Register lifecycle callbacks for this command type.
    fn define_callbacks(&self, _callbacks: &mut CallbackRegistry<Self>) {}

    /// Load the records the command operates on into `ctx.records_mut()`.
    async fn load_records(&self, _ctx: &mut CommandContext<Self>) -> Step<()> {
        Ok(())
    }

    /// Check loaded records (existence, ownership, state).
    async fn validate_records(&self, _ctx: &mut CommandContext<Self>) -> Step<()> {
        Ok(())
    }

    /// Custom validation across inputs and records.
    async fn validate(&self, _ctx: &mut CommandContext<Self>) -> Step<()> {
        Ok(())
    }

    /// The business logic.
    async fn execute(&self, ctx: &mut CommandContext<Self>) -> Step<Self::Output>;
}

//! # Ratchet
//!
//! A phased command execution engine where phases advance, errors halt, and
//! transactions define authority.
//!
//! ## Core Concepts
//!
//! A [`Command`] is a definition of one unit of business logic. Running it
//! creates a [`CommandContext`] that the engine drives through a fixed
//! sequence of phases:
//!
//! - **validate inputs**: raw JSON becomes typed inputs, or `data` errors
//! - **load records**: everything the command touches is fetched up front
//! - **validate records** and **validate**: business preconditions
//! - **execute**: the business logic, the only phase that produces a value
//!
//! The key principle: **One Run = One Transaction**. A top-level run opens a
//! transaction before the first phase and either commits it after execute or
//! rolls it back on the first halting error. Subcommands run inside the
//! caller's transaction unless started isolated.
//!
//! ## Architecture
//!
//! ```text
//! engine.run::<C>(inputs)
//!     │
//!     ▼
//! drive ─► open_transaction ─► validate_inputs ─► load_records
//!     │        ─► validate_records ─► validate ─► execute ─► commit_transaction
//!     │
//!     │   each phase:  before* ─► around* ─► body ─► around* ─► after*
//!     │                                        │
//!     │                                        └─► ctx.run_subcommand_or_halt::<S>()
//!     │                                                 └─► drive (shared transaction)
//!     │
//!     ├─► halt   ─► rollback ─► error callbacks ─► failed   ─► Outcome::Failure
//!     ├─► fault  ─► rollback ─► error callbacks ─► errored  ─► Outcome::Failure
//!     └─► commit ─────────────────────────────────► succeeded ─► Outcome::Success
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Phases are ordered** - No phase runs before the previous one finished
//! 2. **Halts are final** - Once halted, no later phase or callback of that phase runs
//! 3. **Errors are never lost** - A halt always carries at least one error
//! 4. **Faults are contained** - Panics and unexpected errors become `system/internal_error`
//! 5. **Only the owner commits** - Nested runs never commit or roll back a shared transaction
//!
//! ## Example
//!
//! ```ignore
//! use ratchet::{async_trait, Command, CommandContext, Engine, Outcome, Step};
//!
//! struct Greet;
//!
//! #[derive(serde::Deserialize)]
//! struct GreetInputs {
//!     name: String,
//! }
//!
//! #[async_trait]
//! impl Command for Greet {
//!     const NAME: &'static str = "greet";
//!     type Deps = ();
//!     type Inputs = GreetInputs;
//!     type Output = String;
//!
//!     async fn execute(&self, ctx: &mut CommandContext<Self>) -> Step<String> {
//!         Ok(format!("hello {}", ctx.inputs().name))
//!     }
//! }
//!
//! let engine = Engine::builder(()).register(Greet).build();
//! match engine.run::<Greet>(serde_json::json!({"name": "ada"})).await {
//!     Outcome::Success(greeting) => println!("{greeting}"),
//!     Outcome::Failure(errors) => eprintln!("{errors}"),
//! }
//! ```

// Core modules
mod callback;
mod collection;
mod config;
mod context;
mod core;
mod engine;
mod error;
mod lifecycle;
mod mapper;
mod outcome;
mod registry;
mod state;
mod subcommand;
mod transaction;

// Reference input validator
pub mod validation;

// Subscriber setup for binaries and tests
pub mod telemetry;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;



// Re-export core traits
pub use crate::core::{Command, CorrelationId, Halted, Interrupt, RawInputs, Step};

// Re-export error types
pub use crate::error::{
    Categorizable, CommandError, ErrorCategory, PathSegment, RatchetError, Severity,
};
pub use collection::{ErrorCollection, ErrorKey, ErrorRecord};
pub use outcome::Outcome;

// Re-export lifecycle types
pub use context::{CommandContext, ErrorMode, ExecutionPath, Records};
pub use lifecycle::RunReport;
pub use state::{LifecycleState, Phase, Transition};

// Re-export callback types
pub use callback::{
    execute_around_chain, Around, AsyncErrorHook, AsyncHook, CallbackCondition, CallbackKind,
    CallbackRegistry, Chain, ErrorHook, Failure, Hook, Next, PhaseBody, RegisteredCallback,
    SyncHook,
};

// Re-export transaction types
pub use transaction::{
    NoopBackend, Transaction, TransactionBackend, TransactionError, TransactionScope,
    TransactionStatus,
};

// Re-export composition types
pub use mapper::{DomainMapper, MapperFn, MapperRegistry};
pub use subcommand::DomainGraph;

// Re-export engine types (primary entry point)
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use registry::{CommandMetadata, CommandRegistry, RegisteredCommand};

// Re-export commonly used external types
pub use async_trait::async_trait;

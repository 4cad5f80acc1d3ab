//! Structured error values and engine errors for ratchet.
//!
//! `CommandError` is the value type every declared failure is expressed in.
//! `RatchetError` is the pattern-matchable error for engine misconfiguration.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` or panic ever crosses the `run()` boundary.**
//!
//! - `anyhow` is internal transport (ergonomic inside phase bodies)
//! - `CommandError` is the only externalized error (structured for connectors)
//!
//! Faults are converted into a single `system/internal_error` by the
//! lifecycle driver before they reach an [`Outcome`](crate::Outcome).
//!
//! # Example
//!
//! ```ignore
//! use ratchet::{CommandError, Severity};
//!
//! let error = CommandError::data("invalid_type", "must be an integer")
//!     .at_field("b")
//!     .with_context("expected", "integer")
//!     .with_severity(Severity::Error);
//!
//! assert_eq!(error.key().to_string(), "data.b.invalid_type");
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::collection::ErrorKey;

// =============================================================================
// Category & Severity
// =============================================================================

/// Error category, a fixed taxonomy shared with connectors.
///
/// # Exposure Rules
///
/// - `Data`: Safe to expose details (bad request shape)
/// - `Runtime`: Safe to expose (declared business rule violations)
/// - `Domain`: Safe to expose (cross-cutting business invariants)
/// - `System`: NEVER expose details (infrastructure, internal faults)
/// - `Auth`: NEVER expose details (authentication/authorization)
/// - `External`: NEVER expose details (third-party failures)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Input shape errors - always local, halting by default.
    Data,
    /// Declared business rule violations.
    Runtime,
    /// Cross-cutting business invariants.
    Domain,
    /// Collaborator and infrastructure failures.
    System,
    /// Authentication and authorization failures.
    Auth,
    /// Third-party dependency failures.
    External,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Data => "data",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::Domain => "domain",
            ErrorCategory::System => "system",
            ErrorCategory::Auth => "auth",
            ErrorCategory::External => "external",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered error severity: `Debug < Info < Warning < Error < Critical < Fatal`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    #[default]
    Error,
    Critical,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
            Severity::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Data Path
// =============================================================================

/// One segment of a data-path: a field name or a sequence index.
///
/// Serializes untagged, so `["items", 2, "sku"]` is the wire form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Field(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "{i}"),
            PathSegment::Field(name) => f.write_str(name),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(name: &str) -> Self {
        PathSegment::Field(name.to_owned())
    }
}

impl From<String> for PathSegment {
    fn from(name: String) -> Self {
        PathSegment::Field(name)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

// =============================================================================
// Command Error
// =============================================================================

/// An immutable, structured error raised while running a command.
///
/// Identity is `category + symbol + path` (see [`CommandError::key`]). The
/// `runtime_path` records which nested commands the error travelled through,
/// outermost first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandError {
    category: ErrorCategory,
    symbol: Cow<'static, str>,
    message: String,
    #[serde(default)]
    path: Vec<PathSegment>,
    #[serde(default)]
    runtime_path: Vec<String>,
    #[serde(default)]
    severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cause: Option<Box<CommandError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    context: BTreeMap<String, Value>,
    created_at: DateTime<Utc>,
}

impl CommandError {
    pub fn new(
        category: ErrorCategory,
        symbol: impl Into<Cow<'static, str>>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            symbol: symbol.into(),
            message: message.into(),
            path: Vec::new(),
            runtime_path: Vec::new(),
            severity: Severity::Error,
            cause: None,
            suggestion: None,
            context: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Create a `data` error (bad input shape).
    pub fn data(symbol: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Data, symbol, message)
    }

    /// Create a `runtime` error (declared business rule violation).
    pub fn runtime(symbol: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Runtime, symbol, message)
    }

    pub fn domain(symbol: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Domain, symbol, message)
    }

    pub fn system(symbol: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::System, symbol, message)
    }

    pub fn auth(symbol: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, symbol, message)
    }

    pub fn external(symbol: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::External, symbol, message)
    }

    /// Create a `runtime/not_found` error for a record that could not be loaded.
    pub fn not_found(record: &str) -> Self {
        Self::runtime("not_found", format!("{record} not found"))
    }

    /// Wrap an unexpected fault into the single `system/internal_error`.
    ///
    /// The full fault chain is kept in `cause` and in the `fault` context
    /// entry; the message itself stays generic.
    pub fn internal(fault: &anyhow::Error) -> Self {
        let chain: Vec<Value> = fault.chain().map(|e| Value::String(e.to_string())).collect();
        Self::system("internal_error", "An internal error occurred")
            .with_severity(Severity::Fatal)
            .caused_by(Self::system("fault", format!("{fault:#}")))
            .with_context("fault", Value::Array(chain))
    }

    /// Convert a [`Categorizable`] domain error into a `CommandError`.
    pub fn from_categorized<E: Categorizable + ?Sized>(error: &E) -> Self {
        Self::new(error.category(), error.symbol(), error.safe_message())
    }

    // -------------------------------------------------------------------------
    // Builders
    // -------------------------------------------------------------------------

    /// Set the data-path.
    pub fn at<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PathSegment>,
    {
        self.path = path.into_iter().map(Into::into).collect();
        self
    }

    /// Set a single-field data-path.
    pub fn at_field(self, field: impl Into<String>) -> Self {
        self.at([PathSegment::Field(field.into())])
    }

    /// Prefix the data-path, used when a nested shape reports errors.
    pub fn under(mut self, segment: impl Into<PathSegment>) -> Self {
        self.path.insert(0, segment.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn caused_by(mut self, cause: CommandError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn path(&self) -> &[PathSegment] {
        &self.path
    }

    pub fn runtime_path(&self) -> &[String] {
        &self.runtime_path
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn cause(&self) -> Option<&CommandError> {
        self.cause.as_deref()
    }

    pub fn suggestion(&self) -> Option<&str> {
        self.suggestion.as_deref()
    }

    pub fn context(&self) -> &BTreeMap<String, Value> {
        &self.context
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Iterate over the cause chain, starting with this error's direct cause.
    pub fn causes(&self) -> impl Iterator<Item = &CommandError> {
        std::iter::successors(self.cause(), |e| e.cause())
    }

    /// The stable identity key: category, symbol and data-path.
    pub fn key(&self) -> ErrorKey {
        ErrorKey::new(self.category, self.symbol.clone(), self.path.clone())
    }

    /// Record that this error crossed the boundary of command `identity`.
    pub(crate) fn prepend_runtime(&mut self, identity: &str) {
        self.runtime_path.insert(0, identity.to_owned());
    }

    /// Rebuild an error from its wire form. Cause and suggestion are not part
    /// of the wire contract and come back empty.
    pub(crate) fn from_parts(
        category: ErrorCategory,
        symbol: String,
        message: String,
        path: Vec<PathSegment>,
        runtime_path: Vec<String>,
        severity: Severity,
        context: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            path,
            runtime_path,
            severity,
            context,
            ..Self::new(category, symbol, message)
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key(), self.message)?;
        if !self.runtime_path.is_empty() {
            write!(f, " (in {})", self.runtime_path.join(" > "))?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

// =============================================================================
// Categorizable Trait
// =============================================================================

/// Trait for domain errors that can be turned into a [`CommandError`].
///
/// # Safe Message Contract
///
/// - `Data`, `Runtime` and `Domain` categories MAY return their Display string
/// - `System`, `Auth` and `External` MUST return generic messages
///
/// # Example
///
/// ```ignore
/// impl Categorizable for LedgerError {
///     fn category(&self) -> ErrorCategory {
///         match self {
///             LedgerError::InsufficientFunds { .. } => ErrorCategory::Runtime,
///             LedgerError::Database(_) => ErrorCategory::System,
///         }
///     }
///
///     fn symbol(&self) -> Cow<'static, str> {
///         match self {
///             LedgerError::InsufficientFunds { .. } => "insufficient_funds".into(),
///             LedgerError::Database(_) => "ledger_unavailable".into(),
///         }
///     }
/// }
/// ```
pub trait Categorizable: std::error::Error {
    fn category(&self) -> ErrorCategory;

    /// Short machine-readable identifier.
    fn symbol(&self) -> Cow<'static, str>;

    /// A sanitized, user-safe message.
    fn safe_message(&self) -> Cow<'static, str> {
        match self.category() {
            ErrorCategory::System | ErrorCategory::Auth | ErrorCategory::External => {
                "An internal error occurred".into()
            }
            _ => self.to_string().into(),
        }
    }
}

// =============================================================================
// Ratchet Error
// =============================================================================

/// Structured error type for engine operations.
///
/// These never describe a business outcome; they mean the engine itself was
/// wired up or called incorrectly.
#[derive(Debug, Error)]
pub enum RatchetError {
    /// A command with this identity is already registered.
    #[error("command {name} is already registered")]
    DuplicateCommand { name: &'static str },

    /// No command is registered under this identity.
    #[error("no command registered as {name}")]
    CommandNotRegistered { name: String },

    /// A callback was registered under a kind its hook cannot serve.
    #[error("callback registered as {kind} but its hook is a {hook} hook")]
    CallbackKindMismatch {
        kind: crate::callback::CallbackKind,
        hook: &'static str,
    },

    /// No domain mapper for the requested type pair.
    #[error("no domain mapper from {source_type} to {target_type}")]
    MapperNotFound {
        source_type: &'static str,
        target_type: &'static str,
    },

    /// A domain mapper for this type pair already exists.
    #[error("domain mapper from {source_type} to {target_type} is already registered")]
    DuplicateMapper {
        source_type: &'static str,
        target_type: &'static str,
    },

    /// A subcommand call crossed into a domain the caller never declared.
    #[error("domain {caller} does not declare a dependency on domain {callee}")]
    CrossDomainCall {
        caller: &'static str,
        callee: &'static str,
    },

    /// The whole run did not finish in time; commit was not observed.
    #[error("command {name} timed out after {duration:?}")]
    Timeout {
        name: &'static str,
        duration: std::time::Duration,
    },
}

impl Categorizable for RatchetError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::System
    }

    fn symbol(&self) -> Cow<'static, str> {
        match self {
            RatchetError::DuplicateCommand { .. } => "duplicate_command",
            RatchetError::CommandNotRegistered { .. } => "command_not_registered",
            RatchetError::CallbackKindMismatch { .. } => "callback_kind_mismatch",
            RatchetError::MapperNotFound { .. } => "mapper_not_found",
            RatchetError::DuplicateMapper { .. } => "duplicate_mapper",
            RatchetError::CrossDomainCall { .. } => "cross_domain_call_not_allowed",
            RatchetError::Timeout { .. } => "timeout",
        }
        .into()
    }

    fn safe_message(&self) -> Cow<'static, str> {
        // Engine wiring errors are developer-facing and carry no user data.
        self.to_string().into()
    }
}

impl From<RatchetError> for CommandError {
    fn from(error: RatchetError) -> Self {
        let mut converted = CommandError::from_categorized(&error);
        match &error {
            RatchetError::MapperNotFound {
                source_type,
                target_type,
            } => {
                converted = converted
                    .with_context("source_type", *source_type)
                    .with_context("target_type", *target_type);
            }
            RatchetError::CrossDomainCall { caller, callee } => {
                converted = converted
                    .with_context("caller_domain", *caller)
                    .with_context("callee_domain", *callee);
            }
            _ => {}
        }
        converted
    }
}

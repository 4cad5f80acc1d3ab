//! Ordered error collections and their wire form.
//!
//! An [`ErrorCollection`] serializes as a list of [`ErrorRecord`]s:
//!
//! ```json
//! [{"category": "data", "symbol": "invalid_type", "path": ["b"],
//!   "message": "must be an integer", "severity": "error",
//!   "context": {"expected": "integer", "actual": "string"}}]
//! ```
//!
//! Connectors depend on this shape; fields are only ever added, never renamed.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CommandError, ErrorCategory, PathSegment, Severity};

/// Identity of an error: category, symbol and data-path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorKey {
    category: ErrorCategory,
    symbol: Cow<'static, str>,
    path: Vec<PathSegment>,
}

impl ErrorKey {
    pub fn new(
        category: ErrorCategory,
        symbol: impl Into<Cow<'static, str>>,
        path: Vec<PathSegment>,
    ) -> Self {
        Self {
            category,
            symbol: symbol.into(),
            path,
        }
    }
}

impl fmt::Display for ErrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.category)?;
        for segment in &self.path {
            write!(f, ".{segment}")?;
        }
        write!(f, ".{}", self.symbol)
    }
}

// =============================================================================
// Wire Record
// =============================================================================

/// The serialized form of one error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub symbol: String,
    pub path: Vec<PathSegment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runtime_path: Vec<String>,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BTreeMap<String, Value>>,
}

impl From<&CommandError> for ErrorRecord {
    fn from(error: &CommandError) -> Self {
        let context = error.context();
        Self {
            category: error.category(),
            symbol: error.symbol().to_owned(),
            path: error.path().to_vec(),
            runtime_path: error.runtime_path().to_vec(),
            message: error.message().to_owned(),
            severity: error.severity(),
            context: (!context.is_empty()).then(|| context.clone()),
        }
    }
}

impl From<ErrorRecord> for CommandError {
    fn from(record: ErrorRecord) -> Self {
        CommandError::from_parts(
            record.category,
            record.symbol,
            record.message,
            record.path,
            record.runtime_path,
            record.severity,
            record.context.unwrap_or_default(),
        )
    }
}

// =============================================================================
// Error Collection
// =============================================================================

/// Ordered, duplicate-permitting sequence of errors for one command run.
///
/// Appending is the only mutation. The lifecycle driver stops appending once
/// the run reaches a terminal state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<ErrorRecord>", from = "Vec<ErrorRecord>")]
pub struct ErrorCollection {
    errors: Vec<CommandError>,
}

impl ErrorCollection {
    pub const fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn push(&mut self, error: CommandError) {
        self.errors.push(error);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns true if any error was recorded.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_fatal(&self) -> bool {
        self.errors.iter().any(|e| e.severity() == Severity::Fatal)
    }

    pub fn first(&self) -> Option<&CommandError> {
        self.errors.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CommandError> {
        self.errors.iter()
    }

    pub fn by_category(&self, category: ErrorCategory) -> impl Iterator<Item = &CommandError> {
        self.errors.iter().filter(move |e| e.category() == category)
    }

    /// Errors at or above `severity`.
    pub fn at_least(&self, severity: Severity) -> impl Iterator<Item = &CommandError> {
        self.errors.iter().filter(move |e| e.severity() >= severity)
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.errors.iter().any(|e| e.symbol() == symbol)
    }

    pub fn keys(&self) -> impl Iterator<Item = ErrorKey> + '_ {
        self.errors.iter().map(CommandError::key)
    }

    /// Copy of this collection keeping the first error for each identity key.
    pub fn deduplicated(&self) -> Self {
        let mut seen = HashSet::new();
        self.errors
            .iter()
            .filter(|e| seen.insert(e.key()))
            .cloned()
            .collect()
    }

    /// Re-home every error under command `identity`.
    pub fn with_runtime_prefix(mut self, identity: &str) -> Self {
        for error in &mut self.errors {
            error.prepend_runtime(identity);
        }
        self
    }

    pub fn to_records(&self) -> Vec<ErrorRecord> {
        self.errors.iter().map(ErrorRecord::from).collect()
    }

    pub fn into_vec(self) -> Vec<CommandError> {
        self.errors
    }
}

impl fmt::Display for ErrorCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return f.write_str("no errors");
        }
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorCollection {}

impl From<CommandError> for ErrorCollection {
    fn from(error: CommandError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

impl From<Vec<CommandError>> for ErrorCollection {
    fn from(errors: Vec<CommandError>) -> Self {
        Self { errors }
    }
}

impl From<ErrorCollection> for Vec<ErrorRecord> {
    fn from(collection: ErrorCollection) -> Self {
        collection.to_records()
    }
}

impl From<Vec<ErrorRecord>> for ErrorCollection {
    fn from(records: Vec<ErrorRecord>) -> Self {
        records.into_iter().map(CommandError::from).collect()
    }
}

impl FromIterator<CommandError> for ErrorCollection {
    fn from_iter<I: IntoIterator<Item = CommandError>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}

impl Extend<CommandError> for ErrorCollection {
    fn extend<I: IntoIterator<Item = CommandError>>(&mut self, iter: I) {
        self.errors.extend(iter);
    }
}

impl IntoIterator for ErrorCollection {
    type Item = CommandError;
    type IntoIter = std::vec::IntoIter<CommandError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<'a> IntoIterator for &'a ErrorCollection {
    type Item = &'a CommandError;
    type IntoIter = std::slice::Iter<'a, CommandError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

//! The result of running a command.

use serde::{Deserialize, Serialize};

use crate::collection::ErrorCollection;

static NO_ERRORS: ErrorCollection = ErrorCollection::new();

/// Outcome of a command run.
///
/// Ratchet does not hand back partial results. A run either produced the
/// execute phase's value or it produced the full error collection.
///
/// Serializes as `{"status": "success", "data": ..}` or
/// `{"status": "failure", "data": [..error records..]}`.
#[must_use]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum Outcome<T> {
    Success(T),
    Failure(ErrorCollection),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    /// The collected errors; empty for a success.
    pub fn errors(&self) -> &ErrorCollection {
        match self {
            Outcome::Success(_) => &NO_ERRORS,
            Outcome::Failure(errors) => errors,
        }
    }

    /// Returns the success value.
    ///
    /// # Panics
    ///
    /// Panics with the collected errors if the outcome is a failure.
    #[track_caller]
    pub fn unwrap(self) -> T {
        match self {
            Outcome::Success(value) => value,
            Outcome::Failure(errors) => {
                panic!("called `Outcome::unwrap()` on a failure: {errors}")
            }
        }
    }

    /// Returns the success value.
    ///
    /// # Panics
    ///
    /// Panics with `msg` and the collected errors if the outcome is a failure.
    #[track_caller]
    pub fn expect(self, msg: &str) -> T {
        match self {
            Outcome::Success(value) => value,
            Outcome::Failure(errors) => panic!("{msg}: {errors}"),
        }
    }

    /// Returns the error collection.
    ///
    /// # Panics
    ///
    /// Panics if the outcome is a success.
    #[track_caller]
    pub fn unwrap_failure(self) -> ErrorCollection {
        match self {
            Outcome::Success(_) => panic!("called `Outcome::unwrap_failure()` on a success"),
            Outcome::Failure(errors) => errors,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(value) => Outcome::Success(f(value)),
            Outcome::Failure(errors) => Outcome::Failure(errors),
        }
    }

    pub fn into_result(self) -> Result<T, ErrorCollection> {
        self.into()
    }
}

impl<T> From<Outcome<T>> for Result<T, ErrorCollection> {
    fn from(outcome: Outcome<T>) -> Self {
        match outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(errors) => Err(errors),
        }
    }
}

impl<T> From<Result<T, ErrorCollection>> for Outcome<T> {
    fn from(result: Result<T, ErrorCollection>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(errors) => Outcome::Failure(errors),
        }
    }
}

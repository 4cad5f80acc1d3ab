//! Lifecycle states, transitions and the ordered phase table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a command run currently is.
///
/// ```text
/// pending → transaction_open → inputs_validated → records_loaded
///         → records_validated → validated → executed
///         → transaction_committed → succeeded
///
/// any non-terminal state → failed | errored
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    TransactionOpen,
    InputsValidated,
    RecordsLoaded,
    RecordsValidated,
    Validated,
    Executed,
    TransactionCommitted,
    Succeeded,
    Failed,
    Errored,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Succeeded | LifecycleState::Failed | LifecycleState::Errored
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::TransactionOpen => "transaction_open",
            LifecycleState::InputsValidated => "inputs_validated",
            LifecycleState::RecordsLoaded => "records_loaded",
            LifecycleState::RecordsValidated => "records_validated",
            LifecycleState::Validated => "validated",
            LifecycleState::Executed => "executed",
            LifecycleState::TransactionCommitted => "transaction_committed",
            LifecycleState::Succeeded => "succeeded",
            LifecycleState::Failed => "failed",
            LifecycleState::Errored => "errored",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named transition between two states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    OpenTransaction,
    ValidateInputs,
    LoadRecords,
    ValidateRecords,
    Validate,
    Execute,
    CommitTransaction,
    Succeed,
    Fail,
    Error,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::OpenTransaction => "open_transaction",
            Transition::ValidateInputs => "validate_inputs",
            Transition::LoadRecords => "load_records",
            Transition::ValidateRecords => "validate_records",
            Transition::Validate => "validate",
            Transition::Execute => "execute",
            Transition::CommitTransaction => "commit_transaction",
            Transition::Succeed => "succeed",
            Transition::Fail => "fail",
            Transition::Error => "error",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-terminal phase: one `from → to` step with a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    OpenTransaction,
    ValidateInputs,
    LoadRecords,
    ValidateRecords,
    Validate,
    Execute,
    CommitTransaction,
}

impl Phase {
    /// Phases in the order the driver runs them.
    pub const ALL: [Phase; 7] = [
        Phase::OpenTransaction,
        Phase::ValidateInputs,
        Phase::LoadRecords,
        Phase::ValidateRecords,
        Phase::Validate,
        Phase::Execute,
        Phase::CommitTransaction,
    ];

    pub fn from_state(&self) -> LifecycleState {
        match self {
            Phase::OpenTransaction => LifecycleState::Pending,
            Phase::ValidateInputs => LifecycleState::TransactionOpen,
            Phase::LoadRecords => LifecycleState::InputsValidated,
            Phase::ValidateRecords => LifecycleState::RecordsLoaded,
            Phase::Validate => LifecycleState::RecordsValidated,
            Phase::Execute => LifecycleState::Validated,
            Phase::CommitTransaction => LifecycleState::Executed,
        }
    }

    pub fn to_state(&self) -> LifecycleState {
        match self {
            Phase::OpenTransaction => LifecycleState::TransactionOpen,
            Phase::ValidateInputs => LifecycleState::InputsValidated,
            Phase::LoadRecords => LifecycleState::RecordsLoaded,
            Phase::ValidateRecords => LifecycleState::RecordsValidated,
            Phase::Validate => LifecycleState::Validated,
            Phase::Execute => LifecycleState::Executed,
            Phase::CommitTransaction => LifecycleState::TransactionCommitted,
        }
    }

    pub fn transition(&self) -> Transition {
        match self {
            Phase::OpenTransaction => Transition::OpenTransaction,
            Phase::ValidateInputs => Transition::ValidateInputs,
            Phase::LoadRecords => Transition::LoadRecords,
            Phase::ValidateRecords => Transition::ValidateRecords,
            Phase::Validate => Transition::Validate,
            Phase::Execute => Transition::Execute,
            Phase::CommitTransaction => Transition::CommitTransaction,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.transition().as_str())
    }
}

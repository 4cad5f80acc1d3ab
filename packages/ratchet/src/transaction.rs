//! Transaction scope around a command run.
//!
//! # Ownership
//!
//! The top-level run owns its scope: it begins the backend transaction in
//! the `open_transaction` phase and is the only one that commits or rolls
//! back. A propagating subcommand receives a *delegated* handle to the same
//! scope; `open`, `commit` and `rollback` on a delegate are no-ops, but
//! [`TransactionScope::with`] reaches the same underlying transaction.
//!
//! ```text
//! run(checkout)                 owner     begin ─────────────── commit
//!   └─ run_subcommand!(reserve) delegate    (no-op)   writes    (no-op)
//! ```
//!
//! # Rollback
//!
//! `rollback` is idempotent: the first call on an open (or failed-to-commit)
//! transaction rolls it back, every later call is a no-op.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

/// A unit of work opened by a [`TransactionBackend`].
///
/// `commit` must make every pending write visible at once; `rollback` must
/// discard all of them. Neither may apply partially.
#[async_trait]
pub trait Transaction: Send + 'static {
    fn id(&self) -> Uuid;

    async fn commit(&mut self) -> anyhow::Result<()>;

    async fn rollback(&mut self) -> anyhow::Result<()>;

    /// Access to the concrete transaction for collaborators.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Begins transactions.
#[async_trait]
pub trait TransactionBackend: Send + Sync + 'static {
    async fn begin(&self) -> anyhow::Result<Box<dyn Transaction>>;
}

/// Transaction scope failures.
///
/// - [`TransactionError::Begin`], [`TransactionError::Commit`] and
///   [`TransactionError::Rollback`] mean the backend failed. These are
///   system-level failures, not business outcomes.
/// - [`TransactionError::NotOpen`] means the scope was driven out of order.
#[derive(Debug)]
pub enum TransactionError {
    Begin(anyhow::Error),
    Commit(anyhow::Error),
    Rollback(anyhow::Error),
    NotOpen,
}

impl TransactionError {
    /// Symbol used when this error surfaces as a `system` command error.
    pub fn symbol(&self) -> &'static str {
        match self {
            TransactionError::Begin(_) => "transaction_begin_failed",
            TransactionError::Commit(_) => "transaction_commit_failed",
            TransactionError::Rollback(_) => "transaction_rollback_failed",
            TransactionError::NotOpen => "transaction_not_open",
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::Begin(e) => write!(f, "failed to begin transaction: {}", e),
            TransactionError::Commit(e) => write!(f, "failed to commit transaction: {}", e),
            TransactionError::Rollback(e) => write!(f, "failed to roll back transaction: {}", e),
            TransactionError::NotOpen => write!(f, "transaction is not open"),
        }
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransactionError::Begin(e) | TransactionError::Commit(e) | TransactionError::Rollback(e) => {
                Some(e.as_ref())
            }
            TransactionError::NotOpen => None,
        }
    }
}

impl crate::error::Categorizable for TransactionError {
    fn category(&self) -> crate::error::ErrorCategory {
        crate::error::ErrorCategory::System
    }

    fn symbol(&self) -> std::borrow::Cow<'static, str> {
        TransactionError::symbol(self).into()
    }
}

/// Where a scope's transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    Open,
    Committed,
    CommitFailed,
    RolledBack,
}

struct Slot {
    tx: Option<Box<dyn Transaction>>,
    status: TransactionStatus,
}

struct Shared {
    backend: Arc<dyn TransactionBackend>,
    slot: Mutex<Slot>,
}

/// Handle to the transaction of one run tree.
#[derive(Clone)]
pub struct TransactionScope {
    shared: Arc<Shared>,
    owner: bool,
}

impl TransactionScope {
    /// A new scope owned by a top-level (or isolated) run.
    pub(crate) fn root(backend: Arc<dyn TransactionBackend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                slot: Mutex::new(Slot {
                    tx: None,
                    status: TransactionStatus::Idle,
                }),
            }),
            owner: true,
        }
    }

    /// A handle to the same scope that cannot open, commit or roll back.
    pub(crate) fn delegate(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            owner: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn status(&self) -> TransactionStatus {
        self.lock().status
    }

    /// Backend id of the open transaction, if any.
    pub fn id(&self) -> Option<Uuid> {
        self.lock().tx.as_ref().map(|tx| tx.id())
    }

    pub async fn open(&self) -> Result<(), TransactionError> {
        if !self.owner {
            return Ok(());
        }
        if self.status() != TransactionStatus::Idle {
            return Err(TransactionError::NotOpen);
        }
        let tx = self
            .shared
            .backend
            .begin()
            .await
            .map_err(TransactionError::Begin)?;
        let mut slot = self.lock();
        slot.tx = Some(tx);
        slot.status = TransactionStatus::Open;
        Ok(())
    }

    pub async fn commit(&self) -> Result<(), TransactionError> {
        if !self.owner {
            return Ok(());
        }
        let mut tx = {
            let mut slot = self.lock();
            match (slot.status, slot.tx.take()) {
                (TransactionStatus::Open, Some(tx)) => tx,
                (_, tx) => {
                    slot.tx = tx;
                    return Err(TransactionError::NotOpen);
                }
            }
        };

        let result = tx.commit().await;
        let mut slot = self.lock();
        match result {
            Ok(()) => {
                slot.status = TransactionStatus::Committed;
                Ok(())
            }
            Err(e) => {
                // Keep the transaction so rollback can still release it.
                slot.tx = Some(tx);
                slot.status = TransactionStatus::CommitFailed;
                Err(TransactionError::Commit(e))
            }
        }
    }

    pub async fn rollback(&self) -> Result<(), TransactionError> {
        if !self.owner {
            return Ok(());
        }
        let tx = {
            let mut slot = self.lock();
            match slot.status {
                TransactionStatus::Open | TransactionStatus::CommitFailed | TransactionStatus::Idle => {
                    slot.status = TransactionStatus::RolledBack;
                    slot.tx.take()
                }
                TransactionStatus::Committed | TransactionStatus::RolledBack => None,
            }
        };
        if let Some(mut tx) = tx {
            tx.rollback().await.map_err(TransactionError::Rollback)?;
        }
        Ok(())
    }

    /// Run `f` against the open transaction if it is a `T`.
    ///
    /// Returns `None` when no transaction is open or it is another type.
    ///
    /// ```ignore
    /// ctx.transaction()
    ///     .with(|tx: &mut PgTransaction| tx.stage(insert_order(&order)));
    /// ```
    pub fn with<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R>
    where
        T: Transaction,
    {
        let mut slot = self.lock();
        let tx = slot.tx.as_mut()?;
        tx.as_any_mut().downcast_mut::<T>().map(f)
    }
}

impl fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("owner", &self.owner)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// No-op Backend
// =============================================================================

/// Backend for commands without persistence; every operation succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackend;

struct NoopTransaction {
    id: Uuid,
}

#[async_trait]
impl Transaction for NoopTransaction {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn commit(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[async_trait]
impl TransactionBackend for NoopBackend {
    async fn begin(&self) -> anyhow::Result<Box<dyn Transaction>> {
        Ok(Box::new(NoopTransaction { id: Uuid::new_v4() }))
    }
}

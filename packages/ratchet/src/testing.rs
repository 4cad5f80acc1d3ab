//! Testing utilities for ratchet commands.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! ratchet = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Observing Commit / Rollback
//!
//! ```ignore
//! use ratchet::testing::{InMemoryBackend, InMemoryTransaction};
//!
//! let backend = InMemoryBackend::new();
//! let engine = Engine::builder(deps)
//!     .with_backend(Arc::new(backend.clone()))
//!     .register(PlaceOrder)
//!     .build();
//!
//! let outcome = engine.run::<PlaceOrder>(json!({"sku": "A-1"})).await;
//! assert!(outcome.is_success());
//! assert_eq!(backend.commits(), 1);
//! assert_eq!(backend.rollbacks(), 0);
//! ```
//!
//! ## Recording Callback Order
//!
//! ```ignore
//! let log = CallLog::new();
//! let l = log.clone();
//! callbacks.before(CallbackCondition::on(Transition::Execute), 10, move |_| l.push("p10"));
//! // ...
//! assert_eq!(log.entries(), vec!["p10", "p20"]);
//! ```
//!
//! ## Asserting Failures
//!
//! ```ignore
//! assert_failed_with!(outcome, "invalid_type", "missing_required_attribute");
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::outcome::Outcome;
use crate::transaction::{Transaction, TransactionBackend};

/// Assert an outcome failed with exactly these error symbols, in order.
#[macro_export]
macro_rules! assert_failed_with {
    ($outcome:expr, $($symbol:expr),+ $(,)?) => {{
        let symbols = $crate::testing::failure_symbols(&$outcome);
        let expected: Vec<&str> = vec![$($symbol),+];
        assert!($outcome.is_failure(), "expected failure, got success");
        assert_eq!(symbols, expected, "unexpected error symbols");
    }};
}

/// Symbols of every error in a failed outcome; empty for a success.
pub fn failure_symbols<T>(outcome: &Outcome<T>) -> Vec<String> {
    outcome
        .errors()
        .iter()
        .map(|e| e.symbol().to_owned())
        .collect()
}

// =============================================================================
// CallLog
// =============================================================================

/// Shared, ordered record of events for asserting callback order.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

// =============================================================================
// In-Memory Backend
// =============================================================================

#[derive(Default)]
struct Store {
    committed: Mutex<HashMap<String, Value>>,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    fail_next_commit: AtomicBool,
}

impl Store {
    fn committed(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.committed.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Key/value transaction backend with staged writes.
///
/// Writes go through [`InMemoryTransaction::put`] and only become visible
/// through [`InMemoryBackend::get`] after commit.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    store: Arc<Store>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a committed value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.committed().get(key).cloned()
    }

    /// Seed a committed value, bypassing transactions.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.store.committed().insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.store.committed().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.committed().is_empty()
    }

    pub fn begins(&self) -> usize {
        self.store.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.store.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.store.rollbacks.load(Ordering::SeqCst)
    }

    /// Make the next commit fail without applying anything.
    pub fn fail_next_commit(&self) {
        self.store.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("keys", &self.len())
            .field("begins", &self.begins())
            .field("commits", &self.commits())
            .field("rollbacks", &self.rollbacks())
            .finish()
    }
}

#[async_trait]
impl TransactionBackend for InMemoryBackend {
    async fn begin(&self) -> anyhow::Result<Box<dyn Transaction>> {
        self.store.begins.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryTransaction {
            id: Uuid::new_v4(),
            staged: Vec::new(),
            store: self.store.clone(),
        }))
    }
}

/// Transaction handed out by [`InMemoryBackend`].
pub struct InMemoryTransaction {
    id: Uuid,
    staged: Vec<(String, Value)>,
    store: Arc<Store>,
}

impl InMemoryTransaction {
    /// Stage a write; visible only after commit.
    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.staged.push((key.into(), value));
    }

    /// Read through the transaction: staged writes first, then committed.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.staged
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .or_else(|| self.store.committed().get(key).cloned())
    }

    pub fn staged(&self) -> usize {
        self.staged.len()
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn commit(&mut self) -> anyhow::Result<()> {
        if self.store.fail_next_commit.swap(false, Ordering::SeqCst) {
            anyhow::bail!("injected commit failure");
        }
        let mut committed = self.store.committed();
        for (key, value) in self.staged.drain(..) {
            committed.insert(key, value);
        }
        self.store.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> anyhow::Result<()> {
        self.staged.clear();
        self.store.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

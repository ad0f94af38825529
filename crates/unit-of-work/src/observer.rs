//! Observers notified about transaction scope lifecycle.

use std::sync::Mutex;

use crate::record::{TransactionRecord, TransactionStatus};

/// Receives lifecycle notifications from a [`UnitOfWork`](crate::UnitOfWork).
///
/// Observers are injected per unit of work; there is no global registry.
/// Callbacks run synchronously on the executing task and must not block.
pub trait TransactionObserver: Send + Sync {
    /// A scope (root or nested) was opened.
    fn on_begin(&self, _record: &TransactionRecord) {}

    /// A scope's work was committed to storage.
    fn on_commit(&self, _record: &TransactionRecord) {}

    /// A scope's work was discarded.
    fn on_rollback(&self, _record: &TransactionRecord) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransactionObserver for NoopObserver {}

/// Observer that keeps every finished record in memory.
#[derive(Debug, Default)]
pub struct InMemoryTransactionLog {
    begun: Mutex<usize>,
    finished: Mutex<Vec<TransactionRecord>>,
}

impl InMemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of scopes opened so far.
    pub fn begun(&self) -> usize {
        self.begun.lock().map(|n| *n).unwrap_or(0)
    }

    /// Every finished record, in completion order.
    pub fn records(&self) -> Vec<TransactionRecord> {
        self.finished.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Committed root transactions.
    pub fn committed_roots(&self) -> Vec<TransactionRecord> {
        self.roots_with(TransactionStatus::Committed)
    }

    /// Rolled-back root transactions.
    pub fn rolled_back_roots(&self) -> Vec<TransactionRecord> {
        self.roots_with(TransactionStatus::RolledBack)
    }

    pub fn clear(&self) {
        if let Ok(mut begun) = self.begun.lock() {
            *begun = 0;
        }
        if let Ok(mut finished) = self.finished.lock() {
            finished.clear();
        }
    }

    fn roots_with(&self, status: TransactionStatus) -> Vec<TransactionRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.is_root() && r.status == status)
            .collect()
    }

    fn push(&self, record: &TransactionRecord) {
        if let Ok(mut finished) = self.finished.lock() {
            finished.push(record.clone());
        }
    }
}

impl TransactionObserver for InMemoryTransactionLog {
    fn on_begin(&self, _record: &TransactionRecord) {
        if let Ok(mut begun) = self.begun.lock() {
            *begun += 1;
        }
    }

    fn on_commit(&self, record: &TransactionRecord) {
        self.push(record);
    }

    fn on_rollback(&self, record: &TransactionRecord) {
        self.push(record);
    }
}

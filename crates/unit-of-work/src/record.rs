//! Bookkeeping records for transaction scopes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{StreamId, TransactionId};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    /// Returns true once the scope has finished.
    pub fn is_finished(&self) -> bool {
        !matches!(self, TransactionStatus::Active)
    }
}

/// Kind of entity write registered on a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Insert => f.write_str("insert"),
            OperationKind::Update => f.write_str("update"),
        }
    }
}

/// A registered entity write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub entity_type: String,
    pub entity_id: String,
    pub registered_at: DateTime<Utc>,
}

impl std::fmt::Display for OperationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.kind, self.entity_type, self.entity_id)
    }
}

/// A registered domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub stream_id: StreamId,
    pub event_type: String,
}

/// Record of one transaction scope.
///
/// Records form a tree through `parent_transaction_id`; the root has none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: TransactionId,
    pub parent_transaction_id: Option<TransactionId>,
    pub operations: Vec<OperationRecord>,
    pub events: Vec<EventRecord>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: TransactionStatus,
    pub error_message: Option<String>,
}

impl TransactionRecord {
    pub(crate) fn begin(parent_transaction_id: Option<TransactionId>) -> Self {
        Self {
            transaction_id: TransactionId::new(),
            parent_transaction_id,
            operations: Vec::new(),
            events: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            status: TransactionStatus::Active,
            error_message: None,
        }
    }

    /// Returns true if this is an outermost scope.
    pub fn is_root(&self) -> bool {
        self.parent_transaction_id.is_none()
    }

    pub(crate) fn finish(&mut self, status: TransactionStatus, error_message: Option<String>) {
        if self.status.is_finished() {
            return;
        }
        self.status = status;
        self.end_time = Some(Utc::now());
        if self.error_message.is_none() {
            self.error_message = error_message;
        }
    }
}

/// Arena of the records of one scope tree, keyed by transaction ID.
#[derive(Debug, Default)]
pub(crate) struct TransactionArena {
    records: HashMap<TransactionId, TransactionRecord>,
}

impl TransactionArena {
    pub(crate) fn insert(&mut self, record: TransactionRecord) {
        self.records.insert(record.transaction_id, record);
    }

    pub(crate) fn get(&self, id: &TransactionId) -> Option<&TransactionRecord> {
        self.records.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &TransactionId) -> Option<&mut TransactionRecord> {
        self.records.get_mut(id)
    }

    /// Returns the chain of IDs from `id` up to the root, `id` first.
    pub(crate) fn lineage(&self, id: TransactionId) -> Vec<TransactionId> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(record) = self.records.get(&current) else {
                break;
            };
            chain.push(current);
            cursor = record.parent_transaction_id;
        }
        chain
    }

    /// Finishes every scope still active and returns the records it changed.
    pub(crate) fn finish_all(
        &mut self,
        status: TransactionStatus,
        error_message: Option<&str>,
    ) -> Vec<TransactionRecord> {
        let mut changed: Vec<_> = self
            .records
            .values_mut()
            .filter(|record| !record.status.is_finished())
            .map(|record| {
                record.finish(status, error_message.map(str::to_string));
                record.clone()
            })
            .collect();
        // Innermost scopes first, root last.
        changed.sort_by_key(|r| std::cmp::Reverse(r.start_time));
        changed
    }

    /// Returns every record, children after their parents.
    pub(crate) fn snapshot(&self) -> Vec<TransactionRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by_key(|r| r.start_time);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineage_walks_parent_links() {
        let mut arena = TransactionArena::default();
        let root = TransactionRecord::begin(None);
        let child = TransactionRecord::begin(Some(root.transaction_id));
        let grandchild = TransactionRecord::begin(Some(child.transaction_id));
        let ids = (root.transaction_id, child.transaction_id, grandchild.transaction_id);
        arena.insert(root);
        arena.insert(child);
        arena.insert(grandchild);

        assert_eq!(arena.lineage(ids.2), vec![ids.2, ids.1, ids.0]);
        assert!(arena.get(&ids.0).unwrap().is_root());
    }

    #[test]
    fn finish_keeps_first_outcome() {
        let mut record = TransactionRecord::begin(None);
        record.finish(TransactionStatus::RolledBack, Some("boom".to_string()));
        record.finish(TransactionStatus::Committed, None);

        assert_eq!(record.status, TransactionStatus::RolledBack);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
        assert!(record.end_time.is_some());
    }

    #[test]
    fn finish_all_skips_finished_scopes() {
        let mut arena = TransactionArena::default();
        let root = TransactionRecord::begin(None);
        let mut child = TransactionRecord::begin(Some(root.transaction_id));
        child.finish(TransactionStatus::RolledBack, Some("inner".to_string()));
        let root_id = root.transaction_id;
        arena.insert(root);
        arena.insert(child);

        let changed = arena.finish_all(TransactionStatus::RolledBack, Some("outer"));
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].transaction_id, root_id);
        assert_eq!(arena.snapshot().len(), 2);
    }
}

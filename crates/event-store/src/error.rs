use thiserror::Error;

use crate::{StreamId, Version};

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// A concurrency conflict occurred when appending events.
    /// The expected version did not match the stream's current version.
    #[error(
        "Concurrency conflict on stream {stream_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        stream_id: StreamId,
        expected: Version,
        actual: Version,
    },

    /// The append batch was rejected before reaching storage.
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    /// The transaction handle was already committed or rolled back.
    #[error("Transaction {0} is no longer active")]
    TransactionClosed(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Returns true if the error is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }

    /// Returns true if the same operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EventStoreError::ConcurrencyConflict { .. } | EventStoreError::Database(_)
        )
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;

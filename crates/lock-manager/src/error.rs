use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur when working with locks.
#[derive(Debug, Error)]
pub enum LockError {
    /// The key is held by an unexpired lease.
    #[error("Lock {lock_key} is held by {held_by} until {expires_at}")]
    AlreadyLocked {
        lock_key: String,
        held_by: String,
        expires_at: DateTime<Utc>,
    },

    /// The caller's lease expired and the lock is no longer theirs.
    #[error("Lock {lock_key} is no longer held by {holder_id}")]
    LockLost { lock_key: String, holder_id: String },

    /// The requested lease duration is not usable.
    #[error("Invalid lock TTL: {0}")]
    InvalidTtl(String),

    /// The in-memory lock table was poisoned by a panicking writer.
    #[error("Lock table poisoned")]
    Poisoned,

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LockError {
    /// Returns true if the error signals contention the caller may retry.
    pub fn is_contention(&self) -> bool {
        matches!(self, LockError::AlreadyLocked { .. })
    }
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

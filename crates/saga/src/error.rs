//! Saga error types.

use common::SagaId;
use event_store::EventStoreError;
use lock_manager::LockError;
use thiserror::Error;
use unit_of_work::{RepositoryError, UnitOfWorkError};

use crate::status::SagaStatus;

/// Errors that can occur during saga operations.
///
/// Failures tied to a saga carry its ID and, where relevant, the failing
/// step's index and name.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Malformed saga input or definition; never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No definition is registered for the saga type.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// The saga does not exist.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// The state machine does not allow the requested transition.
    #[error("Saga {saga_id}: invalid transition from {from} to {to}")]
    InvalidTransition {
        saga_id: SagaId,
        from: SagaStatus,
        to: SagaStatus,
    },

    /// A step exhausted its attempts.
    #[error("Saga {saga_id}: step {step_index} '{step}' failed: {reason}")]
    StepFailed {
        saga_id: SagaId,
        step_index: usize,
        step: String,
        reason: String,
    },

    /// A compensation failed; the saga is left FAILED.
    #[error("Saga {saga_id}: compensation of step {step_index} '{step}' failed: {reason}")]
    CompensationFailed {
        saga_id: SagaId,
        step_index: usize,
        step: String,
        reason: String,
    },

    /// Another holder is processing the saga.
    #[error("Saga {saga_id} is locked by {held_by}")]
    AlreadyLocked { saga_id: SagaId, held_by: String },

    /// The saga's lease was lost; processing stopped.
    #[error("Saga {saga_id}: lock lost by {holder_id}")]
    LockLost { saga_id: SagaId, holder_id: String },

    /// The saga's deadline passed.
    #[error("Saga {saga_id} timed out after {timeout_seconds}s")]
    Timeout { saga_id: SagaId, timeout_seconds: u64 },

    /// The caller cancelled processing; the saga can be resumed.
    #[error("Saga {0}: processing cancelled")]
    Cancelled(SagaId),

    /// Event store error.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// Unit-of-work error.
    #[error("Unit of work error: {0}")]
    UnitOfWork(#[from] UnitOfWorkError),

    /// Repository error.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Lock manager error.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns the saga the error concerns, when known.
    pub fn saga_id(&self) -> Option<SagaId> {
        match self {
            SagaError::NotFound(id) | SagaError::Cancelled(id) => Some(*id),
            SagaError::InvalidTransition { saga_id, .. }
            | SagaError::StepFailed { saga_id, .. }
            | SagaError::CompensationFailed { saga_id, .. }
            | SagaError::AlreadyLocked { saga_id, .. }
            | SagaError::LockLost { saga_id, .. }
            | SagaError::Timeout { saga_id, .. } => Some(*saga_id),
            _ => None,
        }
    }

    /// Returns true for lock contention the caller may back off and retry.
    pub fn is_contention(&self) -> bool {
        matches!(self, SagaError::AlreadyLocked { .. } | SagaError::LockLost { .. })
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

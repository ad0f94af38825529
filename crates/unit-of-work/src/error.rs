use common::TransactionId;
use event_store::EventStoreError;
use thiserror::Error;

/// Errors raised by repository implementations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// No entity with the given ID exists.
    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: &'static str, id: String },

    /// The entity violates a constraint of the backing store.
    #[error("Constraint violated for {entity_type} {id}: {message}")]
    Constraint {
        entity_type: &'static str,
        id: String,
        message: String,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An event store error occurred.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised at the unit-of-work boundary.
///
/// Every variant names the transaction it happened in.
#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    /// A repository write failed while flushing the scope.
    #[error("Transaction {transaction_id}: {operation} failed: {source}")]
    Repository {
        transaction_id: TransactionId,
        operation: String,
        #[source]
        source: RepositoryError,
    },

    /// An event append failed while flushing the scope.
    #[error("Transaction {transaction_id}: {operation} failed: {source}")]
    EventStore {
        transaction_id: TransactionId,
        operation: String,
        #[source]
        source: EventStoreError,
    },

    /// Opening or committing the storage transaction failed.
    #[error("Transaction {transaction_id}: {operation} failed: {source}")]
    Storage {
        transaction_id: TransactionId,
        operation: String,
        #[source]
        source: EventStoreError,
    },

    /// A nested scope failed, so the surrounding scope can only roll back.
    #[error("Transaction {transaction_id} is rollback-only: {cause}")]
    RollbackOnly {
        transaction_id: TransactionId,
        cause: String,
    },

    /// The work closure panicked.
    #[error("Transaction {transaction_id} panicked: {message}")]
    Panicked {
        transaction_id: TransactionId,
        message: String,
    },

    /// The scope was used after its root finished.
    #[error("Transaction {0} is closed")]
    ScopeClosed(TransactionId),
}

impl UnitOfWorkError {
    /// Returns the ID of the transaction the error belongs to.
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            UnitOfWorkError::Repository { transaction_id, .. }
            | UnitOfWorkError::EventStore { transaction_id, .. }
            | UnitOfWorkError::Storage { transaction_id, .. }
            | UnitOfWorkError::RollbackOnly { transaction_id, .. }
            | UnitOfWorkError::Panicked { transaction_id, .. } => *transaction_id,
            UnitOfWorkError::ScopeClosed(id) => *id,
        }
    }

    /// Returns true if an event append lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        match self {
            UnitOfWorkError::EventStore { source, .. }
            | UnitOfWorkError::Storage { source, .. } => source.is_conflict(),
            UnitOfWorkError::Repository {
                source: RepositoryError::EventStore(source),
                ..
            } => source.is_conflict(),
            _ => false,
        }
    }

    /// Returns true if retrying the whole unit of work may succeed.
    ///
    /// Failures to open or commit the storage transaction always count.
    pub fn is_transient(&self) -> bool {
        match self {
            UnitOfWorkError::Storage { .. } => true,
            UnitOfWorkError::EventStore { source, .. } => source.is_transient(),
            UnitOfWorkError::Repository { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

impl RepositoryError {
    /// Returns true if the same write may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            RepositoryError::Database(_) => true,
            RepositoryError::EventStore(source) => source.is_transient(),
            _ => false,
        }
    }
}

/// Result type for unit-of-work operations.
pub type Result<T> = std::result::Result<T, UnitOfWorkError>;

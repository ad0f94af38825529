//! Metrics error types.

use thiserror::Error;

/// Errors that can occur while aggregating or recording saga metrics.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Reading saga instances failed.
    #[error("Repository error: {0}")]
    Repository(#[from] unit_of_work::RepositoryError),

    /// A saga operation failed.
    #[error("Saga error: {0}")]
    Saga(#[from] saga::SagaError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for metrics operations.
pub type Result<T> = std::result::Result<T, MetricsError>;

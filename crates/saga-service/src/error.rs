//! Service-level error type.

use event_store::EventStoreError;
use lock_manager::LockError;
use saga::SagaError;
use saga_metrics::MetricsError;
use thiserror::Error;

/// Errors surfaced by the saga service and worker.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("saga error: {0}")]
    Saga(#[from] SagaError),

    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("telemetry setup failed: {0}")]
    Telemetry(String),
}

impl ServiceError {
    /// True when the requested saga does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::Saga(SagaError::NotFound(_)))
    }
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

//! Saga step abstraction.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use common::{CorrelationId, SagaId, TenantId};
use event_store::TransactionalEventStore;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use thiserror::Error;
use unit_of_work::{RepositoryError, TransactionScope, UnitOfWorkError};

/// Why a step or compensation attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Transient failure; the attempt may be retried.
    #[error("{0}")]
    Retryable(String),

    /// The attempt can never succeed; retrying is pointless.
    #[error("{0}")]
    Permanent(String),
}

impl StepError {
    pub fn retryable(message: impl Into<String>) -> Self {
        StepError::Retryable(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        StepError::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StepError::Retryable(message) | StepError::Permanent(message) => message,
        }
    }
}

impl From<UnitOfWorkError> for StepError {
    fn from(err: UnitOfWorkError) -> Self {
        if err.is_transient() {
            StepError::Retryable(err.to_string())
        } else {
            StepError::Permanent(err.to_string())
        }
    }
}

impl From<RepositoryError> for StepError {
    fn from(err: RepositoryError) -> Self {
        if err.is_transient() {
            StepError::Retryable(err.to_string())
        } else {
            StepError::Permanent(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        StepError::Permanent(err.to_string())
    }
}

/// What a step sees when it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub step_index: usize,
    pub step_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub input: serde_json::Value,
    /// Results of the steps completed so far, by step name.
    pub results: HashMap<String, serde_json::Value>,
    /// This step's own result; set only when compensating.
    pub result: Option<serde_json::Value>,
    pub correlation_id: CorrelationId,
    pub tenant_id: Option<TenantId>,
}

impl StepContext {
    /// Deserializes the saga input.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        Ok(serde_json::from_value(self.input.clone())?)
    }

    /// Returns the result of an earlier step.
    pub fn result_of(&self, step_name: &str) -> Option<&serde_json::Value> {
        self.results.get(step_name)
    }
}

/// One forward action of a saga and its compensating action.
///
/// Both run inside a unit-of-work scope: whatever they register on it
/// commits together with the saga's own state change.
#[async_trait]
pub trait SagaStep<S: TransactionalEventStore>: Send + Sync {
    /// Name of the step, unique within its saga definition.
    fn name(&self) -> &str;

    /// Performs the step and returns its result.
    async fn execute(
        &self,
        ctx: &StepContext,
        scope: &TransactionScope<S>,
    ) -> Result<serde_json::Value, StepError>;

    /// Undoes a completed step. Must be idempotent.
    async fn compensate(
        &self,
        ctx: &StepContext,
        scope: &TransactionScope<S>,
    ) -> Result<(), StepError> {
        let _ = (ctx, scope);
        Ok(())
    }
}

type ExecuteFn<S> = Arc<
    dyn Fn(StepContext, TransactionScope<S>) -> BoxFuture<'static, Result<serde_json::Value, StepError>>
        + Send
        + Sync,
>;

type CompensateFn<S> =
    Arc<dyn Fn(StepContext, TransactionScope<S>) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;

/// A step built from closures.
pub struct FnStep<S: TransactionalEventStore> {
    name: String,
    execute: ExecuteFn<S>,
    compensate: Option<CompensateFn<S>>,
}

impl<S: TransactionalEventStore> FnStep<S> {
    /// Creates a step without a compensating action.
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(StepContext, TransactionScope<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, StepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Arc::new(move |ctx, scope| Box::pin(execute(ctx, scope))),
            compensate: None,
        }
    }

    /// Sets the compensating action.
    pub fn with_compensation<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(StepContext, TransactionScope<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |ctx, scope| Box::pin(compensate(ctx, scope))));
        self
    }
}

#[async_trait]
impl<S: TransactionalEventStore> SagaStep<S> for FnStep<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        scope: &TransactionScope<S>,
    ) -> Result<serde_json::Value, StepError> {
        (self.execute)(ctx.clone(), scope.clone()).await
    }

    async fn compensate(
        &self,
        ctx: &StepContext,
        scope: &TransactionScope<S>,
    ) -> Result<(), StepError> {
        match &self.compensate {
            Some(compensate) => compensate(ctx.clone(), scope.clone()).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_store::EventStoreError;

    #[test]
    fn test_repository_errors_classified() {
        let db = StepError::from(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        assert!(db.is_retryable());

        let missing = StepError::from(RepositoryError::NotFound {
            entity_type: "users",
            id: "1".to_string(),
        });
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_serialization_error_is_permanent() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(!StepError::from(err).is_retryable());
    }

    #[test]
    fn test_unit_of_work_rollback_only_is_permanent() {
        let err = UnitOfWorkError::RollbackOnly {
            transaction_id: common::TransactionId::new(),
            cause: "inner failed".to_string(),
        };
        let step_err = StepError::from(err);
        assert!(!step_err.is_retryable());
        assert!(step_err.message().contains("inner failed"));
    }

    #[test]
    fn test_event_conflict_is_retryable() {
        let source = EventStoreError::ConcurrencyConflict {
            stream_id: common::StreamId::new("user-1"),
            expected: event_store::Version::initial(),
            actual: event_store::Version::first(),
        };
        let err = UnitOfWorkError::EventStore {
            transaction_id: common::TransactionId::new(),
            operation: "append".to_string(),
            source,
        };
        assert!(StepError::from(err).is_retryable());
    }

    #[test]
    fn test_unit_of_work_infrastructure_failures_are_retryable() {
        let storage = UnitOfWorkError::Storage {
            transaction_id: common::TransactionId::new(),
            operation: "commit".to_string(),
            source: EventStoreError::Database(sqlx::Error::PoolTimedOut),
        };
        assert!(StepError::from(storage).is_retryable());

        let repository = UnitOfWorkError::Repository {
            transaction_id: common::TransactionId::new(),
            operation: "update users 1".to_string(),
            source: RepositoryError::Database(sqlx::Error::PoolClosed),
        };
        assert!(StepError::from(repository).is_retryable());

        let append = UnitOfWorkError::EventStore {
            transaction_id: common::TransactionId::new(),
            operation: "append".to_string(),
            source: EventStoreError::Database(sqlx::Error::PoolTimedOut),
        };
        assert!(StepError::from(append).is_retryable());

        let invalid = UnitOfWorkError::EventStore {
            transaction_id: common::TransactionId::new(),
            operation: "append".to_string(),
            source: EventStoreError::InvalidAppend("empty batch".to_string()),
        };
        assert!(!StepError::from(invalid).is_retryable());

        let constraint = UnitOfWorkError::Repository {
            transaction_id: common::TransactionId::new(),
            operation: "insert users 1".to_string(),
            source: RepositoryError::Constraint {
                entity_type: "users",
                id: "1".to_string(),
                message: "duplicate key".to_string(),
            },
        };
        assert!(!StepError::from(constraint).is_retryable());
    }
}

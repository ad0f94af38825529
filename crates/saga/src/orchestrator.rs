//! Saga orchestrator: drives steps forward, retries, times out and compensates.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{CorrelationId, SagaId, StreamId, TenantId};
use event_store::TransactionalEventStore;
use lock_manager::{LockError, LockManager, saga_lock_key};
use tokio_util::sync::CancellationToken;
use unit_of_work::{UnitOfWork, UnitOfWorkError};

use crate::definition::{SagaDefinition, SagaRegistry};
use crate::error::{Result, SagaError};
use crate::events::SagaEvent;
use crate::instance::{FailureKind, SagaFailure, SagaInstance, StepRecord, StepStatus};
use crate::metric::{MetricSink, SAGA_DURATION_SECONDS, SAGA_RETRY_COUNT, STEP_DURATION_SECONDS, SagaMetric};
use crate::repository::{SagaFilter, SagaRepository};
use crate::retry::RetryPolicy;
use crate::status::SagaStatus;
use crate::step::{SagaStep, StepContext, StepError};

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Prefix of the lock holder recorded for each run, which appends a
    /// fresh UUID so concurrent runs never share a lease.
    pub holder_id: String,
    /// Lease length; renewed before and after every attempt.
    pub lock_ttl: Duration,
    /// Used when a definition has no policy of its own.
    pub retry_policy: RetryPolicy,
    /// Used when neither the request nor the definition sets a timeout.
    pub default_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            holder_id: format!("orchestrator-{}", uuid::Uuid::new_v4()),
            lock_ttl: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            default_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_default_timeout(mut self, default_timeout: Option<Duration>) -> Self {
        self.default_timeout = default_timeout;
        self
    }
}

/// Parameters for starting a saga.
#[derive(Debug, Clone)]
pub struct SagaRequest {
    pub saga_type: String,
    pub input: serde_json::Value,
    pub tenant_id: Option<TenantId>,
    pub correlation_id: Option<CorrelationId>,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub metadata: serde_json::Value,
}

impl SagaRequest {
    pub fn new(saga_type: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            saga_type: saga_type.into(),
            input,
            tenant_id: None,
            correlation_id: None,
            max_retries: None,
            timeout: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Failure of one step or compensation attempt.
enum AttemptError {
    /// The step itself failed; subject to retry classification.
    Step(StepError),
    /// Processing must stop (lock lost, storage unusable).
    Saga(SagaError),
}

impl From<UnitOfWorkError> for AttemptError {
    fn from(err: UnitOfWorkError) -> Self {
        AttemptError::Step(StepError::from(err))
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Step(err) => write!(f, "{err}"),
            AttemptError::Saga(err) => write!(f, "{err}"),
        }
    }
}

/// One `drive_locked` call's claim on a saga lock.
///
/// The token is unique per call, so orchestrator clones sharing a
/// `holder_id` never renew or release each other's leases.
#[derive(Debug, Clone)]
struct Lease {
    saga_id: SagaId,
    key: String,
    token: String,
}

impl Lease {
    fn new(saga_id: SagaId, holder_id: &str) -> Self {
        Self {
            saga_id,
            key: saga_lock_key(saga_id),
            token: format!("{holder_id}:{}", uuid::Uuid::new_v4()),
        }
    }

    async fn renew(&self, locks: &dyn LockManager, ttl: Duration) -> Result<()> {
        locks
            .renew(&self.key, &self.token, ttl)
            .await
            .map(|_| ())
            .map_err(|err| lock_error(self.saga_id, err))
    }
}

enum Raced<T> {
    Cancelled,
    TimedOut,
    Done(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Advanced,
    Failed,
    TimedOut,
}

/// Resolves when the saga's deadline passes; never, without one.
async fn deadline_elapsed(deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(deadline) => {
            let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(remaining).await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn lock_error(saga_id: SagaId, err: LockError) -> SagaError {
    match err {
        LockError::AlreadyLocked { held_by, .. } => SagaError::AlreadyLocked { saga_id, held_by },
        LockError::LockLost { holder_id, .. } => SagaError::LockLost { saga_id, holder_id },
        other => SagaError::Lock(other),
    }
}

fn step_context(
    saga: &SagaInstance,
    index: usize,
    step_name: &str,
    attempt: u32,
    result: Option<serde_json::Value>,
) -> StepContext {
    let results = saga
        .steps_data()
        .iter()
        .filter(|record| record.status != StepStatus::Failed)
        .filter_map(|record| record.result.clone().map(|value| (record.name.clone(), value)))
        .collect();

    StepContext {
        saga_id: saga.id(),
        saga_type: saga.saga_type().to_string(),
        step_index: index,
        step_name: step_name.to_string(),
        attempt,
        input: saga.input_data().clone(),
        results,
        result,
        correlation_id: saga.correlation_id(),
        tenant_id: saga.tenant_id().cloned(),
    }
}

/// Drives saga instances through their definitions.
///
/// Every state change is persisted through the unit of work together with
/// the matching [`SagaEvent`]; a step's own writes commit in the same
/// transaction as its completion record. A saga is only processed while
/// its `saga:<id>` lock is held.
pub struct SagaOrchestrator<S: TransactionalEventStore> {
    uow: UnitOfWork<S>,
    repository: Arc<dyn SagaRepository<S::Tx>>,
    locks: Arc<dyn LockManager>,
    registry: Arc<SagaRegistry<S>>,
    metric_sink: Option<Arc<dyn MetricSink>>,
    config: OrchestratorConfig,
}

impl<S: TransactionalEventStore> Clone for SagaOrchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            uow: self.uow.clone(),
            repository: self.repository.clone(),
            locks: self.locks.clone(),
            registry: self.registry.clone(),
            metric_sink: self.metric_sink.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: TransactionalEventStore> SagaOrchestrator<S> {
    pub fn new(
        uow: UnitOfWork<S>,
        repository: Arc<dyn SagaRepository<S::Tx>>,
        locks: Arc<dyn LockManager>,
        registry: Arc<SagaRegistry<S>>,
    ) -> Self {
        Self {
            uow,
            repository,
            locks,
            registry,
            metric_sink: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SagaRegistry<S>> {
        &self.registry
    }

    pub fn repository(&self) -> &Arc<dyn SagaRepository<S::Tx>> {
        &self.repository
    }

    /// Validates the request and persists a PENDING instance.
    #[tracing::instrument(skip(self, request), fields(saga_type = %request.saga_type))]
    pub async fn create(&self, request: SagaRequest) -> Result<SagaInstance> {
        let definition = self.registry.get(&request.saga_type)?;
        definition.validate_input(&request.input)?;
        if !request.metadata.is_object() {
            return Err(SagaError::Validation("saga metadata must be a JSON object".to_string()));
        }

        let max_retries = request
            .max_retries
            .or_else(|| definition.retry_policy().map(|p| p.max_retries))
            .unwrap_or(self.config.retry_policy.max_retries);
        let timeout = request
            .timeout
            .or(definition.timeout())
            .or(self.config.default_timeout);

        let saga = SagaInstance::new(
            definition.saga_type(),
            request.input,
            definition.len(),
            definition.pattern(),
        )
        .with_max_retries(max_retries)
        .with_timeout_seconds(timeout.map(|t| t.as_secs().max(1)))
        .with_correlation_id(request.correlation_id.unwrap_or_default())
        .with_tenant_id(request.tenant_id)
        .with_metadata(request.metadata);
        if let Some(timeout_seconds) = saga.timeout_seconds()
            && saga.deadline().is_none()
        {
            return Err(SagaError::Validation(format!(
                "saga timeout of {timeout_seconds}s is out of range"
            )));
        }

        let created = SagaEvent::SagaCreated {
            saga_id: saga.id(),
            saga_type: saga.saga_type().to_string(),
            total_steps: saga.total_steps(),
            input: saga.input_data().clone(),
            created_at: saga.started_at(),
        };

        let repository = self.repository.clone();
        let correlation_id = saga.correlation_id();
        let stream_id = StreamId::for_saga(saga.id());
        let stored = saga.clone();
        self.uow
            .execute_correlated(Some(correlation_id), move |scope| async move {
                scope.register_new(&repository, stored)?;
                scope.add_event(stream_id, created.to_new_event(correlation_id)?)?;
                Ok::<_, SagaError>(())
            })
            .await?;

        tracing::info!(saga_id = %saga.id(), total_steps = saga.total_steps(), "saga created");
        Ok(saga)
    }

    /// Creates a saga and runs it to a terminal state.
    pub async fn start_saga(
        &self,
        request: SagaRequest,
        cancel: &CancellationToken,
    ) -> Result<SagaInstance> {
        let saga = self.create(request).await?;
        self.run(saga.id(), cancel).await
    }

    /// Runs a saga from its persisted state until it is terminal.
    ///
    /// Returns the instance when it COMPLETED. A saga that was compensated
    /// yields [`SagaError::StepFailed`] or [`SagaError::Timeout`]; one left
    /// FAILED yields [`SagaError::CompensationFailed`]. An already terminal
    /// saga is returned as is. On cancellation the saga keeps its state and
    /// can be run again later.
    #[tracing::instrument(skip(self, cancel), fields(saga_id = %saga_id))]
    pub async fn run(&self, saga_id: SagaId, cancel: &CancellationToken) -> Result<SagaInstance> {
        self.drive_locked(saga_id, cancel, false).await
    }

    /// Runs only the next step of a saga (with its retries), followed by
    /// completion or compensation if that step settles the outcome.
    #[tracing::instrument(skip(self, cancel), fields(saga_id = %saga_id))]
    pub async fn execute_step(&self, saga_id: SagaId, cancel: &CancellationToken) -> Result<SagaInstance> {
        self.drive_locked(saga_id, cancel, true).await
    }

    /// Loads a saga instance.
    pub async fn get_saga(&self, saga_id: SagaId) -> Result<SagaInstance> {
        self.repository
            .find_by_id(&saga_id.to_string())
            .await?
            .ok_or(SagaError::NotFound(saga_id))
    }

    /// Lists sagas that have not reached a terminal status.
    pub async fn list_active(&self, tenant_id: Option<TenantId>) -> Result<Vec<SagaInstance>> {
        self.list(&SagaFilter::active().for_tenant(tenant_id)).await
    }

    pub async fn list(&self, filter: &SagaFilter) -> Result<Vec<SagaInstance>> {
        Ok(self.repository.list(filter).await?)
    }

    /// Forces active sagas past their deadline into compensation.
    ///
    /// Only saga types registered with this orchestrator are recovered;
    /// others are left for a process that knows their steps. Sagas locked
    /// by another holder are skipped. Returns the sagas that were driven to
    /// a terminal status.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn recover_timed_out(&self, cancel: &CancellationToken) -> Result<Vec<SagaId>> {
        let now = Utc::now();
        let mut overdue = Vec::new();
        for saga in self.repository.list(&SagaFilter::active()).await? {
            if !saga.is_overdue_at(now) || !saga.pattern().is_orchestrated() {
                continue;
            }
            if !self.registry.contains(saga.saga_type()) {
                tracing::debug!(
                    saga_id = %saga.id(),
                    saga_type = saga.saga_type(),
                    "overdue saga type not registered here, skipping"
                );
                continue;
            }
            overdue.push(saga);
        }

        let mut recovered = Vec::new();
        for saga in overdue {
            if cancel.is_cancelled() {
                break;
            }
            match self.run(saga.id(), cancel).await {
                Ok(_)
                | Err(SagaError::Timeout { .. })
                | Err(SagaError::StepFailed { .. })
                | Err(SagaError::CompensationFailed { .. }) => recovered.push(saga.id()),
                Err(err) if err.is_contention() => {
                    tracing::debug!(saga_id = %saga.id(), error = %err, "overdue saga held elsewhere");
                }
                Err(err) => {
                    tracing::warn!(saga_id = %saga.id(), error = %err, "timeout recovery failed");
                }
            }
        }

        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "overdue sagas recovered");
        }
        Ok(recovered)
    }

    async fn drive_locked(
        &self,
        saga_id: SagaId,
        cancel: &CancellationToken,
        single_step: bool,
    ) -> Result<SagaInstance> {
        let mut saga = self.get_saga(saga_id).await?;
        if saga.status().is_terminal() {
            return Ok(saga);
        }
        if !saga.pattern().is_orchestrated() {
            return Err(SagaError::Validation(format!(
                "saga {saga_id} uses the {} pattern and is driven by its participants",
                saga.pattern()
            )));
        }
        let definition = self.registry.get(saga.saga_type())?;
        if definition.len() != saga.total_steps() {
            return Err(SagaError::Validation(format!(
                "saga {saga_id} has {} steps but definition '{}' has {}",
                saga.total_steps(),
                definition.saga_type(),
                definition.len()
            )));
        }

        let lease = Lease::new(saga_id, &self.config.holder_id);
        self.locks
            .acquire_with_metadata(
                &lease.key,
                &lease.token,
                self.config.lock_ttl,
                serde_json::json!({ "saga_type": saga.saga_type() }),
            )
            .await
            .map_err(|err| lock_error(saga_id, err))?;

        // Re-read under the lock; another holder may have moved it on.
        let outcome = match self.get_saga(saga_id).await {
            Ok(current) => {
                saga = current;
                self.drive(&mut saga, &definition, &lease, cancel, single_step).await
            }
            Err(err) => Err(err),
        };

        match self.locks.release(&lease.key, &lease.token).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(saga_id = %saga_id, "saga lock was no longer held at release"),
            Err(err) => tracing::warn!(saga_id = %saga_id, error = %err, "failed to release saga lock"),
        }

        outcome?;
        match saga.status() {
            SagaStatus::Compensated => Err(Self::compensated_error(&saga)),
            _ => Ok(saga),
        }
    }

    async fn drive(
        &self,
        saga: &mut SagaInstance,
        definition: &SagaDefinition<S>,
        lease: &Lease,
        cancel: &CancellationToken,
        single_step: bool,
    ) -> Result<()> {
        let policy = definition
            .retry_policy()
            .cloned()
            .unwrap_or_else(|| self.config.retry_policy.clone())
            .with_max_retries(saga.max_retries());

        loop {
            match saga.status() {
                SagaStatus::Pending => self.begin(saga, lease).await?,
                SagaStatus::Running if saga.current_step() >= saga.total_steps() => {
                    self.complete(saga, lease).await?
                }
                SagaStatus::Running => {
                    let outcome = self.run_step(saga, definition, &policy, lease, cancel).await?;
                    if single_step
                        && outcome == StepOutcome::Advanced
                        && saga.current_step() < saga.total_steps()
                    {
                        return Ok(());
                    }
                }
                SagaStatus::Compensating => {
                    self.compensate(saga, definition, &policy, lease, cancel).await?
                }
                SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed => return Ok(()),
            }
        }
    }

    async fn begin(&self, saga: &mut SagaInstance, lease: &Lease) -> Result<()> {
        if saga.is_overdue_at(Utc::now()) {
            self.time_out(saga, lease, None).await?;
            return Ok(());
        }

        saga.transition(SagaStatus::Running)?;
        let event = SagaEvent::SagaStarted {
            saga_id: saga.id(),
            started_at: Utc::now(),
        };
        self.persist(saga, lease, vec![event]).await?;

        metrics::counter!("saga_started_total", "saga_type" => saga.saga_type().to_string()).increment(1);
        tracing::info!(saga_id = %saga.id(), saga_type = saga.saga_type(), "saga started");
        Ok(())
    }

    async fn run_step(
        &self,
        saga: &mut SagaInstance,
        definition: &SagaDefinition<S>,
        policy: &RetryPolicy,
        lease: &Lease,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        let index = saga.current_step();
        let step = definition.step_at(index).cloned().ok_or_else(|| {
            SagaError::Validation(format!("saga {} has no step {index}", saga.id()))
        })?;
        let deadline = saga.deadline();
        let started_at = Utc::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if saga.is_overdue_at(Utc::now()) {
                return self.time_out(saga, lease, Some((index, step.name()))).await;
            }
            lease.renew(self.locks.as_ref(), self.config.lock_ttl).await?;

            tracing::debug!(saga_id = %saga.id(), step_index = index, step = step.name(), attempt, "step attempt");
            let raced = tokio::select! {
                biased;
                _ = cancel.cancelled() => Raced::Cancelled,
                _ = deadline_elapsed(deadline) => Raced::TimedOut,
                outcome = self.attempt_step(saga, &step, index, attempt, lease) => Raced::Done(outcome),
            };

            let err = match raced {
                Raced::Cancelled => return Err(SagaError::Cancelled(saga.id())),
                Raced::TimedOut => return self.time_out(saga, lease, Some((index, step.name()))).await,
                Raced::Done(Ok(updated)) => {
                    *saga = updated;
                    self.step_completed(saga, index, step.name()).await;
                    return Ok(StepOutcome::Advanced);
                }
                Raced::Done(Err(AttemptError::Saga(err))) => return Err(err),
                Raced::Done(Err(AttemptError::Step(err))) => err,
            };

            let will_retry = err.is_retryable() && attempt < policy.max_attempts();
            tracing::warn!(
                saga_id = %saga.id(),
                step_index = index,
                step = step.name(),
                attempt,
                will_retry,
                error = %err,
                "saga step failed"
            );
            let failed = SagaEvent::StepFailed {
                saga_id: saga.id(),
                step_index: index,
                step_name: step.name().to_string(),
                attempt,
                error: err.message().to_string(),
                will_retry,
            };

            if !will_retry {
                return self.fail_step(saga, lease, index, step.name(), attempt, started_at, &err, failed).await;
            }

            saga.record_retry();
            self.persist(saga, lease, vec![failed]).await?;
            metrics::counter!("saga_step_retries_total", "saga_type" => saga.saga_type().to_string())
                .increment(1);

            let delay = policy.delay_for(attempt);
            let raced = tokio::select! {
                biased;
                _ = cancel.cancelled() => Raced::Cancelled,
                _ = deadline_elapsed(deadline) => Raced::TimedOut,
                _ = tokio::time::sleep(delay) => Raced::Done(()),
            };
            match raced {
                Raced::Cancelled => return Err(SagaError::Cancelled(saga.id())),
                Raced::TimedOut => return self.time_out(saga, lease, Some((index, step.name()))).await,
                Raced::Done(()) => {}
            }
        }
    }

    /// Runs one attempt of a step in its own unit of work.
    async fn attempt_step(
        &self,
        saga: &SagaInstance,
        step: &Arc<dyn SagaStep<S>>,
        index: usize,
        attempt: u32,
        lease: &Lease,
    ) -> std::result::Result<SagaInstance, AttemptError> {
        let ctx = step_context(saga, index, step.name(), attempt, None);
        let step = step.clone();
        let repository = self.repository.clone();
        let locks = self.locks.clone();
        let lease = lease.clone();
        let lock_ttl = self.config.lock_ttl;
        let saga_id = saga.id();
        let correlation_id = saga.correlation_id();
        let mut updated = saga.clone();
        let started_at = Utc::now();

        self.uow
            .execute_correlated(Some(correlation_id), move |scope| async move {
                let result = step.execute(&ctx, &scope).await.map_err(AttemptError::Step)?;

                // Fencing: a holder that lost its lease must not commit.
                lease
                    .renew(locks.as_ref(), lock_ttl)
                    .await
                    .map_err(AttemptError::Saga)?;

                let event = SagaEvent::StepCompleted {
                    saga_id,
                    step_index: index,
                    step_name: step.name().to_string(),
                    attempt,
                    result: result.clone(),
                };
                updated.record_step_completed(StepRecord {
                    index,
                    name: step.name().to_string(),
                    status: StepStatus::Completed,
                    attempts: attempt,
                    result: Some(result),
                    error: None,
                    started_at,
                    completed_at: Some(Utc::now()),
                    compensated_at: None,
                });

                let new_event = event
                    .to_new_event(correlation_id)
                    .map_err(|err| AttemptError::Saga(err.into()))?;
                scope.register_dirty(&repository, updated.clone())?;
                scope.add_event(StreamId::for_saga(saga_id), new_event)?;
                Ok(updated)
            })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_step(
        &self,
        saga: &mut SagaInstance,
        lease: &Lease,
        index: usize,
        step_name: &str,
        attempts: u32,
        started_at: DateTime<Utc>,
        err: &StepError,
        failed: SagaEvent,
    ) -> Result<StepOutcome> {
        let failure = SagaFailure::new(
            FailureKind::StepFailed,
            Some(index),
            Some(step_name.to_string()),
            err.message(),
        );
        saga.record_step_failed(
            StepRecord {
                index,
                name: step_name.to_string(),
                status: StepStatus::Failed,
                attempts,
                result: None,
                error: Some(err.message().to_string()),
                started_at,
                completed_at: Some(Utc::now()),
                compensated_at: None,
            },
            failure,
        );
        self.enter_compensation(saga, lease, failed, err.message()).await?;
        Ok(StepOutcome::Failed)
    }

    async fn time_out(
        &self,
        saga: &mut SagaInstance,
        lease: &Lease,
        step: Option<(usize, &str)>,
    ) -> Result<StepOutcome> {
        let timeout_seconds = saga.timeout_seconds().unwrap_or_default();
        let message = format!("saga timed out after {timeout_seconds}s");
        saga.set_failure(SagaFailure::new(
            FailureKind::Timeout,
            step.map(|(index, _)| index),
            step.map(|(_, name)| name.to_string()),
            message.clone(),
        ));

        tracing::warn!(saga_id = %saga.id(), timeout_seconds, "saga timed out");
        let timed_out = SagaEvent::SagaTimedOut {
            saga_id: saga.id(),
            timeout_seconds,
        };
        self.enter_compensation(saga, lease, timed_out, &message).await?;
        Ok(StepOutcome::TimedOut)
    }

    async fn enter_compensation(
        &self,
        saga: &mut SagaInstance,
        lease: &Lease,
        cause: SagaEvent,
        reason: &str,
    ) -> Result<()> {
        saga.transition(SagaStatus::Compensating)?;
        let started = SagaEvent::CompensationStarted {
            saga_id: saga.id(),
            reason: reason.to_string(),
            steps_to_compensate: saga.steps_to_compensate().len(),
        };
        self.persist(saga, lease, vec![cause, started]).await?;
        tracing::warn!(saga_id = %saga.id(), reason, "saga compensating");
        Ok(())
    }

    /// Undoes completed steps in reverse order.
    async fn compensate(
        &self,
        saga: &mut SagaInstance,
        definition: &SagaDefinition<S>,
        policy: &RetryPolicy,
        lease: &Lease,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for record in saga.steps_to_compensate() {
            let step = definition.step_at(record.index).cloned().ok_or_else(|| {
                SagaError::Validation(format!("saga {} has no step {}", saga.id(), record.index))
            })?;
            let mut attempt = 0;

            loop {
                attempt += 1;
                lease.renew(self.locks.as_ref(), self.config.lock_ttl).await?;

                let raced = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Raced::Cancelled,
                    outcome = self.attempt_compensation(saga, &step, &record, attempt, lease) => {
                        Raced::Done(outcome)
                    }
                };

                let err = match raced {
                    Raced::Cancelled | Raced::TimedOut => return Err(SagaError::Cancelled(saga.id())),
                    Raced::Done(Ok(updated)) => {
                        *saga = updated;
                        tracing::info!(saga_id = %saga.id(), step_index = record.index, step = %record.name, "step compensated");
                        break;
                    }
                    Raced::Done(Err(AttemptError::Saga(err))) => return Err(err),
                    Raced::Done(Err(AttemptError::Step(err))) => err,
                };

                if err.is_retryable() && attempt < policy.max_attempts() {
                    tracing::warn!(
                        saga_id = %saga.id(),
                        step_index = record.index,
                        step = %record.name,
                        attempt,
                        error = %err,
                        "compensation attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SagaError::Cancelled(saga.id())),
                        _ = tokio::time::sleep(policy.delay_for(attempt)) => {}
                    }
                    continue;
                }

                return Err(self.fail_compensation(saga, lease, &record, &err).await);
            }
        }

        saga.transition(SagaStatus::Compensated)?;
        let compensated = SagaEvent::SagaCompensated {
            saga_id: saga.id(),
            completed_at: saga.completed_at().unwrap_or_else(Utc::now),
        };
        self.persist(saga, lease, vec![compensated]).await?;

        metrics::counter!("saga_compensated_total", "saga_type" => saga.saga_type().to_string())
            .increment(1);
        tracing::info!(saga_id = %saga.id(), "saga compensated");
        self.saga_finished(saga).await;
        Ok(())
    }

    async fn attempt_compensation(
        &self,
        saga: &SagaInstance,
        step: &Arc<dyn SagaStep<S>>,
        record: &StepRecord,
        attempt: u32,
        lease: &Lease,
    ) -> std::result::Result<SagaInstance, AttemptError> {
        let ctx = step_context(saga, record.index, &record.name, attempt, record.result.clone());
        let step = step.clone();
        let repository = self.repository.clone();
        let locks = self.locks.clone();
        let lease = lease.clone();
        let lock_ttl = self.config.lock_ttl;
        let saga_id = saga.id();
        let correlation_id = saga.correlation_id();
        let index = record.index;
        let mut updated = saga.clone();

        self.uow
            .execute_correlated(Some(correlation_id), move |scope| async move {
                step.compensate(&ctx, &scope).await.map_err(AttemptError::Step)?;

                lease
                    .renew(locks.as_ref(), lock_ttl)
                    .await
                    .map_err(AttemptError::Saga)?;

                updated.mark_step_compensated(index);
                let event = SagaEvent::StepCompensated {
                    saga_id,
                    step_index: index,
                    step_name: step.name().to_string(),
                };
                let new_event = event
                    .to_new_event(correlation_id)
                    .map_err(|err| AttemptError::Saga(err.into()))?;
                scope.register_dirty(&repository, updated.clone())?;
                scope.add_event(StreamId::for_saga(saga_id), new_event)?;
                Ok(updated)
            })
            .await
    }

    /// Leaves the saga FAILED and returns the error describing why.
    async fn fail_compensation(
        &self,
        saga: &mut SagaInstance,
        lease: &Lease,
        record: &StepRecord,
        err: &StepError,
    ) -> SagaError {
        let failure = SagaFailure::new(
            FailureKind::CompensationFailed,
            Some(record.index),
            Some(record.name.clone()),
            err.message(),
        );
        saga.mark_compensation_failed(record.index, failure);
        if let Err(transition_err) = saga.transition(SagaStatus::Failed) {
            return transition_err;
        }

        let events = vec![
            SagaEvent::CompensationFailed {
                saga_id: saga.id(),
                step_index: record.index,
                step_name: record.name.clone(),
                error: err.message().to_string(),
            },
            SagaEvent::SagaFailed {
                saga_id: saga.id(),
                reason: err.message().to_string(),
                completed_at: saga.completed_at().unwrap_or_else(Utc::now),
            },
        ];
        if let Err(persist_err) = self.persist(saga, lease, events).await {
            tracing::error!(saga_id = %saga.id(), error = %persist_err, "failed to persist FAILED saga");
            return persist_err;
        }

        metrics::counter!("saga_failed_total", "saga_type" => saga.saga_type().to_string()).increment(1);
        tracing::error!(
            saga_id = %saga.id(),
            step_index = record.index,
            step = %record.name,
            error = %err,
            "compensation failed, saga needs operator intervention"
        );
        self.saga_finished(saga).await;

        SagaError::CompensationFailed {
            saga_id: saga.id(),
            step_index: record.index,
            step: record.name.clone(),
            reason: err.message().to_string(),
        }
    }

    async fn complete(&self, saga: &mut SagaInstance, lease: &Lease) -> Result<()> {
        let output: serde_json::Map<String, serde_json::Value> = saga
            .steps_data()
            .iter()
            .filter_map(|record| record.result.clone().map(|value| (record.name.clone(), value)))
            .collect();
        saga.set_output(serde_json::Value::Object(output));
        saga.transition(SagaStatus::Completed)?;

        let completed = SagaEvent::SagaCompleted {
            saga_id: saga.id(),
            completed_at: saga.completed_at().unwrap_or_else(Utc::now),
        };
        self.persist(saga, lease, vec![completed]).await?;

        metrics::counter!("saga_completed_total", "saga_type" => saga.saga_type().to_string())
            .increment(1);
        tracing::info!(saga_id = %saga.id(), retries = saga.retry_count(), "saga completed");
        self.saga_finished(saga).await;
        Ok(())
    }

    /// Persists the instance and its lifecycle events in one unit of work,
    /// provided `lease` still holds the saga lock.
    async fn persist(&self, saga: &SagaInstance, lease: &Lease, events: Vec<SagaEvent>) -> Result<()> {
        let repository = self.repository.clone();
        let locks = self.locks.clone();
        let lease = lease.clone();
        let lock_ttl = self.config.lock_ttl;
        let correlation_id = saga.correlation_id();
        let stream_id = StreamId::for_saga(saga.id());
        let stored = saga.clone();

        self.uow
            .execute_correlated(Some(correlation_id), move |scope| async move {
                lease.renew(locks.as_ref(), lock_ttl).await?;
                scope.register_dirty(&repository, stored)?;
                for event in events {
                    scope.add_event(stream_id.clone(), event.to_new_event(correlation_id)?)?;
                }
                Ok::<_, SagaError>(())
            })
            .await
    }

    async fn step_completed(&self, saga: &SagaInstance, index: usize, step_name: &str) {
        tracing::info!(saga_id = %saga.id(), step_index = index, step = step_name, "saga step completed");
        let duration = saga
            .steps_data()
            .last()
            .and_then(StepRecord::duration)
            .and_then(|d| d.to_std().ok());
        if let Some(duration) = duration {
            let metric = SagaMetric::new(saga.id(), STEP_DURATION_SECONDS, duration.as_secs_f64())
                .with_label("saga_type", saga.saga_type())
                .with_label("step", step_name);
            self.emit(metric).await;
        }
    }

    async fn saga_finished(&self, saga: &SagaInstance) {
        let Some(duration) = saga.duration().and_then(|d| d.to_std().ok()) else {
            return;
        };
        metrics::histogram!(
            "saga_duration_seconds",
            "saga_type" => saga.saga_type().to_string(),
            "status" => saga.status().as_str()
        )
        .record(duration.as_secs_f64());

        let status = saga.status().as_str();
        self.emit(
            SagaMetric::new(saga.id(), SAGA_DURATION_SECONDS, duration.as_secs_f64())
                .with_label("saga_type", saga.saga_type())
                .with_label("status", status),
        )
        .await;
        self.emit(
            SagaMetric::new(saga.id(), SAGA_RETRY_COUNT, f64::from(saga.retry_count()))
                .with_label("saga_type", saga.saga_type()),
        )
        .await;
    }

    async fn emit(&self, metric: SagaMetric) {
        let Some(sink) = &self.metric_sink else {
            return;
        };
        if let Err(err) = sink.record(metric).await {
            tracing::warn!(error = %err, "failed to record saga metric");
        }
    }

    fn compensated_error(saga: &SagaInstance) -> SagaError {
        match saga.failure() {
            Some(failure) if failure.kind == FailureKind::Timeout => SagaError::Timeout {
                saga_id: saga.id(),
                timeout_seconds: saga.timeout_seconds().unwrap_or_default(),
            },
            Some(failure) => SagaError::StepFailed {
                saga_id: saga.id(),
                step_index: failure.step_index.unwrap_or(saga.current_step()),
                step: failure.step_name.clone().unwrap_or_default(),
                reason: failure.message.clone(),
            },
            None => SagaError::StepFailed {
                saga_id: saga.id(),
                step_index: saga.current_step(),
                step: String::new(),
                reason: "saga was compensated".to_string(),
            },
        }
    }
}


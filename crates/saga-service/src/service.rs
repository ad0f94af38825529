//! Programmatic surface over the orchestrator and aggregator.

use std::sync::Arc;

use common::{SagaId, TenantId};
use event_store::{InMemoryEventStore, TransactionalEventStore};
use lock_manager::{InMemoryLockManager, LockManager};
use saga::{
    InMemorySagaRepository, MetricSink, SagaDefinition, SagaInstance, SagaOrchestrator,
    SagaRegistry, SagaRepository, SagaRequest,
};
use saga_metrics::{HealthReport, HealthThresholds, MetricsAggregator, SagaStatistics};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use unit_of_work::UnitOfWork;

use crate::config::ServiceConfig;
use crate::error::Result;

/// Entry point for callers that start and inspect sagas.
pub struct SagaService<S: TransactionalEventStore> {
    orchestrator: SagaOrchestrator<S>,
    aggregator: MetricsAggregator<S::Tx>,
    locks: Arc<dyn LockManager>,
}

impl<S: TransactionalEventStore> Clone for SagaService<S> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            aggregator: self.aggregator.clone(),
            locks: Arc::clone(&self.locks),
        }
    }
}

impl SagaService<InMemoryEventStore> {
    /// Builds a service over in-memory backends.
    pub fn in_memory(config: &ServiceConfig) -> Self {
        let store = InMemoryEventStore::new();
        let repository = Arc::new(InMemorySagaRepository::new(store.clone()));
        Self::new(store, repository, Arc::new(InMemoryLockManager::new()), config)
    }
}

impl<S: TransactionalEventStore> SagaService<S> {
    pub fn new(
        store: S,
        repository: Arc<dyn SagaRepository<S::Tx>>,
        locks: Arc<dyn LockManager>,
        config: &ServiceConfig,
    ) -> Self {
        let orchestrator = SagaOrchestrator::new(
            UnitOfWork::new(store),
            Arc::clone(&repository),
            Arc::clone(&locks),
            Arc::new(SagaRegistry::new()),
        )
        .with_config(config.orchestrator_config());

        Self {
            orchestrator,
            aggregator: MetricsAggregator::new(repository),
            locks,
        }
    }

    pub fn with_metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.orchestrator = self.orchestrator.with_metric_sink(sink);
        self
    }

    pub fn with_health_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.aggregator = self.aggregator.with_thresholds(thresholds);
        self
    }

    pub fn orchestrator(&self) -> &SagaOrchestrator<S> {
        &self.orchestrator
    }

    pub fn aggregator(&self) -> &MetricsAggregator<S::Tx> {
        &self.aggregator
    }

    pub fn locks(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    /// Registers a saga type.
    pub fn register(&self, definition: SagaDefinition<S>) -> Result<()> {
        self.orchestrator.registry().register(definition)?;
        Ok(())
    }

    /// Creates a saga and drives it to a terminal status.
    ///
    /// A saga that ends compensated or failed is reported as an error that
    /// carries its id.
    #[instrument(skip(self, request, cancel), fields(saga_type = %request.saga_type))]
    pub async fn start_saga(
        &self,
        request: SagaRequest,
        cancel: &CancellationToken,
    ) -> Result<SagaInstance> {
        Ok(self.orchestrator.start_saga(request, cancel).await?)
    }

    /// Creates a PENDING saga without running it.
    pub async fn submit_saga(&self, request: SagaRequest) -> Result<SagaId> {
        Ok(self.orchestrator.create(request).await?.id())
    }

    /// Drives an existing saga from its persisted position.
    pub async fn resume_saga(&self, saga_id: SagaId, cancel: &CancellationToken) -> Result<SagaInstance> {
        Ok(self.orchestrator.run(saga_id, cancel).await?)
    }

    pub async fn get_saga_status(&self, saga_id: SagaId) -> Result<SagaInstance> {
        Ok(self.orchestrator.get_saga(saga_id).await?)
    }

    /// Non-terminal sagas, oldest first, optionally for one tenant.
    pub async fn list_active_sagas(&self, tenant_id: Option<TenantId>) -> Result<Vec<SagaInstance>> {
        Ok(self.orchestrator.list_active(tenant_id).await?)
    }

    pub async fn statistics(&self) -> Result<SagaStatistics> {
        Ok(self.aggregator.statistics().await?)
    }

    pub async fn health(&self) -> Result<HealthReport> {
        Ok(self.aggregator.health().await?)
    }
}

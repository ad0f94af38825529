//! Saga instance persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::TenantId;
use event_store::{InMemoryEventStore, InMemoryTransaction};
use unit_of_work::{Entity, InMemoryRepository, Repository, RepositoryError};

use crate::instance::SagaInstance;
use crate::status::SagaStatus;

/// Criteria for listing saga instances.
#[derive(Debug, Clone, Default)]
pub struct SagaFilter {
    /// Statuses to include; empty means any.
    pub statuses: Vec<SagaStatus>,
    pub tenant_id: Option<TenantId>,
    pub saga_type: Option<String>,
    pub started_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl SagaFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sagas that have not reached a terminal status.
    pub fn active() -> Self {
        Self {
            statuses: SagaStatus::ALL.into_iter().filter(|s| s.is_active()).collect(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: SagaStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn for_tenant(mut self, tenant_id: Option<TenantId>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn of_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    pub fn started_after(mut self, at: DateTime<Utc>) -> Self {
        self.started_after = Some(at);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if `saga` satisfies every criterion.
    pub fn matches(&self, saga: &SagaInstance) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&saga.status()))
            && self
                .tenant_id
                .as_ref()
                .is_none_or(|tenant| saga.tenant_id() == Some(tenant))
            && self
                .saga_type
                .as_deref()
                .is_none_or(|saga_type| saga.saga_type() == saga_type)
            && self.started_after.is_none_or(|at| saga.started_at() >= at)
    }
}

/// Repository of saga instances, written through the unit of work.
#[async_trait]
pub trait SagaRepository<Tx: Send>: Repository<SagaInstance, Tx> {
    /// Lists committed instances matching `filter`, oldest first.
    async fn list(&self, filter: &SagaFilter) -> Result<Vec<SagaInstance>, RepositoryError>;
}

/// Saga repository over the row tables of an [`InMemoryEventStore`].
#[derive(Clone)]
pub struct InMemorySagaRepository {
    inner: InMemoryRepository<SagaInstance>,
}

impl InMemorySagaRepository {
    pub fn new(store: InMemoryEventStore) -> Self {
        Self {
            inner: InMemoryRepository::new(store),
        }
    }
}

#[async_trait]
impl Repository<SagaInstance, InMemoryTransaction> for InMemorySagaRepository {
    async fn save(
        &self,
        tx: &mut InMemoryTransaction,
        saga: &SagaInstance,
    ) -> Result<(), RepositoryError> {
        if saga.total_steps() == 0 {
            return Err(RepositoryError::Constraint {
                entity_type: SagaInstance::ENTITY_TYPE,
                id: saga.entity_id(),
                message: "total_steps must be positive".to_string(),
            });
        }
        self.inner.save(tx, saga).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<SagaInstance>, RepositoryError> {
        self.inner.find_by_id(id).await
    }
}

#[async_trait]
impl SagaRepository<InMemoryTransaction> for InMemorySagaRepository {
    async fn list(&self, filter: &SagaFilter) -> Result<Vec<SagaInstance>, RepositoryError> {
        let mut sagas: Vec<SagaInstance> = self
            .inner
            .all()
            .await?
            .into_iter()
            .filter(|saga| filter.matches(saga))
            .collect();
        sagas.sort_by_key(|saga| saga.started_at());
        if let Some(limit) = filter.limit {
            sagas.truncate(limit);
        }
        Ok(sagas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::SagaPattern;
    use event_store::TransactionalEventStore;

    async fn save(store: &InMemoryEventStore, repo: &InMemorySagaRepository, saga: &SagaInstance) {
        let mut tx = store.begin().await.unwrap();
        repo.save(&mut tx, saga).await.unwrap();
        store.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_and_find() {
        let store = InMemoryEventStore::new();
        let repo = InMemorySagaRepository::new(store.clone());
        let saga = SagaInstance::new("signup", serde_json::json!({"a": 1}), 2, SagaPattern::Orchestration);

        save(&store, &repo, &saga).await;

        let found = repo.find_by_id(&saga.id().to_string()).await.unwrap().unwrap();
        assert_eq!(found, saga);
    }

    #[tokio::test]
    async fn test_uncommitted_save_is_invisible() {
        let store = InMemoryEventStore::new();
        let repo = InMemorySagaRepository::new(store.clone());
        let saga = SagaInstance::new("signup", serde_json::json!({}), 1, SagaPattern::Orchestration);

        let mut tx = store.begin().await.unwrap();
        repo.save(&mut tx, &saga).await.unwrap();
        store.rollback(tx).await.unwrap();

        assert!(repo.find_by_id(&saga.id().to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_steps_rejected() {
        let store = InMemoryEventStore::new();
        let repo = InMemorySagaRepository::new(store.clone());
        let saga = SagaInstance::new("signup", serde_json::json!({}), 0, SagaPattern::Orchestration);

        let mut tx = store.begin().await.unwrap();
        let err = repo.save(&mut tx, &saga).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Constraint { .. }));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = InMemoryEventStore::new();
        let repo = InMemorySagaRepository::new(store.clone());

        let pending = SagaInstance::new("signup", serde_json::json!({}), 1, SagaPattern::Orchestration)
            .with_tenant_id(Some(TenantId::new("acme")));
        let mut completed = SagaInstance::new("signup", serde_json::json!({}), 1, SagaPattern::Orchestration)
            .with_tenant_id(Some(TenantId::new("acme")));
        completed.transition(SagaStatus::Running).unwrap();
        completed.transition(SagaStatus::Completed).unwrap();
        let other_tenant = SagaInstance::new("billing", serde_json::json!({}), 1, SagaPattern::Orchestration)
            .with_tenant_id(Some(TenantId::new("globex")));

        for saga in [&pending, &completed, &other_tenant] {
            save(&store, &repo, saga).await;
        }

        let active = repo.list(&SagaFilter::active()).await.unwrap();
        assert_eq!(active.len(), 2);

        let acme_active = repo
            .list(&SagaFilter::active().for_tenant(Some(TenantId::new("acme"))))
            .await
            .unwrap();
        assert_eq!(acme_active.len(), 1);
        assert_eq!(acme_active[0].id(), pending.id());

        let billing = repo.list(&SagaFilter::new().of_type("billing")).await.unwrap();
        assert_eq!(billing.len(), 1);

        let limited = repo.list(&SagaFilter::new().limit(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
    }
}

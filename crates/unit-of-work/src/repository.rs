//! Repository capability traits.

use std::marker::PhantomData;

use async_trait::async_trait;
use event_store::{InMemoryEventStore, InMemoryTransaction};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::RepositoryError;

/// An entity that repositories can persist.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Name of the entity type, also used as the in-memory table name.
    const ENTITY_TYPE: &'static str;

    /// Returns the entity's identifier.
    fn entity_id(&self) -> String;
}

/// Narrow persistence interface implemented per entity type.
///
/// Writes go through the caller's transaction `Tx`; reads see committed
/// state only.
#[async_trait]
pub trait Repository<E: Entity, Tx: Send>: Send + Sync {
    /// Inserts or updates the entity inside the transaction.
    async fn save(&self, tx: &mut Tx, entity: &E) -> Result<(), RepositoryError>;

    /// Finds a committed entity by ID.
    async fn find_by_id(&self, id: &str) -> Result<Option<E>, RepositoryError>;
}

/// Convenience methods for repositories.
#[async_trait]
pub trait RepositoryExt<E: Entity, Tx: Send>: Repository<E, Tx> {
    /// Finds an entity, failing with [`RepositoryError::NotFound`] if absent.
    async fn get(&self, id: &str) -> Result<E, RepositoryError> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound {
                entity_type: E::ENTITY_TYPE,
                id: id.to_string(),
            })
    }
}

impl<E: Entity, Tx: Send, R: Repository<E, Tx> + ?Sized> RepositoryExt<E, Tx> for R {}

/// Repository storing entities as JSON rows of an [`InMemoryEventStore`].
///
/// Rows live in the table named after [`Entity::ENTITY_TYPE`] and become
/// visible when the store transaction commits.
pub struct InMemoryRepository<E> {
    store: InMemoryEventStore,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> InMemoryRepository<E> {
    pub fn new(store: InMemoryEventStore) -> Self {
        Self {
            store,
            _entity: PhantomData,
        }
    }

    /// Returns every committed entity, ordered by ID.
    pub async fn all(&self) -> Result<Vec<E>, RepositoryError> {
        self.store
            .rows(E::ENTITY_TYPE)
            .await
            .into_iter()
            .map(|row| serde_json::from_value(row).map_err(RepositoryError::from))
            .collect()
    }
}

impl<E> Clone for InMemoryRepository<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<E: Entity> Repository<E, InMemoryTransaction> for InMemoryRepository<E> {
    async fn save(&self, tx: &mut InMemoryTransaction, entity: &E) -> Result<(), RepositoryError> {
        let id = entity.entity_id();
        if id.is_empty() {
            return Err(RepositoryError::Constraint {
                entity_type: E::ENTITY_TYPE,
                id,
                message: "entity ID must not be empty".to_string(),
            });
        }
        tx.put_row(E::ENTITY_TYPE, &id, serde_json::to_value(entity)?);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<E>, RepositoryError> {
        self.store
            .row(E::ENTITY_TYPE, id)
            .await
            .map(serde_json::from_value)
            .transpose()
            .map_err(RepositoryError::from)
    }
}

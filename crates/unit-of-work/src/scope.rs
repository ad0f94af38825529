use std::any::Any;
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use common::{CorrelationId, StreamId, TransactionId};
use event_store::{AppendOptions, NewEvent, TransactionalEventStore};
use futures_util::FutureExt;

use crate::error::{RepositoryError, Result, UnitOfWorkError};
use crate::observer::TransactionObserver;
use crate::record::{
    EventRecord, OperationKind, OperationRecord, TransactionArena, TransactionRecord,
    TransactionStatus,
};
use crate::repository::{Entity, Repository};

/// A staged entity write, applied to the storage transaction at commit.
#[async_trait]
pub(crate) trait PendingWrite<Tx: Send>: Send + Sync {
    fn operation(&self) -> &OperationRecord;

    fn entity(&self) -> &(dyn Any + Send + Sync);

    async fn apply(&self, tx: &mut Tx) -> std::result::Result<(), RepositoryError>;
}

struct SaveEntity<E, R: ?Sized> {
    repository: Arc<R>,
    entity: E,
    operation: OperationRecord,
}

#[async_trait]
impl<E, R, Tx> PendingWrite<Tx> for SaveEntity<E, R>
where
    E: Entity,
    R: Repository<E, Tx> + ?Sized + 'static,
    Tx: Send + 'static,
{
    fn operation(&self) -> &OperationRecord {
        &self.operation
    }

    fn entity(&self) -> &(dyn Any + Send + Sync) {
        &self.entity
    }

    async fn apply(&self, tx: &mut Tx) -> std::result::Result<(), RepositoryError> {
        self.repository.save(tx, &self.entity).await
    }
}

pub(crate) enum Staged<Tx: Send> {
    Write(Box<dyn PendingWrite<Tx>>),
    Event {
        stream_id: StreamId,
        event: NewEvent,
        options: AppendOptions,
    },
}

pub(crate) struct StagedEntry<Tx: Send> {
    pub(crate) owner: TransactionId,
    pub(crate) item: Staged<Tx>,
}

/// Shared state of one scope tree.
pub(crate) struct RootState<Tx: Send> {
    pub(crate) root_id: TransactionId,
    pub(crate) arena: TransactionArena,
    pub(crate) staged: Vec<StagedEntry<Tx>>,
    pub(crate) rollback_cause: Option<String>,
    /// Nested scopes whose closure has returned.
    pub(crate) exited: HashSet<TransactionId>,
    /// No further registrations are accepted.
    pub(crate) closed: bool,
    /// The outcome has been recorded and observers notified.
    pub(crate) finalized: bool,
}

pub(crate) fn lock_state<Tx: Send>(state: &Mutex<RootState<Tx>>) -> MutexGuard<'_, RootState<Tx>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle passed to unit-of-work closures.
///
/// Cloning is cheap and every clone refers to the same scope. Registered
/// writes and events are staged until the root scope commits.
pub struct TransactionScope<S: TransactionalEventStore> {
    id: TransactionId,
    store: S,
    pub(crate) state: Arc<Mutex<RootState<S::Tx>>>,
    correlation_id: Option<CorrelationId>,
    observer: Arc<dyn TransactionObserver>,
}

impl<S: TransactionalEventStore> Clone for TransactionScope<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            store: self.store.clone(),
            state: self.state.clone(),
            correlation_id: self.correlation_id,
            observer: self.observer.clone(),
        }
    }
}

impl<S: TransactionalEventStore> TransactionScope<S> {
    pub(crate) fn root(
        store: S,
        record: TransactionRecord,
        correlation_id: Option<CorrelationId>,
        observer: Arc<dyn TransactionObserver>,
    ) -> Self {
        let id = record.transaction_id;
        let mut arena = TransactionArena::default();
        arena.insert(record);

        Self {
            id,
            store,
            state: Arc::new(Mutex::new(RootState {
                root_id: id,
                arena,
                staged: Vec::new(),
                rollback_cause: None,
                exited: HashSet::new(),
                closed: false,
                finalized: false,
            })),
            correlation_id,
            observer,
        }
    }

    fn child(&self, id: TransactionId) -> Self {
        Self {
            id,
            ..self.clone()
        }
    }

    /// Returns this scope's transaction ID.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the ID of the outermost scope.
    pub fn root_id(&self) -> TransactionId {
        lock_state(&self.state).root_id
    }

    /// Returns the parent scope's ID, or None for the root.
    pub fn parent_id(&self) -> Option<TransactionId> {
        lock_state(&self.state)
            .arena
            .get(&self.id)
            .and_then(|r| r.parent_transaction_id)
    }

    /// Returns the IDs from this scope up to the root.
    pub fn lineage(&self) -> Vec<TransactionId> {
        lock_state(&self.state).arena.lineage(self.id)
    }

    /// Returns the correlation ID stamped on events added without one.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    /// Returns the event store the scope flushes into.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns a copy of this scope's record.
    pub fn record(&self) -> Option<TransactionRecord> {
        lock_state(&self.state).arena.get(&self.id).cloned()
    }

    /// Returns every record of the scope tree, parents first.
    pub fn records(&self) -> Vec<TransactionRecord> {
        lock_state(&self.state).arena.snapshot()
    }

    /// Returns true if a nested failure has doomed the tree.
    pub fn is_rollback_only(&self) -> bool {
        lock_state(&self.state).rollback_cause.is_some()
    }

    /// Returns the number of staged writes and events.
    pub fn staged_count(&self) -> usize {
        lock_state(&self.state).staged.len()
    }

    /// Registers a new entity to be inserted at commit.
    pub fn register_new<E, R>(&self, repository: &Arc<R>, entity: E) -> Result<()>
    where
        E: Entity,
        R: Repository<E, S::Tx> + ?Sized + 'static,
    {
        self.register_write(OperationKind::Insert, repository, entity)
    }

    /// Registers a modified entity to be saved at commit.
    pub fn register_dirty<E, R>(&self, repository: &Arc<R>, entity: E) -> Result<()>
    where
        E: Entity,
        R: Repository<E, S::Tx> + ?Sized + 'static,
    {
        self.register_write(OperationKind::Update, repository, entity)
    }

    fn register_write<E, R>(&self, kind: OperationKind, repository: &Arc<R>, entity: E) -> Result<()>
    where
        E: Entity,
        R: Repository<E, S::Tx> + ?Sized + 'static,
    {
        let operation = OperationRecord {
            kind,
            entity_type: E::ENTITY_TYPE.to_string(),
            entity_id: entity.entity_id(),
            registered_at: Utc::now(),
        };
        let write = SaveEntity {
            repository: repository.clone(),
            entity,
            operation: operation.clone(),
        };

        self.stage(Staged::Write(Box::new(write)), |record| {
            record.operations.push(operation)
        })
    }

    /// Registers a domain event to be appended at commit.
    pub fn add_event(&self, stream_id: impl Into<StreamId>, event: NewEvent) -> Result<()> {
        self.add_event_with_options(stream_id, event, AppendOptions::new())
    }

    /// Registers a domain event with an expected stream version.
    ///
    /// The version is checked against the stream as seen by the flush
    /// transaction, including events appended earlier in the same flush.
    pub fn add_event_with_options(
        &self,
        stream_id: impl Into<StreamId>,
        mut event: NewEvent,
        options: AppendOptions,
    ) -> Result<()> {
        let stream_id = stream_id.into();
        if event.correlation_id.is_none() {
            event.correlation_id = self.correlation_id;
        }
        let event_record = EventRecord {
            stream_id: stream_id.clone(),
            event_type: event.event_type.clone(),
        };

        self.stage(
            Staged::Event {
                stream_id,
                event,
                options,
            },
            |record| record.events.push(event_record),
        )
    }

    fn stage(
        &self,
        item: Staged<S::Tx>,
        note: impl FnOnce(&mut TransactionRecord),
    ) -> Result<()> {
        let mut state = lock_state(&self.state);
        if state.closed || state.exited.contains(&self.id) {
            return Err(UnitOfWorkError::ScopeClosed(self.id));
        }
        if let Some(cause) = &state.rollback_cause {
            return Err(UnitOfWorkError::RollbackOnly {
                transaction_id: self.id,
                cause: cause.clone(),
            });
        }

        match state.arena.get_mut(&self.id) {
            Some(record) if !record.status.is_finished() => note(record),
            _ => return Err(UnitOfWorkError::ScopeClosed(self.id)),
        }
        state.staged.push(StagedEntry {
            owner: self.id,
            item,
        });
        Ok(())
    }

    /// Finds an entity, preferring the latest write staged in this tree.
    pub async fn find<E, R>(
        &self,
        repository: &R,
        id: &str,
    ) -> std::result::Result<Option<E>, RepositoryError>
    where
        E: Entity,
        R: Repository<E, S::Tx> + ?Sized,
    {
        let staged = {
            let state = lock_state(&self.state);
            state.staged.iter().rev().find_map(|entry| match &entry.item {
                Staged::Write(write)
                    if write.operation().entity_type == E::ENTITY_TYPE
                        && write.operation().entity_id == id =>
                {
                    write.entity().downcast_ref::<E>().cloned()
                }
                _ => None,
            })
        };

        match staged {
            Some(entity) => Ok(Some(entity)),
            None => repository.find_by_id(id).await,
        }
    }

    /// Runs `work` in a nested scope.
    ///
    /// On success the child's staged work stays part of the tree and is
    /// committed with the root. On failure the work staged since the child
    /// began is discarded, the tree becomes rollback-only and the error is
    /// returned unchanged.
    pub async fn execute<F, Fut, T, E>(&self, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(TransactionScope<S>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        E: From<UnitOfWorkError> + Display,
    {
        let (child, mark) = {
            let mut state = lock_state(&self.state);
            if state.closed || state.exited.contains(&self.id) {
                return Err(UnitOfWorkError::ScopeClosed(self.id).into());
            }
            if let Some(cause) = &state.rollback_cause {
                return Err(UnitOfWorkError::RollbackOnly {
                    transaction_id: self.id,
                    cause: cause.clone(),
                }
                .into());
            }

            let record = TransactionRecord::begin(Some(self.id));
            self.observer.on_begin(&record);
            let child = self.child(record.transaction_id);
            state.arena.insert(record);
            (child, state.staged.len())
        };
        let child_id = child.id;
        tracing::trace!(transaction_id = %child_id, parent = %self.id, "nested scope opened");

        let outcome = AssertUnwindSafe(async move { work(child).await })
            .catch_unwind()
            .await;

        let mut state = lock_state(&self.state);
        state.exited.insert(child_id);

        let (message, error) = match outcome {
            Ok(Ok(value)) => match state.rollback_cause.clone() {
                None => return Ok(value),
                Some(cause) => {
                    let err = UnitOfWorkError::RollbackOnly {
                        transaction_id: child_id,
                        cause,
                    };
                    (err.to_string(), E::from(err))
                }
            },
            Ok(Err(err)) => (err.to_string(), err),
            Err(payload) => {
                let err = UnitOfWorkError::Panicked {
                    transaction_id: child_id,
                    message: panic_message(&*payload),
                };
                (err.to_string(), E::from(err))
            }
        };

        state.staged.truncate(mark);
        if state.rollback_cause.is_none() {
            state.rollback_cause = Some(message.clone());
        }
        if let Some(record) = state.arena.get_mut(&child_id) {
            record.finish(TransactionStatus::RolledBack, Some(message.clone()));
            self.observer.on_rollback(record);
        }
        tracing::warn!(transaction_id = %child_id, parent = %self.id, error = %message, "nested scope rolled back");

        Err(error)
    }
}

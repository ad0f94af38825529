use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use common::{CorrelationId, TransactionId};
use event_store::TransactionalEventStore;
use futures_util::FutureExt;

use crate::error::{Result, UnitOfWorkError};
use crate::observer::{NoopObserver, TransactionObserver};
use crate::record::{TransactionRecord, TransactionStatus};
use crate::scope::{RootState, Staged, StagedEntry, TransactionScope, lock_state, panic_message};

/// Atomic boundary over repository writes and event appends.
///
/// Each call to [`execute`](Self::execute) is an independent root
/// transaction; concurrent roots only contend inside the storage backend
/// at flush time.
pub struct UnitOfWork<S: TransactionalEventStore> {
    store: S,
    observer: Arc<dyn TransactionObserver>,
}

impl<S: TransactionalEventStore> Clone for UnitOfWork<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            observer: self.observer.clone(),
        }
    }
}

impl<S: TransactionalEventStore> UnitOfWork<S> {
    /// Creates a unit of work over the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Replaces the lifecycle observer.
    pub fn with_observer(mut self, observer: Arc<dyn TransactionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Returns the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs `work` in a new root scope and commits what it registered.
    ///
    /// Returns the closure's error unchanged if it fails; flush failures and
    /// panics surface as [`UnitOfWorkError`] converted into `E`. Nothing is
    /// persisted unless the whole call succeeds.
    pub async fn execute<F, Fut, T, E>(&self, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(TransactionScope<S>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        E: From<UnitOfWorkError> + Display,
    {
        self.execute_correlated(None, work).await
    }

    /// Like [`execute`](Self::execute), stamping `correlation_id` on every
    /// event registered without one.
    pub async fn execute_correlated<F, Fut, T, E>(
        &self,
        correlation_id: Option<CorrelationId>,
        work: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(TransactionScope<S>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        E: From<UnitOfWorkError> + Display,
    {
        let record = TransactionRecord::begin(None);
        let root_id = record.transaction_id;
        self.observer.on_begin(&record);

        let scope = TransactionScope::root(
            self.store.clone(),
            record,
            correlation_id,
            self.observer.clone(),
        );
        let guard = RootGuard {
            state: scope.state.clone(),
            observer: self.observer.clone(),
        };
        tracing::debug!(transaction_id = %root_id, "transaction started");

        let outcome = AssertUnwindSafe(async move { work(scope).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => match self.flush(root_id, &guard).await {
                Ok(()) => Ok(value),
                Err(err) => Err(err.into()),
            },
            Ok(Err(err)) => {
                guard.finish(TransactionStatus::RolledBack, Some(&err.to_string()));
                Err(err)
            }
            Err(payload) => {
                let err = UnitOfWorkError::Panicked {
                    transaction_id: root_id,
                    message: panic_message(&*payload),
                };
                guard.finish(TransactionStatus::RolledBack, Some(&err.to_string()));
                Err(err.into())
            }
        }
    }

    async fn flush(&self, root_id: TransactionId, guard: &RootGuard<S::Tx>) -> Result<()> {
        let staged = {
            let mut state = lock_state(&guard.state);
            state.closed = true;
            if let Some(cause) = state.rollback_cause.clone() {
                drop(state);
                let err = UnitOfWorkError::RollbackOnly {
                    transaction_id: root_id,
                    cause,
                };
                guard.finish(TransactionStatus::RolledBack, Some(&err.to_string()));
                return Err(err);
            }
            std::mem::take(&mut state.staged)
        };

        match self.write_all(root_id, staged).await {
            Ok(()) => {
                guard.finish(TransactionStatus::Committed, None);
                Ok(())
            }
            Err(err) => {
                guard.finish(TransactionStatus::RolledBack, Some(&err.to_string()));
                Err(err)
            }
        }
    }

    async fn write_all(&self, root_id: TransactionId, staged: Vec<StagedEntry<S::Tx>>) -> Result<()> {
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|source| UnitOfWorkError::Storage {
                transaction_id: root_id,
                operation: "begin".to_string(),
                source,
            })?;

        for entry in staged {
            let applied = match entry.item {
                Staged::Write(write) => {
                    write
                        .apply(&mut tx)
                        .await
                        .map_err(|source| UnitOfWorkError::Repository {
                            transaction_id: entry.owner,
                            operation: write.operation().to_string(),
                            source,
                        })
                }
                Staged::Event {
                    stream_id,
                    event,
                    options,
                } => {
                    let operation = format!("append {} to {}", event.event_type, stream_id);
                    self.store
                        .append_in(&mut tx, &stream_id, vec![event], options)
                        .await
                        .map(|_| ())
                        .map_err(|source| UnitOfWorkError::EventStore {
                            transaction_id: entry.owner,
                            operation,
                            source,
                        })
                }
            };

            if let Err(err) = applied {
                if let Err(rollback_err) = self.store.rollback(tx).await {
                    tracing::error!(transaction_id = %root_id, error = %rollback_err, "storage rollback failed");
                }
                return Err(err);
            }
        }

        self.store
            .commit(tx)
            .await
            .map_err(|source| UnitOfWorkError::Storage {
                transaction_id: root_id,
                operation: "commit".to_string(),
                source,
            })
    }
}

/// Records the outcome of a root scope exactly once.
///
/// Dropping the guard before an outcome was recorded (the executing future
/// was cancelled) rolls the tree back.
struct RootGuard<Tx: Send> {
    state: Arc<Mutex<RootState<Tx>>>,
    observer: Arc<dyn TransactionObserver>,
}

impl<Tx: Send> RootGuard<Tx> {
    fn finish(&self, status: TransactionStatus, error_message: Option<&str>) {
        let (root_id, changed) = {
            let mut state = lock_state(&self.state);
            if state.finalized {
                return;
            }
            state.closed = true;
            state.finalized = true;
            state.staged.clear();
            (state.root_id, state.arena.finish_all(status, error_message))
        };

        for record in &changed {
            match status {
                TransactionStatus::Committed => self.observer.on_commit(record),
                _ => self.observer.on_rollback(record),
            }
        }

        match status {
            TransactionStatus::Committed => {
                metrics::counter!("unit_of_work_commits_total").increment(1);
                tracing::debug!(transaction_id = %root_id, "transaction committed");
            }
            _ => {
                metrics::counter!("unit_of_work_rollbacks_total").increment(1);
                tracing::warn!(
                    transaction_id = %root_id,
                    error = error_message.unwrap_or_default(),
                    "transaction rolled back"
                );
            }
        }
    }
}

impl<Tx: Send> Drop for RootGuard<Tx> {
    fn drop(&mut self) {
        self.finish(TransactionStatus::RolledBack, Some("cancelled"));
    }
}

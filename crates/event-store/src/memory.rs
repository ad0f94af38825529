use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::RwLock;

use crate::{
    CorrelationId, Event, EventQuery, EventStoreError, NewEvent, Result, StreamId, Version,
    store::{
        AppendOptions, EventStore, EventStream, TransactionalEventStore, stamp_events,
        validate_append,
    },
};

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<Event>,
    versions: HashMap<StreamId, Version>,
    tables: HashMap<String, BTreeMap<String, serde_json::Value>>,
}

impl MemoryState {
    fn version_of(&self, stream_id: &StreamId) -> Version {
        self.versions
            .get(stream_id)
            .copied()
            .unwrap_or(Version::initial())
    }

    fn push_events(&mut self, events: Vec<Event>) {
        for event in events {
            self.versions.insert(event.stream_id.clone(), event.version);
            self.events.push(event);
        }
    }
}

/// In-memory event store implementation for tests and local runs.
///
/// Besides the event log it keeps keyed row tables that stand in for the
/// relational tables repositories write to, so repository writes and event
/// appends can share one [`InMemoryTransaction`].
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    state: Arc<RwLock<MemoryState>>,
    next_tx: Arc<AtomicU64>,
    fail_on_commit: Arc<AtomicBool>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.state.read().await.events.len()
    }

    /// Clears all events and rows.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.events.clear();
        state.versions.clear();
        state.tables.clear();
    }

    /// Configures the store to reject every commit.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    /// Returns a committed row, if present.
    pub async fn row(&self, table: &str, key: &str) -> Option<serde_json::Value> {
        let state = self.state.read().await;
        state.tables.get(table).and_then(|t| t.get(key)).cloned()
    }

    /// Returns every committed row of a table, ordered by key.
    pub async fn rows(&self, table: &str) -> Vec<serde_json::Value> {
        let state = self.state.read().await;
        state
            .tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Writes a row outside of any transaction.
    pub async fn put_row(&self, table: &str, key: &str, value: serde_json::Value) {
        let mut state = self.state.write().await;
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn snapshot_stream(events: Vec<Event>) -> EventStream {
        Box::pin(stream::iter(events.into_iter().map(Ok)))
    }
}

#[derive(Debug)]
struct StagedAppend {
    stream_id: StreamId,
    committed_base: Version,
    events: Vec<Event>,
}

#[derive(Debug)]
struct StagedRow {
    table: String,
    key: String,
    value: serde_json::Value,
}

/// Transaction handle for [`InMemoryEventStore`].
///
/// Writes are buffered and applied under a single write lock at commit;
/// stream versions observed while staging are re-validated at that point.
#[derive(Debug)]
pub struct InMemoryTransaction {
    id: u64,
    appends: Vec<StagedAppend>,
    rows: Vec<StagedRow>,
}

impl InMemoryTransaction {
    /// Returns the transaction's sequence number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stages an upsert of a row.
    pub fn put_row(&mut self, table: &str, key: &str, value: serde_json::Value) {
        self.rows.push(StagedRow {
            table: table.to_string(),
            key: key.to_string(),
            value,
        });
    }

    /// Returns the number of staged row writes.
    pub fn staged_rows(&self) -> usize {
        self.rows.len()
    }

    fn staged_version(&self, stream_id: &StreamId) -> Option<Version> {
        self.appends
            .iter()
            .rev()
            .find(|a| &a.stream_id == stream_id)
            .and_then(|a| a.events.last())
            .map(|e| e.version)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<NewEvent>,
        options: AppendOptions,
    ) -> Result<Vec<Event>> {
        validate_append(stream_id, &events)?;

        let mut state = self.state.write().await;
        let current = state.version_of(stream_id);
        options.check(stream_id, current)?;

        let stored = stamp_events(stream_id, current, events);
        state.push_events(stored.clone());

        metrics::counter!("event_store_appends_total").increment(1);
        Ok(stored)
    }

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from_version: Option<Version>,
    ) -> Result<EventStream> {
        let from = from_version.unwrap_or(Version::first());
        let state = self.state.read().await;
        let mut events: Vec<_> = state
            .events
            .iter()
            .filter(|e| &e.stream_id == stream_id && e.version >= from)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(Self::snapshot_stream(events))
    }

    async fn read_by_correlation(&self, correlation_id: CorrelationId) -> Result<EventStream> {
        let state = self.state.read().await;
        let events: Vec<_> = state
            .events
            .iter()
            .filter(|e| e.correlation_id == Some(correlation_id))
            .cloned()
            .collect();
        Ok(Self::snapshot_stream(events))
    }

    async fn stream_version(&self, stream_id: &StreamId) -> Result<Option<Version>> {
        let state = self.state.read().await;
        Ok(state.versions.get(stream_id).copied())
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<Event>> {
        let state = self.state.read().await;
        let mut events: Vec<_> = state
            .events
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();

        // Sort by timestamp then version
        events.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.version.cmp(&b.version))
        });

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(events.into_iter().skip(offset).take(limit).collect())
    }
}

#[async_trait]
impl TransactionalEventStore for InMemoryEventStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(InMemoryTransaction {
            id: self.next_tx.fetch_add(1, Ordering::SeqCst) + 1,
            appends: Vec::new(),
            rows: Vec::new(),
        })
    }

    async fn append_in(
        &self,
        tx: &mut Self::Tx,
        stream_id: &StreamId,
        events: Vec<NewEvent>,
        options: AppendOptions,
    ) -> Result<Vec<Event>> {
        validate_append(stream_id, &events)?;

        let committed = self.state.read().await.version_of(stream_id);
        let visible = tx.staged_version(stream_id).unwrap_or(committed);
        options.check(stream_id, visible)?;

        let stored = stamp_events(stream_id, visible, events);
        tx.appends.push(StagedAppend {
            stream_id: stream_id.clone(),
            committed_base: committed,
            events: stored.clone(),
        });
        Ok(stored)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        if self.fail_on_commit.load(Ordering::SeqCst) {
            return Err(EventStoreError::TransactionClosed(format!(
                "commit of transaction {} rejected by store",
                tx.id
            )));
        }

        let mut state = self.state.write().await;

        // Re-validate every stream version before touching anything.
        for append in &tx.appends {
            let actual = state.version_of(&append.stream_id);
            if actual != append.committed_base {
                return Err(EventStoreError::ConcurrencyConflict {
                    stream_id: append.stream_id.clone(),
                    expected: append.committed_base,
                    actual,
                });
            }
        }

        let appended = tx.appends.len();
        for append in tx.appends {
            state.push_events(append.events);
        }
        for row in tx.rows {
            state
                .tables
                .entry(row.table)
                .or_default()
                .insert(row.key, row.value);
        }

        metrics::counter!("event_store_appends_total").increment(appended as u64);
        tracing::trace!(transaction = tx.id, "in-memory transaction committed");
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        tracing::trace!(transaction = tx.id, "in-memory transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventStoreExt;

    fn test_event(event_type: &str) -> NewEvent {
        NewEvent::new(event_type, serde_json::json!({"test": true}))
    }

    #[tokio::test]
    async fn append_single_event() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("user-1");

        let stored = store
            .append(&stream, vec![test_event("UserCreated")], AppendOptions::expect_new())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].version, Version::first());

        let events = store.read_stream_to_vec(&stream).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn append_multiple_events() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("user-1");

        let stored = store
            .append(
                &stream,
                vec![test_event("E1"), test_event("E2"), test_event("E3")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();
        assert_eq!(stored.last().unwrap().version, Version::new(3));
        assert_eq!(
            store.stream_version(&stream).await.unwrap(),
            Some(Version::new(3))
        );
    }

    #[tokio::test]
    async fn concurrency_conflict_on_wrong_version() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("user-1");

        store
            .append(&stream, vec![test_event("E1")], AppendOptions::expect_new())
            .await
            .unwrap();

        let result = store
            .append(&stream, vec![test_event("E2")], AppendOptions::expect_new())
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn append_with_correct_expected_version() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("user-1");

        store
            .append(&stream, vec![test_event("E1")], AppendOptions::expect_new())
            .await
            .unwrap();
        let event = store
            .append_event(
                &stream,
                test_event("E2"),
                AppendOptions::expect_version(Version::first()),
            )
            .await
            .unwrap();

        assert_eq!(event.version, Version::new(2));
    }

    #[tokio::test]
    async fn read_stream_from_version() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("user-1");
        store
            .append(
                &stream,
                vec![test_event("E1"), test_event("E2"), test_event("E3")],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        use futures_util::TryStreamExt;
        let from_v2: Vec<Event> = store
            .read_stream(&stream, Some(Version::new(2)))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(from_v2.len(), 2);
        assert_eq!(from_v2[0].version, Version::new(2));
        assert_eq!(from_v2[1].version, Version::new(3));
    }

    #[tokio::test]
    async fn read_stream_is_a_snapshot() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("user-1");
        store
            .append(&stream, vec![test_event("E1")], AppendOptions::new())
            .await
            .unwrap();

        let snapshot = store.read_stream(&stream, None).await.unwrap();
        store
            .append(&stream, vec![test_event("E2")], AppendOptions::new())
            .await
            .unwrap();

        use futures_util::TryStreamExt;
        let events: Vec<Event> = snapshot.try_collect().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(store.read_stream_to_vec(&stream).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn read_by_correlation_spans_streams() {
        let store = InMemoryEventStore::new();
        let correlation_id = CorrelationId::new();

        store
            .append(
                &StreamId::from("user-1"),
                vec![test_event("UserCreated").with_correlation_id(correlation_id)],
                AppendOptions::new(),
            )
            .await
            .unwrap();
        store
            .append(
                &StreamId::from("workspace-1"),
                vec![test_event("WorkspaceCreated").with_correlation_id(correlation_id)],
                AppendOptions::new(),
            )
            .await
            .unwrap();
        store
            .append(
                &StreamId::from("user-2"),
                vec![test_event("UserCreated")],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        let events = store
            .read_by_correlation_to_vec(correlation_id)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "UserCreated");
        assert_eq!(events[1].event_type, "WorkspaceCreated");
    }

    #[tokio::test]
    async fn query_events_with_filters() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("user-1");
        store
            .append(
                &stream,
                vec![test_event("E1"), test_event("E2"), test_event("E3")],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        let query = EventQuery::for_stream(stream)
            .from_version(Version::new(2))
            .to_version(Version::new(2));

        let results = store.query_events(query).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].version, Version::new(2));
    }

    #[tokio::test]
    async fn transaction_commit_applies_events_and_rows_together() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("user-1");

        let mut tx = store.begin().await.unwrap();
        store
            .append_in(&mut tx, &stream, vec![test_event("UserCreated")], AppendOptions::expect_new())
            .await
            .unwrap();
        tx.put_row("users", "1", serde_json::json!({"name": "alice"}));

        assert_eq!(store.event_count().await, 0);
        assert!(store.row("users", "1").await.is_none());

        store.commit(tx).await.unwrap();

        assert_eq!(store.event_count().await, 1);
        assert_eq!(
            store.row("users", "1").await,
            Some(serde_json::json!({"name": "alice"}))
        );
    }

    #[tokio::test]
    async fn transaction_rollback_discards_everything() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("user-1");

        let mut tx = store.begin().await.unwrap();
        store
            .append_in(&mut tx, &stream, vec![test_event("UserCreated")], AppendOptions::new())
            .await
            .unwrap();
        tx.put_row("users", "1", serde_json::json!({}));
        store.rollback(tx).await.unwrap();

        assert_eq!(store.event_count().await, 0);
        assert!(store.rows("users").await.is_empty());
    }

    #[tokio::test]
    async fn transaction_sees_its_own_appends() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("user-1");

        let mut tx = store.begin().await.unwrap();
        store
            .append_in(&mut tx, &stream, vec![test_event("E1")], AppendOptions::expect_new())
            .await
            .unwrap();
        let second = store
            .append_in(
                &mut tx,
                &stream,
                vec![test_event("E2")],
                AppendOptions::expect_version(Version::first()),
            )
            .await
            .unwrap();
        assert_eq!(second[0].version, Version::new(2));

        store.commit(tx).await.unwrap();
        assert_eq!(
            store.stream_version(&stream).await.unwrap(),
            Some(Version::new(2))
        );
    }

    #[tokio::test]
    async fn commit_detects_interleaved_append() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("user-1");

        let mut tx = store.begin().await.unwrap();
        store
            .append_in(&mut tx, &stream, vec![test_event("E1")], AppendOptions::expect_new())
            .await
            .unwrap();

        // Another writer wins the race.
        store
            .append(&stream, vec![test_event("E1")], AppendOptions::expect_new())
            .await
            .unwrap();

        let result = store.commit(tx).await;
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
        assert_eq!(store.event_count().await, 1);
    }

    const WRITERS: usize = 16;

    /// Seeds `stream` with two events so racing writers expect version 2.
    async fn seeded_store(stream: &StreamId) -> InMemoryEventStore {
        let store = InMemoryEventStore::new();
        store
            .append(
                stream,
                vec![test_event("E1"), test_event("E2")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();
        store
    }

    async fn assert_gapless(store: &InMemoryEventStore, stream: &StreamId, len: i64) {
        let versions: Vec<i64> = store
            .read_stream_to_vec(stream)
            .await
            .unwrap()
            .iter()
            .map(|e| e.version.as_i64())
            .collect();
        assert_eq!(versions, (1..=len).collect::<Vec<_>>());
        assert_eq!(store.stream_version(stream).await.unwrap(), Some(Version::new(len)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_appends_have_single_winner() {
        let stream = StreamId::from("user-1");
        let store = seeded_store(&stream).await;

        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let store = store.clone();
                let stream = stream.clone();
                tokio::spawn(async move {
                    store
                        .append(
                            &stream,
                            vec![test_event(&format!("W{i}a")), test_event(&format!("W{i}b"))],
                            AppendOptions::expect_version(Version::new(2)),
                        )
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(stored) => {
                    winners += 1;
                    assert_eq!(stored[0].version, Version::new(3));
                    assert_eq!(stored[1].version, Version::new(4));
                }
                Err(err) => assert!(err.is_conflict(), "unexpected error: {err}"),
            }
        }
        assert_eq!(winners, 1);
        assert_gapless(&store, &stream, 4).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_transactions_have_single_winner() {
        let stream = StreamId::from("user-1");
        let store = seeded_store(&stream).await;

        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let store = store.clone();
                let stream = stream.clone();
                tokio::spawn(async move {
                    let mut tx = store.begin().await?;
                    tx.put_row("writers", "winner", serde_json::json!({ "writer": i }));
                    store
                        .append_in(
                            &mut tx,
                            &stream,
                            vec![test_event(&format!("W{i}a")), test_event(&format!("W{i}b"))],
                            AppendOptions::expect_version(Version::new(2)),
                        )
                        .await?;
                    tokio::task::yield_now().await;
                    store.commit(tx).await?;
                    Ok::<_, EventStoreError>(i)
                })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(writer) => winners.push(writer),
                Err(err) => assert!(err.is_conflict(), "unexpected error: {err}"),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_gapless(&store, &stream, 4).await;

        // Only the winner's row landed, alongside its events.
        let events = store.read_stream_to_vec(&stream).await.unwrap();
        assert_eq!(events[2].event_type, format!("W{}a", winners[0]));
        assert_eq!(
            store.row("writers", "winner").await,
            Some(serde_json::json!({ "writer": winners[0] }))
        );
    }

    #[tokio::test]
    async fn fail_on_commit_rejects_transaction() {
        let store = InMemoryEventStore::new();
        store.set_fail_on_commit(true);

        let mut tx = store.begin().await.unwrap();
        tx.put_row("users", "1", serde_json::json!({}));
        assert!(store.commit(tx).await.is_err());
        assert!(store.row("users", "1").await.is_none());
    }
}

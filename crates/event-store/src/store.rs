use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::TryStreamExt;

use crate::{
    CorrelationId, Event, EventQuery, EventStoreError, NewEvent, Result, StreamId, Version,
};

/// Options for appending events to a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOptions {
    /// Expected version of the stream for optimistic concurrency control.
    /// If None, no version check is performed (use with caution).
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the stream to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Creates options expecting the stream to be empty.
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }

    /// Checks the expected version against the stream's current version.
    pub fn check(&self, stream_id: &StreamId, current: Version) -> Result<()> {
        match self.expected_version {
            Some(expected) if expected != current => Err(EventStoreError::ConcurrencyConflict {
                stream_id: stream_id.clone(),
                expected,
                actual: current,
            }),
            _ => Ok(()),
        }
    }
}

/// A lazy, ordered stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Number of events fetched per page by paging readers.
pub const READ_PAGE_SIZE: i64 = 256;

/// Core trait for event store implementations.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events to a stream.
    ///
    /// Events are appended atomically - either all succeed or none do.
    /// If `options.expected_version` is set, the operation fails with
    /// `ConcurrencyConflict` if the stream's current version doesn't match.
    ///
    /// Returns the stored events; the first gets `current_version + 1`.
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<NewEvent>,
        options: AppendOptions,
    ) -> Result<Vec<Event>>;

    /// Reads a stream in version order, optionally starting at `from_version`.
    ///
    /// The returned stream is lazy and bounded by the stream's version at the
    /// time of the call; events appended afterwards require a new read.
    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from_version: Option<Version>,
    ) -> Result<EventStream>;

    /// Reads every event carrying the correlation ID, across all streams.
    ///
    /// Events are returned in recording order.
    async fn read_by_correlation(&self, correlation_id: CorrelationId) -> Result<EventStream>;

    /// Gets the current version of a stream.
    ///
    /// Returns None if the stream has no events.
    async fn stream_version(&self, stream_id: &StreamId) -> Result<Option<Version>>;

    /// Retrieves events matching a query.
    async fn query_events(&self, query: EventQuery) -> Result<Vec<Event>>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Appends a single event to a stream.
    async fn append_event(
        &self,
        stream_id: &StreamId,
        event: NewEvent,
        options: AppendOptions,
    ) -> Result<Event> {
        let mut stored = self.append(stream_id, vec![event], options).await?;
        stored
            .pop()
            .ok_or_else(|| EventStoreError::InvalidAppend("append returned no events".into()))
    }

    /// Checks if a stream has any events.
    async fn stream_exists(&self, stream_id: &StreamId) -> Result<bool> {
        Ok(self.stream_version(stream_id).await?.is_some())
    }

    /// Reads a whole stream into memory.
    async fn read_stream_to_vec(&self, stream_id: &StreamId) -> Result<Vec<Event>> {
        self.read_stream(stream_id, None).await?.try_collect().await
    }

    /// Reads all correlated events into memory.
    async fn read_by_correlation_to_vec(&self, correlation_id: CorrelationId) -> Result<Vec<Event>> {
        self.read_by_correlation(correlation_id)
            .await?
            .try_collect()
            .await
    }
}

// Blanket implementation for all EventStore implementations
impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// An event store whose appends can join a caller-controlled transaction.
///
/// The unit of work uses this to persist repository writes and events in
/// one atomic boundary. Repositories that share the transaction receive
/// `&mut Self::Tx` and write through it.
#[async_trait]
pub trait TransactionalEventStore: EventStore + Clone + 'static {
    /// The backend transaction handle.
    type Tx: Send + 'static;

    /// Opens a new transaction.
    async fn begin(&self) -> Result<Self::Tx>;

    /// Appends events inside the transaction.
    ///
    /// The version check uses the stream version visible to the transaction,
    /// including events already appended through it.
    async fn append_in(
        &self,
        tx: &mut Self::Tx,
        stream_id: &StreamId,
        events: Vec<NewEvent>,
        options: AppendOptions,
    ) -> Result<Vec<Event>>;

    /// Commits the transaction, making every write visible at once.
    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    /// Rolls the transaction back, discarding every write.
    async fn rollback(&self, tx: Self::Tx) -> Result<()>;
}

/// Validates an append batch before it reaches storage.
pub fn validate_append(stream_id: &StreamId, events: &[NewEvent]) -> Result<()> {
    if stream_id.as_str().is_empty() {
        return Err(EventStoreError::InvalidAppend(
            "Stream ID must not be empty".to_string(),
        ));
    }
    if events.is_empty() {
        return Err(EventStoreError::InvalidAppend(
            "Cannot append empty event list".to_string(),
        ));
    }
    if let Some(event) = events.iter().find(|e| e.event_type.is_empty()) {
        return Err(EventStoreError::InvalidAppend(format!(
            "Event type must not be empty (payload: {})",
            event.payload
        )));
    }
    Ok(())
}

/// Assigns consecutive versions to a batch starting after `current`.
pub fn stamp_events(stream_id: &StreamId, current: Version, events: Vec<NewEvent>) -> Vec<Event> {
    let mut version = current;
    events
        .into_iter()
        .map(|event| {
            version = version.next();
            event.into_event(stream_id.clone(), version)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_accepts_matching_version() {
        let stream = StreamId::from("user-1");
        assert!(
            AppendOptions::expect_version(Version::new(2))
                .check(&stream, Version::new(2))
                .is_ok()
        );
        assert!(AppendOptions::new().check(&stream, Version::new(9)).is_ok());
    }

    #[test]
    fn check_rejects_stale_version() {
        let stream = StreamId::from("user-1");
        let err = AppendOptions::expect_new()
            .check(&stream, Version::new(1))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn validate_rejects_empty_batch() {
        let result = validate_append(&StreamId::from("user-1"), &[]);
        assert!(matches!(result, Err(EventStoreError::InvalidAppend(_))));
    }

    #[test]
    fn stamp_events_assigns_consecutive_versions() {
        let stream = StreamId::from("user-1");
        let events = vec![
            NewEvent::new("A", serde_json::json!({})),
            NewEvent::new("B", serde_json::json!({})),
        ];
        let stamped = stamp_events(&stream, Version::new(4), events);
        assert_eq!(stamped[0].version, Version::new(5));
        assert_eq!(stamped[1].version, Version::new(6));
    }
}

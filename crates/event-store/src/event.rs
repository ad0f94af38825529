use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CorrelationId, EventStoreError, StreamId};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version number of a stream, used for optimistic concurrency control.
///
/// An empty stream is at version 0; the first event gets version 1 and each
/// subsequent event increments by exactly one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the version of an empty stream (0).
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the version of the first event (1).
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// An immutable, persisted event.
///
/// Events are never updated or deleted; corrections are modelled as new
/// compensating events on the same stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event.
    pub id: EventId,

    /// The stream (aggregate) this event belongs to.
    pub stream_id: StreamId,

    /// Position of the event within its stream.
    pub version: Version,

    /// The type of the event (e.g., "UserCreated", "StepCompleted").
    pub event_type: String,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// Additional metadata about the event.
    pub metadata: HashMap<String, serde_json::Value>,

    /// Causal chain this event belongs to, if any.
    pub correlation_id: Option<CorrelationId>,

    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Deserializes the payload into a concrete type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// An event that has not been assigned a stream position yet.
///
/// The store stamps the stream, version, id and timestamp on append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, serde_json::Value>,
    pub correlation_id: Option<CorrelationId>,
}

impl NewEvent {
    /// Creates an event with a raw JSON payload.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            metadata: HashMap::new(),
            correlation_id: None,
        }
    }

    /// Creates a new event builder.
    pub fn builder() -> NewEventBuilder {
        NewEventBuilder::default()
    }

    /// Sets the correlation ID.
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Stamps the event with its stream position.
    pub fn into_event(self, stream_id: StreamId, version: Version) -> Event {
        Event {
            id: EventId::new(),
            stream_id,
            version,
            event_type: self.event_type,
            payload: self.payload,
            metadata: self.metadata,
            correlation_id: self.correlation_id,
            created_at: Utc::now(),
        }
    }
}

/// Builder for constructing new events from typed payloads.
#[derive(Debug, Default)]
pub struct NewEventBuilder {
    event_type: Option<String>,
    payload: Option<serde_json::Value>,
    metadata: HashMap<String, serde_json::Value>,
    correlation_id: Option<CorrelationId>,
}

impl NewEventBuilder {
    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Sets the correlation ID.
    pub fn correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Builds the event, failing if the type or payload is missing.
    pub fn build(self) -> Result<NewEvent, EventStoreError> {
        let event_type = self
            .event_type
            .ok_or_else(|| EventStoreError::InvalidAppend("event_type is required".into()))?;
        let payload = self
            .payload
            .ok_or_else(|| EventStoreError::InvalidAppend("payload is required".into()))?;

        Ok(NewEvent {
            event_type,
            payload,
            metadata: self.metadata,
            correlation_id: self.correlation_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_new_creates_unique_ids() {
        let id1 = EventId::new();
        let id2 = EventId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn version_ordering() {
        let v1 = Version::new(1);
        let v2 = Version::new(2);
        assert!(v1 < v2);
        assert_eq!(v1.next(), v2);
    }

    #[test]
    fn version_initial_and_first() {
        assert_eq!(Version::initial().as_i64(), 0);
        assert_eq!(Version::first().as_i64(), 1);
        assert_eq!(Version::initial().next(), Version::first());
    }

    #[test]
    fn new_event_builder() {
        let correlation_id = CorrelationId::new();
        let payload = serde_json::json!({"user": "alice"});

        let event = NewEvent::builder()
            .event_type("UserCreated")
            .payload_raw(payload.clone())
            .metadata("source", serde_json::json!("signup"))
            .correlation_id(correlation_id)
            .build()
            .unwrap();

        assert_eq!(event.event_type, "UserCreated");
        assert_eq!(event.payload, payload);
        assert_eq!(event.correlation_id, Some(correlation_id));
        assert_eq!(
            event.metadata.get("source"),
            Some(&serde_json::json!("signup"))
        );
    }

    #[test]
    fn new_event_builder_rejects_missing_fields() {
        let result = NewEvent::builder().event_type("Orphan").build();
        assert!(matches!(result, Err(EventStoreError::InvalidAppend(_))));
    }

    #[test]
    fn into_event_stamps_stream_position() {
        let stream = StreamId::from("user-1");
        let event = NewEvent::new("UserCreated", serde_json::json!({}))
            .into_event(stream.clone(), Version::first());

        assert_eq!(event.stream_id, stream);
        assert_eq!(event.version, Version::first());
        assert!(event.correlation_id.is_none());
    }
}

use chrono::{DateTime, Utc};

use crate::{CorrelationId, Event, StreamId, Version};

/// Builder for constructing event queries.
///
/// Allows filtering events by stream, event type, correlation, version
/// range and time range.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Filter by stream.
    pub stream_id: Option<StreamId>,

    /// Filter by event types (any of these types).
    pub event_types: Option<Vec<String>>,

    /// Filter by correlation ID.
    pub correlation_id: Option<CorrelationId>,

    /// Filter by minimum version (inclusive).
    pub from_version: Option<Version>,

    /// Filter by maximum version (inclusive).
    pub to_version: Option<Version>,

    /// Filter by events recorded at or after this timestamp.
    pub from_timestamp: Option<DateTime<Utc>>,

    /// Filter by events recorded at or before this timestamp.
    pub to_timestamp: Option<DateTime<Utc>>,

    /// Maximum number of events to return.
    pub limit: Option<usize>,

    /// Number of events to skip.
    pub offset: Option<usize>,
}

impl EventQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for a specific stream.
    pub fn for_stream(stream_id: StreamId) -> Self {
        Self {
            stream_id: Some(stream_id),
            ..Default::default()
        }
    }

    /// Creates a query for events sharing a correlation ID.
    pub fn for_correlation(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Default::default()
        }
    }

    /// Filters by stream.
    pub fn stream_id(mut self, stream_id: StreamId) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    /// Filters by event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types = Some(vec![event_type.into()]);
        self
    }

    /// Filters by multiple event types (any of these).
    pub fn event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// Filters by correlation ID.
    pub fn correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Filters to events starting from this version (inclusive).
    pub fn from_version(mut self, version: Version) -> Self {
        self.from_version = Some(version);
        self
    }

    /// Filters to events up to this version (inclusive).
    pub fn to_version(mut self, version: Version) -> Self {
        self.to_version = Some(version);
        self
    }

    /// Filters to events recorded at or after this timestamp.
    pub fn from_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.from_timestamp = Some(timestamp);
        self
    }

    /// Filters to events recorded at or before this timestamp.
    pub fn to_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.to_timestamp = Some(timestamp);
        self
    }

    /// Limits the number of events returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips this many events before returning results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if the event satisfies every filter (limit/offset excluded).
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref stream_id) = self.stream_id
            && &event.stream_id != stream_id
        {
            return false;
        }
        if let Some(ref types) = self.event_types
            && !types.contains(&event.event_type)
        {
            return false;
        }
        if let Some(correlation_id) = self.correlation_id
            && event.correlation_id != Some(correlation_id)
        {
            return false;
        }
        if let Some(from) = self.from_version
            && event.version < from
        {
            return false;
        }
        if let Some(to) = self.to_version
            && event.version > to
        {
            return false;
        }
        if let Some(from) = self.from_timestamp
            && event.created_at < from
        {
            return false;
        }
        if let Some(to) = self.to_timestamp
            && event.created_at > to
        {
            return false;
        }
        true
    }
}

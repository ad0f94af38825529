use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a saga instance.
    SagaId
);

uuid_id!(
    /// Identifier shared by every event and saga that belongs to one causal chain.
    ///
    /// Used for cross-stream tracing in the event store.
    CorrelationId
);

uuid_id!(
    /// Identifier of a single unit-of-work scope (root or nested).
    TransactionId
);

/// Identifier of an event stream.
///
/// A stream holds the ordered history of one aggregate, conventionally
/// named `<category>-<id>` (for example `saga-<uuid>` or `user-42`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Creates a stream ID from a raw string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Creates a stream ID for an aggregate of the given category.
    pub fn for_aggregate(category: &str, id: impl std::fmt::Display) -> Self {
        Self(format!("{category}-{id}"))
    }

    /// Returns the stream that records a saga's lifecycle events.
    pub fn for_saga(saga_id: SagaId) -> Self {
        Self::for_aggregate("saga", saga_id)
    }

    /// Returns the stream ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of the tenant that owns a saga.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant ID.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saga_id_new_creates_unique_ids() {
        let id1 = SagaId::new();
        let id2 = SagaId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn correlation_id_from_uuid_preserves_value() {
        let uuid = Uuid::new_v4();
        let id = CorrelationId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), uuid);
    }

    #[test]
    fn saga_id_parses_from_string() {
        let id = SagaId::new();
        let parsed: SagaId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<SagaId>().is_err());
    }

    #[test]
    fn saga_stream_id_is_prefixed() {
        let saga_id = SagaId::new();
        let stream = StreamId::for_saga(saga_id);
        assert_eq!(stream.as_str(), format!("saga-{saga_id}"));
    }

    #[test]
    fn stream_id_serializes_as_plain_string() {
        let stream = StreamId::for_aggregate("user", 42);
        let json = serde_json::to_string(&stream).unwrap();
        assert_eq!(json, "\"user-42\"");
    }
}

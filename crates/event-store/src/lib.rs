//! Append-only, versioned event store.
//!
//! Every aggregate owns one stream; events inside a stream are strictly
//! ordered by [`Version`] and `(stream_id, version)` is unique. Appends use
//! optimistic concurrency: a stale expected version fails with
//! [`EventStoreError::ConcurrencyConflict`].

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use common::{CorrelationId, StreamId};
pub use error::{EventStoreError, Result};
pub use event::{Event, EventId, NewEvent, NewEventBuilder, Version};
pub use memory::{InMemoryEventStore, InMemoryTransaction};
pub use postgres::{PgTransaction, PostgresEventStore};
pub use query::EventQuery;
pub use store::{AppendOptions, EventStore, EventStoreExt, EventStream, TransactionalEventStore};

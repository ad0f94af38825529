//! Shared identifier types used across the orchestrator crates.

pub mod types;

pub use types::{CorrelationId, SagaId, StreamId, TenantId, TransactionId};

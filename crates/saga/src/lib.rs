//! Saga orchestration.
//!
//! A saga is a sequence of local transactions, each paired with a
//! compensating action. The [`SagaOrchestrator`] runs the steps of a
//! registered [`SagaDefinition`] in order, retrying transient failures with
//! exponential backoff. When a step fails for good, or the saga's deadline
//! passes, the completed steps are compensated in reverse order.
//!
//! ```text
//! PENDING ──► RUNNING ──┬──► COMPLETED
//!                       └──► COMPENSATING ──┬──► COMPENSATED
//!                                           └──► FAILED
//! ```
//!
//! Every attempt runs inside a unit of work, so a step's writes and the
//! saga's new state commit together or not at all.

pub mod definition;
pub mod error;
pub mod events;
pub mod instance;
pub mod metric;
pub mod orchestrator;
pub mod postgres;
pub mod repository;
pub mod retry;
pub mod status;
pub mod step;

pub use definition::{SagaDefinition, SagaRegistry};
pub use error::{Result, SagaError};
pub use events::SagaEvent;
pub use instance::{FailureKind, SagaFailure, SagaInstance, StepRecord, StepStatus};
pub use metric::{
    MetricSink, SAGA_DURATION_SECONDS, SAGA_RETRY_COUNT, STEP_DURATION_SECONDS, SagaMetric,
};
pub use orchestrator::{OrchestratorConfig, SagaOrchestrator, SagaRequest};
pub use postgres::PostgresSagaRepository;
pub use repository::{InMemorySagaRepository, SagaFilter, SagaRepository};
pub use retry::RetryPolicy;
pub use status::{SagaPattern, SagaStatus};
pub use step::{FnStep, SagaStep, StepContext, StepError};

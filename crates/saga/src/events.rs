//! Saga lifecycle events.
//!
//! Every state change of a saga instance is recorded on the saga's own
//! stream (`saga-<id>`) in the same transaction as the instance update.

use chrono::{DateTime, Utc};
use common::{CorrelationId, SagaId};
use event_store::NewEvent;
use serde::{Deserialize, Serialize};

/// Events that can occur during saga execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// Saga instance created in PENDING.
    SagaCreated {
        saga_id: SagaId,
        saga_type: String,
        total_steps: usize,
        input: serde_json::Value,
        created_at: DateTime<Utc>,
    },

    /// Saga moved to RUNNING.
    SagaStarted {
        saga_id: SagaId,
        started_at: DateTime<Utc>,
    },

    /// A step completed successfully.
    StepCompleted {
        saga_id: SagaId,
        step_index: usize,
        step_name: String,
        attempt: u32,
        result: serde_json::Value,
    },

    /// A step attempt failed.
    StepFailed {
        saga_id: SagaId,
        step_index: usize,
        step_name: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },

    /// Compensation of completed steps began.
    CompensationStarted {
        saga_id: SagaId,
        reason: String,
        steps_to_compensate: usize,
    },

    /// A completed step was compensated.
    StepCompensated {
        saga_id: SagaId,
        step_index: usize,
        step_name: String,
    },

    /// A compensation failed; compensation stops here.
    CompensationFailed {
        saga_id: SagaId,
        step_index: usize,
        step_name: String,
        error: String,
    },

    /// Every step completed.
    SagaCompleted {
        saga_id: SagaId,
        completed_at: DateTime<Utc>,
    },

    /// Every completed step was compensated.
    SagaCompensated {
        saga_id: SagaId,
        completed_at: DateTime<Utc>,
    },

    /// Compensation failed and the saga needs manual intervention.
    SagaFailed {
        saga_id: SagaId,
        reason: String,
        completed_at: DateTime<Utc>,
    },

    /// The saga's deadline passed.
    SagaTimedOut {
        saga_id: SagaId,
        timeout_seconds: u64,
    },
}

impl SagaEvent {
    /// Returns the event type name stored in the event store.
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaCreated { .. } => "SagaCreated",
            SagaEvent::SagaStarted { .. } => "SagaStarted",
            SagaEvent::StepCompleted { .. } => "StepCompleted",
            SagaEvent::StepFailed { .. } => "StepFailed",
            SagaEvent::CompensationStarted { .. } => "CompensationStarted",
            SagaEvent::StepCompensated { .. } => "StepCompensated",
            SagaEvent::CompensationFailed { .. } => "CompensationFailed",
            SagaEvent::SagaCompleted { .. } => "SagaCompleted",
            SagaEvent::SagaCompensated { .. } => "SagaCompensated",
            SagaEvent::SagaFailed { .. } => "SagaFailed",
            SagaEvent::SagaTimedOut { .. } => "SagaTimedOut",
        }
    }

    /// Returns the saga the event belongs to.
    pub fn saga_id(&self) -> SagaId {
        match self {
            SagaEvent::SagaCreated { saga_id, .. }
            | SagaEvent::SagaStarted { saga_id, .. }
            | SagaEvent::StepCompleted { saga_id, .. }
            | SagaEvent::StepFailed { saga_id, .. }
            | SagaEvent::CompensationStarted { saga_id, .. }
            | SagaEvent::StepCompensated { saga_id, .. }
            | SagaEvent::CompensationFailed { saga_id, .. }
            | SagaEvent::SagaCompleted { saga_id, .. }
            | SagaEvent::SagaCompensated { saga_id, .. }
            | SagaEvent::SagaFailed { saga_id, .. }
            | SagaEvent::SagaTimedOut { saga_id, .. } => *saga_id,
        }
    }

    /// Converts the event for appending to the saga stream.
    pub fn to_new_event(&self, correlation_id: CorrelationId) -> Result<NewEvent, serde_json::Error> {
        Ok(NewEvent::new(self.event_type(), serde_json::to_value(self)?)
            .with_correlation_id(correlation_id))
    }
}

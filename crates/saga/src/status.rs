//! Saga state machine.

use serde::{Deserialize, Serialize};

use crate::error::SagaError;

/// The status of a saga instance.
///
/// State transitions:
/// ```text
/// PENDING ──► RUNNING ──┬──► COMPLETED
///    │                  └──► COMPENSATING ──┬──► COMPENSATED
///    └────────────────────────►             └──► FAILED
/// ```
///
/// `PENDING` moves straight to `COMPENSATING` only when it times out before
/// its first step ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Created and persisted, no step has run yet.
    #[default]
    Pending,

    /// Steps are being executed.
    Running,

    /// Every step completed (terminal).
    Completed,

    /// A step failed or the saga timed out; completed steps are being undone.
    Compensating,

    /// Every completed step was compensated (terminal).
    Compensated,

    /// A compensation failed; needs operator intervention (terminal).
    Failed,
}

impl SagaStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [SagaStatus; 6] = [
        SagaStatus::Pending,
        SagaStatus::Running,
        SagaStatus::Completed,
        SagaStatus::Compensating,
        SagaStatus::Compensated,
        SagaStatus::Failed,
    ];

    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns true while the saga still needs driving.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (*self, next),
            (Pending, Running)
                | (Pending, Compensating)
                | (Running, Completed)
                | (Running, Compensating)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }

    /// Returns the status name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "PENDING",
            SagaStatus::Running => "RUNNING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Compensated => "COMPENSATED",
            SagaStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| SagaError::Validation(format!("unknown saga status '{s}'")))
    }
}

/// How a saga's steps are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SagaPattern {
    /// The orchestrator runs every step in order.
    #[default]
    Orchestration,

    /// Participants react to each other's events; the orchestrator only
    /// tracks the instance.
    Choreography,

    /// Orchestrated steps that may also publish events for participants.
    Hybrid,
}

impl SagaPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaPattern::Orchestration => "orchestration",
            SagaPattern::Choreography => "choreography",
            SagaPattern::Hybrid => "hybrid",
        }
    }

    /// Returns true if the orchestrator drives the steps itself.
    pub fn is_orchestrated(&self) -> bool {
        !matches!(self, SagaPattern::Choreography)
    }
}

impl std::fmt::Display for SagaPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SagaPattern {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestration" => Ok(SagaPattern::Orchestration),
            "choreography" => Ok(SagaPattern::Choreography),
            "hybrid" => Ok(SagaPattern::Hybrid),
            other => Err(SagaError::Validation(format!("unknown saga pattern '{other}'"))),
        }
    }
}

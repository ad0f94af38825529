//! Saga instance state.

use chrono::{DateTime, TimeDelta, Utc};
use common::{CorrelationId, SagaId, TenantId};
use serde::{Deserialize, Serialize};
use unit_of_work::Entity;

use crate::error::{Result, SagaError};
use crate::status::{SagaPattern, SagaStatus};

/// Outcome recorded for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Compensated,
    CompensationFailed,
}

/// Execution record of one saga step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
    /// Attempts made, the successful one included.
    pub attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub compensated_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// Returns how long the forward execution took.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }
}

/// What drove a saga off its happy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    StepFailed,
    Timeout,
    CompensationFailed,
}

/// Failure details kept for operator inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailure {
    pub kind: FailureKind,
    pub step_index: Option<usize>,
    pub step_name: Option<String>,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl SagaFailure {
    pub fn new(
        kind: FailureKind,
        step_index: Option<usize>,
        step_name: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            step_index,
            step_name,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// A persisted saga instance.
///
/// Status changes go through [`transition`](Self::transition) so that the
/// state machine cannot be bypassed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub(crate) id: SagaId,
    pub(crate) saga_type: String,
    pub(crate) status: SagaStatus,
    pub(crate) current_step: usize,
    pub(crate) total_steps: usize,
    pub(crate) input_data: serde_json::Value,
    pub(crate) output_data: Option<serde_json::Value>,
    pub(crate) steps_data: Vec<StepRecord>,
    pub(crate) metadata: serde_json::Value,
    pub(crate) pattern: SagaPattern,
    pub(crate) retry_count: u32,
    pub(crate) max_retries: u32,
    pub(crate) timeout_seconds: Option<u64>,
    pub(crate) correlation_id: CorrelationId,
    pub(crate) tenant_id: Option<TenantId>,
    pub(crate) failure: Option<SagaFailure>,
    pub(crate) compensation_failure: Option<SagaFailure>,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl Entity for SagaInstance {
    const ENTITY_TYPE: &'static str = "saga_instances";

    fn entity_id(&self) -> String {
        self.id.to_string()
    }
}

impl SagaInstance {
    /// Creates a PENDING instance.
    pub fn new(
        saga_type: impl Into<String>,
        input_data: serde_json::Value,
        total_steps: usize,
        pattern: SagaPattern,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SagaId::new(),
            saga_type: saga_type.into(),
            status: SagaStatus::Pending,
            current_step: 0,
            total_steps,
            input_data,
            output_data: None,
            steps_data: Vec::new(),
            metadata: serde_json::json!({}),
            pattern,
            retry_count: 0,
            max_retries: 0,
            timeout_seconds: None,
            correlation_id: CorrelationId::new(),
            tenant_id: None,
            failure: None,
            compensation_failure: None,
            started_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: Option<u64>) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: Option<TenantId>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// Query methods
impl SagaInstance {
    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    /// Index of the next step to run; equals the number of completed steps.
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn input_data(&self) -> &serde_json::Value {
        &self.input_data
    }

    pub fn output_data(&self) -> Option<&serde_json::Value> {
        self.output_data.as_ref()
    }

    /// Step records in execution order.
    pub fn steps_data(&self) -> &[StepRecord] {
        &self.steps_data
    }

    pub fn metadata(&self) -> &serde_json::Value {
        &self.metadata
    }

    pub fn pattern(&self) -> SagaPattern {
        self.pattern
    }

    /// Number of retries scheduled across all steps.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn timeout_seconds(&self) -> Option<u64> {
        self.timeout_seconds
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    /// The failure that triggered compensation, if any.
    pub fn failure(&self) -> Option<&SagaFailure> {
        self.failure.as_ref()
    }

    /// The compensation failure that left the saga FAILED, if any.
    pub fn compensation_failure(&self) -> Option<&SagaFailure> {
        self.compensation_failure.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns when the saga times out, if it has a timeout.
    ///
    /// A timeout too large to represent as a timestamp yields `None`.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.timeout_seconds?).ok()?;
        self.started_at.checked_add_signed(TimeDelta::try_seconds(secs)?)
    }

    /// Returns true if the saga is still active past its deadline.
    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active() && self.deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Returns the wall-clock duration of a finished saga.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }

    /// Records of completed steps not yet compensated, latest first.
    pub fn steps_to_compensate(&self) -> Vec<StepRecord> {
        self.steps_data
            .iter()
            .rev()
            .filter(|record| record.status == StepStatus::Completed)
            .cloned()
            .collect()
    }
}

// State changes
impl SagaInstance {
    /// Moves to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: SagaStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                saga_id: self.id,
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub(crate) fn record_step_completed(&mut self, record: StepRecord) {
        self.steps_data.push(record);
        self.current_step += 1;
        self.updated_at = Utc::now();
    }

    pub(crate) fn record_step_failed(&mut self, record: StepRecord, failure: SagaFailure) {
        self.steps_data.push(record);
        self.failure = Some(failure);
        self.updated_at = Utc::now();
    }

    pub(crate) fn record_retry(&mut self) {
        self.retry_count += 1;
        self.updated_at = Utc::now();
    }

    pub(crate) fn set_failure(&mut self, failure: SagaFailure) {
        self.failure = Some(failure);
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_step_compensated(&mut self, index: usize) {
        let now = Utc::now();
        if let Some(record) = self
            .steps_data
            .iter_mut()
            .rev()
            .find(|r| r.index == index && r.status == StepStatus::Completed)
        {
            record.status = StepStatus::Compensated;
            record.compensated_at = Some(now);
        }
        self.updated_at = now;
    }

    pub(crate) fn mark_compensation_failed(&mut self, index: usize, failure: SagaFailure) {
        if let Some(record) = self
            .steps_data
            .iter_mut()
            .rev()
            .find(|r| r.index == index && r.status == StepStatus::Completed)
        {
            record.status = StepStatus::CompensationFailed;
            record.error = Some(failure.message.clone());
        }
        self.compensation_failure = Some(failure);
        self.updated_at = Utc::now();
    }

    pub(crate) fn set_output(&mut self, output: serde_json::Value) {
        self.output_data = Some(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_record(index: usize, name: &str) -> StepRecord {
        StepRecord {
            index,
            name: name.to_string(),
            status: StepStatus::Completed,
            attempts: 1,
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            compensated_at: None,
        }
    }

    #[test]
    fn test_new_instance_is_pending() {
        let saga = SagaInstance::new("user_signup", serde_json::json!({}), 2, SagaPattern::Orchestration);
        assert_eq!(saga.status(), SagaStatus::Pending);
        assert_eq!(saga.current_step(), 0);
        assert_eq!(saga.retry_count(), 0);
        assert!(saga.completed_at().is_none());
    }

    #[test]
    fn test_transition_enforces_state_machine() {
        let mut saga = SagaInstance::new("user_signup", serde_json::json!({}), 2, SagaPattern::Orchestration);
        saga.transition(SagaStatus::Running).unwrap();

        let err = saga.transition(SagaStatus::Compensated).unwrap_err();
        assert!(matches!(
            err,
            SagaError::InvalidTransition {
                from: SagaStatus::Running,
                to: SagaStatus::Compensated,
                ..
            }
        ));

        saga.transition(SagaStatus::Completed).unwrap();
        assert!(saga.completed_at().is_some());
    }

    #[test]
    fn test_steps_to_compensate_are_reversed() {
        let mut saga = SagaInstance::new("user_signup", serde_json::json!({}), 3, SagaPattern::Orchestration);
        saga.record_step_completed(completed_record(0, "a"));
        saga.record_step_completed(completed_record(1, "b"));
        assert_eq!(saga.current_step(), 2);

        let names: Vec<_> = saga
            .steps_to_compensate()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["b", "a"]);

        saga.mark_step_compensated(1);
        let remaining: Vec<_> = saga.steps_to_compensate().into_iter().map(|r| r.index).collect();
        assert_eq!(remaining, vec![0]);
    }

    #[test]
    fn test_deadline_and_overdue() {
        let saga = SagaInstance::new("user_signup", serde_json::json!({}), 1, SagaPattern::Orchestration)
            .with_timeout_seconds(Some(10));
        let deadline = saga.deadline().unwrap();
        assert_eq!(deadline - saga.started_at(), chrono::Duration::seconds(10));
        assert!(!saga.is_overdue_at(saga.started_at()));
        assert!(saga.is_overdue_at(deadline));

        let no_timeout = SagaInstance::new("user_signup", serde_json::json!({}), 1, SagaPattern::Orchestration);
        assert!(no_timeout.deadline().is_none());
        assert!(!no_timeout.is_overdue_at(Utc::now()));
    }

    #[test]
    fn test_unrepresentable_deadline_is_none() {
        for secs in [u64::MAX, 1 << 60, i64::MAX as u64] {
            let saga = SagaInstance::new("user_signup", serde_json::json!({}), 1, SagaPattern::Orchestration)
                .with_timeout_seconds(Some(secs));
            assert!(saga.deadline().is_none());
            assert!(!saga.is_overdue_at(Utc::now()));
        }
    }
}

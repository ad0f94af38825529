//! Health report over saga instances.

use chrono::{DateTime, Utc};
use common::SagaId;
use saga::{SagaInstance, SagaStatus};
use serde::{Deserialize, Serialize};

/// Limits above which the system reports itself unhealthy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Active sagas past their deadline that are tolerated.
    pub max_overdue: u64,
    /// FAILED sagas awaiting an operator that are tolerated.
    pub max_failed: u64,
}

/// A FAILED saga and why it could not be compensated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedSaga {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub step_index: Option<usize>,
    pub step_name: Option<String>,
    pub message: String,
    pub failed_at: Option<DateTime<Utc>>,
}

impl FailedSaga {
    fn from_instance(saga: &SagaInstance) -> Self {
        let failure = saga.compensation_failure().or(saga.failure());
        Self {
            saga_id: saga.id(),
            saga_type: saga.saga_type().to_string(),
            step_index: failure.and_then(|f| f.step_index),
            step_name: failure.and_then(|f| f.step_name.clone()),
            message: failure
                .map(|f| f.message.clone())
                .unwrap_or_else(|| "no failure recorded".to_string()),
            failed_at: saga.completed_at(),
        }
    }
}

/// Operational health derived from saga state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub active: u64,
    /// Active sagas whose deadline has passed.
    pub overdue: Vec<SagaId>,
    /// FAILED sagas requiring operator action, oldest first.
    pub failed: Vec<FailedSaga>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Evaluates `sagas` as of `now`.
    pub fn evaluate(sagas: &[SagaInstance], thresholds: HealthThresholds, now: DateTime<Utc>) -> Self {
        let active = sagas.iter().filter(|s| s.status().is_active()).count() as u64;
        let mut overdue: Vec<SagaId> = sagas
            .iter()
            .filter(|s| s.is_overdue_at(now))
            .map(SagaInstance::id)
            .collect();
        overdue.sort();

        let mut failed: Vec<FailedSaga> = sagas
            .iter()
            .filter(|s| s.status() == SagaStatus::Failed)
            .map(FailedSaga::from_instance)
            .collect();
        failed.sort_by_key(|f| (f.failed_at, f.saga_id));

        let healthy = overdue.len() as u64 <= thresholds.max_overdue
            && failed.len() as u64 <= thresholds.max_failed;

        Self {
            healthy,
            active,
            overdue,
            failed,
            checked_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga::SagaPattern;

    fn saga() -> SagaInstance {
        SagaInstance::new("signup", serde_json::json!({}), 1, SagaPattern::Orchestration)
    }

    #[test]
    fn test_healthy_when_nothing_wrong() {
        let report = HealthReport::evaluate(&[saga()], HealthThresholds::default(), Utc::now());
        assert!(report.healthy);
        assert_eq!(report.active, 1);
        assert!(report.overdue.is_empty());
        assert!(report.failed.is_empty());
    }

    #[test]
    fn test_overdue_saga_makes_report_unhealthy() {
        let overdue = saga().with_timeout_seconds(Some(0));
        let report = HealthReport::evaluate(
            &[overdue.clone(), saga()],
            HealthThresholds::default(),
            Utc::now(),
        );
        assert!(!report.healthy);
        assert_eq!(report.overdue, vec![overdue.id()]);

        let tolerant = HealthThresholds {
            max_overdue: 1,
            ..HealthThresholds::default()
        };
        assert!(HealthReport::evaluate(&[overdue], tolerant, Utc::now()).healthy);
    }

    #[test]
    fn test_terminal_sagas_are_never_overdue() {
        let mut done = saga().with_timeout_seconds(Some(0));
        done.transition(SagaStatus::Running).unwrap();
        done.transition(SagaStatus::Completed).unwrap();
        let report = HealthReport::evaluate(&[done], HealthThresholds::default(), Utc::now());
        assert!(report.healthy);
        assert_eq!(report.active, 0);
    }

    #[test]
    fn test_failed_saga_requires_action() {
        let mut failed = saga();
        failed.transition(SagaStatus::Running).unwrap();
        failed.transition(SagaStatus::Compensating).unwrap();
        failed.transition(SagaStatus::Failed).unwrap();

        let report = HealthReport::evaluate(&[failed.clone()], HealthThresholds::default(), Utc::now());
        assert!(!report.healthy);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].saga_id, failed.id());
        assert_eq!(report.failed[0].message, "no failure recorded");
    }
}

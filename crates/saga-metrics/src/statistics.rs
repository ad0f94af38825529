//! Saga statistics derived from a set of instances.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use saga::{SagaInstance, SagaStatus};
use serde::{Deserialize, Serialize};

/// Number of sagas in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub compensating: u64,
    pub compensated: u64,
    pub failed: u64,
}

impl StatusCounts {
    fn add(&mut self, status: SagaStatus) {
        *self.slot(status) += 1;
    }

    fn slot(&mut self, status: SagaStatus) -> &mut u64 {
        match status {
            SagaStatus::Pending => &mut self.pending,
            SagaStatus::Running => &mut self.running,
            SagaStatus::Completed => &mut self.completed,
            SagaStatus::Compensating => &mut self.compensating,
            SagaStatus::Compensated => &mut self.compensated,
            SagaStatus::Failed => &mut self.failed,
        }
    }

    /// Returns the count for one status.
    pub fn get(&self, status: SagaStatus) -> u64 {
        match status {
            SagaStatus::Pending => self.pending,
            SagaStatus::Running => self.running,
            SagaStatus::Completed => self.completed,
            SagaStatus::Compensating => self.compensating,
            SagaStatus::Compensated => self.compensated,
            SagaStatus::Failed => self.failed,
        }
    }

    /// Sagas not yet in a terminal status.
    pub fn active(&self) -> u64 {
        self.pending + self.running + self.compensating
    }

    pub fn total(&self) -> u64 {
        SagaStatus::ALL.into_iter().map(|s| self.get(s)).sum()
    }
}

/// Aggregate counts over saga instances.
///
/// Computing statistics twice over the same instances with the same `now`
/// yields equal values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStatistics {
    pub counts: StatusCounts,
    /// Sagas started in the 24 hours before `computed_at`.
    pub started_last_24h: u64,
    /// Mean wall-clock time of COMPLETED sagas, in seconds.
    pub average_completed_duration_secs: Option<f64>,
    /// Status counts per saga type.
    pub by_type: BTreeMap<String, StatusCounts>,
    pub computed_at: DateTime<Utc>,
}

impl SagaStatistics {
    /// Computes statistics over `sagas` as of `now`.
    pub fn compute(sagas: &[SagaInstance], now: DateTime<Utc>) -> Self {
        let window_start = now - Duration::hours(24);
        let mut counts = StatusCounts::default();
        let mut by_type: BTreeMap<String, StatusCounts> = BTreeMap::new();
        let mut started_last_24h = 0;
        // Integer milliseconds keep the mean independent of input order.
        let mut completed_millis: i64 = 0;
        let mut completed_with_duration: i64 = 0;

        for saga in sagas {
            counts.add(saga.status());
            by_type
                .entry(saga.saga_type().to_string())
                .or_default()
                .add(saga.status());

            if saga.started_at() > window_start && saga.started_at() <= now {
                started_last_24h += 1;
            }
            if saga.status() == SagaStatus::Completed
                && let Some(duration) = saga.duration()
            {
                completed_millis += duration.num_milliseconds().max(0);
                completed_with_duration += 1;
            }
        }

        let average_completed_duration_secs = (completed_with_duration > 0)
            .then(|| completed_millis as f64 / completed_with_duration as f64 / 1000.0);

        Self {
            counts,
            started_last_24h,
            average_completed_duration_secs,
            by_type,
            computed_at: now,
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.total()
    }

    pub fn active(&self) -> u64 {
        self.counts.active()
    }
}

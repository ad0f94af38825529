//! Write-once observational records about saga executions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const SAGA_DURATION_SECONDS: &str = "saga_duration_seconds";
pub const STEP_DURATION_SECONDS: &str = "step_duration_seconds";
pub const SAGA_RETRY_COUNT: &str = "saga_retry_count";

/// A single measurement tied to one saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaMetric {
    pub saga_id: SagaId,
    pub metric_name: String,
    pub metric_value: f64,
    pub labels: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl SagaMetric {
    pub fn new(saga_id: SagaId, metric_name: impl Into<String>, metric_value: f64) -> Self {
        Self {
            saga_id,
            metric_name: metric_name.into(),
            metric_value,
            labels: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Destination for [`SagaMetric`] records.
///
/// Recording is best-effort; the orchestrator logs and ignores failures.
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn record(&self, metric: SagaMetric) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_ordered() {
        let metric = SagaMetric::new(SagaId::new(), STEP_DURATION_SECONDS, 0.25)
            .with_label("step", "charge")
            .with_label("saga_type", "checkout");

        let keys: Vec<_> = metric.labels.keys().cloned().collect();
        assert_eq!(keys, vec!["saga_type", "step"]);
        assert_eq!(metric.metric_value, 0.25);
    }
}

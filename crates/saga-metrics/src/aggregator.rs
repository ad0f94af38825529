//! On-demand aggregation over the saga repository.

use std::sync::Arc;

use chrono::Utc;
use saga::{SagaFilter, SagaRepository, SagaStatus};
use tracing::instrument;

use crate::error::Result;
use crate::health::{HealthReport, HealthThresholds};
use crate::statistics::SagaStatistics;

/// Computes statistics and health from committed saga state.
///
/// The aggregator only reads. Running it repeatedly, or from several
/// processes at once, never changes what is stored.
pub struct MetricsAggregator<Tx: Send> {
    repository: Arc<dyn SagaRepository<Tx>>,
    thresholds: HealthThresholds,
}

impl<Tx: Send> Clone for MetricsAggregator<Tx> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            thresholds: self.thresholds,
        }
    }
}

impl<Tx: Send + 'static> MetricsAggregator<Tx> {
    pub fn new(repository: Arc<dyn SagaRepository<Tx>>) -> Self {
        Self {
            repository,
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    /// Computes statistics over every stored saga.
    #[instrument(skip(self))]
    pub async fn statistics(&self) -> Result<SagaStatistics> {
        let sagas = self.repository.list(&SagaFilter::new()).await?;
        Ok(SagaStatistics::compute(&sagas, Utc::now()))
    }

    /// Evaluates health over active and FAILED sagas.
    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<HealthReport> {
        let filter = SagaFilter::active().with_status(SagaStatus::Failed);
        let sagas = self.repository.list(&filter).await?;
        let report = HealthReport::evaluate(&sagas, self.thresholds, Utc::now());

        if !report.healthy {
            tracing::warn!(
                overdue = report.overdue.len(),
                failed = report.failed.len(),
                "saga health check failed"
            );
        }
        Ok(report)
    }

    /// Publishes `stats` as gauges on the installed metrics recorder.
    pub fn publish(&self, stats: &SagaStatistics) {
        for status in SagaStatus::ALL {
            metrics::gauge!("saga_instances", "status" => status.as_str())
                .set(stats.counts.get(status) as f64);
        }
        metrics::gauge!("saga_started_last_24h").set(stats.started_last_24h as f64);
        if let Some(avg) = stats.average_completed_duration_secs {
            metrics::gauge!("saga_average_completed_duration_seconds").set(avg);
        }
    }

    /// Computes statistics and publishes them.
    pub async fn refresh(&self) -> Result<SagaStatistics> {
        let stats = self.statistics().await?;
        self.publish(&stats);
        tracing::debug!(total = stats.total(), active = stats.active(), "published saga statistics");
        Ok(stats)
    }
}

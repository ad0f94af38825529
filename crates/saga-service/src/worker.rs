//! Periodic maintenance: lock purge, timeout recovery, statistics.

use std::time::Duration;

use common::SagaId;
use event_store::TransactionalEventStore;
use saga_metrics::SagaStatistics;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::service::SagaService;

/// Outcome of one maintenance sweep. Failed parts are logged and left empty.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub purged_locks: u64,
    pub recovered: Vec<SagaId>,
    pub statistics: Option<SagaStatistics>,
}

/// Runs maintenance sweeps on a fixed period until cancelled.
pub struct MaintenanceWorker<S: TransactionalEventStore> {
    service: SagaService<S>,
    interval: Duration,
}

impl<S: TransactionalEventStore> MaintenanceWorker<S> {
    pub fn new(service: SagaService<S>, interval: Duration) -> Self {
        Self { service, interval }
    }

    /// Performs one sweep. Each part runs even if an earlier one failed.
    ///
    /// Timeout recovery covers only the saga types registered on the
    /// service; overdue sagas of other types wait for a worker that has
    /// their definitions.
    pub async fn sweep(&self, cancel: &CancellationToken) -> SweepReport {
        let mut report = SweepReport::default();

        match self.service.locks().purge_expired().await {
            Ok(purged) => {
                if purged > 0 {
                    tracing::debug!(purged, "purged expired saga locks");
                }
                report.purged_locks = purged;
            }
            Err(err) => tracing::warn!(error = %err, "lock purge failed"),
        }

        match self.service.orchestrator().recover_timed_out(cancel).await {
            Ok(recovered) => report.recovered = recovered,
            Err(err) => tracing::warn!(error = %err, "timeout recovery failed"),
        }

        match self.service.aggregator().refresh().await {
            Ok(stats) => report.statistics = Some(stats),
            Err(err) => tracing::warn!(error = %err, "statistics refresh failed"),
        }

        metrics::counter!("saga_maintenance_sweeps_total").increment(1);
        report
    }

    /// Sweeps immediately and then every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "maintenance worker started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep(&cancel).await;
                }
            }
        }

        tracing::info!("maintenance worker stopped");
    }
}

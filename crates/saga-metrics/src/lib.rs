//! Operational view over saga instances.
//!
//! Everything here is derived from the saga store and never feeds back into
//! it:
//! - [`SagaStatistics`]: counts by status and type, recent starts, average
//!   completion time
//! - [`HealthReport`]: overdue sagas and FAILED sagas awaiting an operator
//! - [`MetricsAggregator`]: computes both on demand and publishes gauges
//! - [`InMemoryMetricSink`] / [`PostgresMetricSink`]: destinations for
//!   per-saga [`saga::SagaMetric`] records

pub mod aggregator;
pub mod error;
pub mod health;
pub mod sink;
pub mod statistics;

pub use aggregator::MetricsAggregator;
pub use error::{MetricsError, Result};
pub use health::{FailedSaga, HealthReport, HealthThresholds};
pub use sink::{InMemoryMetricSink, PostgresMetricSink};
pub use statistics::{SagaStatistics, StatusCounts};

//! Destinations for per-saga metric records.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SagaId;
use saga::{MetricSink, SagaMetric};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;

/// Keeps metric records in memory, in recording order.
#[derive(Clone, Default)]
pub struct InMemoryMetricSink {
    records: Arc<RwLock<Vec<SagaMetric>>>,
}

impl InMemoryMetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<SagaMetric> {
        self.records.read().await.clone()
    }

    pub async fn for_saga(&self, saga_id: SagaId) -> Vec<SagaMetric> {
        self.records
            .read()
            .await
            .iter()
            .filter(|m| m.saga_id == saga_id)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl MetricSink for InMemoryMetricSink {
    async fn record(&self, metric: SagaMetric) -> saga::Result<()> {
        self.records.write().await.push(metric);
        Ok(())
    }
}

/// Appends metric records to the `saga_metrics` table.
#[derive(Clone)]
pub struct PostgresMetricSink {
    pool: PgPool,
}

impl PostgresMetricSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Loads every record for one saga, oldest first.
    pub async fn metrics_for_saga(&self, saga_id: SagaId) -> Result<Vec<SagaMetric>> {
        let rows = sqlx::query(
            r#"
            SELECT saga_id, metric_name, metric_value, metric_labels, recorded_at
            FROM saga_metrics
            WHERE saga_id = $1
            ORDER BY recorded_at ASC, metric_name ASC
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<SagaMetric> {
                let labels: serde_json::Value = row.try_get("metric_labels")?;
                Ok(SagaMetric {
                    saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
                    metric_name: row.try_get("metric_name")?,
                    metric_value: row.try_get("metric_value")?,
                    labels: serde_json::from_value::<BTreeMap<String, String>>(labels)
                        .unwrap_or_default(),
                    recorded_at: row.try_get::<DateTime<Utc>, _>("recorded_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl MetricSink for PostgresMetricSink {
    async fn record(&self, metric: SagaMetric) -> saga::Result<()> {
        let labels = serde_json::to_value(&metric.labels)?;
        sqlx::query(
            r#"
            INSERT INTO saga_metrics (id, saga_id, metric_name, metric_value, metric_labels, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(metric.saga_id.as_uuid())
        .bind(&metric.metric_name)
        .bind(metric.metric_value)
        .bind(labels)
        .bind(metric.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

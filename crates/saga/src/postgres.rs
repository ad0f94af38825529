use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, SagaId, TenantId};
use event_store::PgTransaction;
use sqlx::{PgPool, Row, postgres::PgRow};
use unit_of_work::{Entity, Repository, RepositoryError};
use uuid::Uuid;

use crate::instance::{SagaFailure, SagaInstance, StepRecord};
use crate::repository::{SagaFilter, SagaRepository};

const SAGA_COLUMNS: &str = "id, saga_type, status, current_step, total_steps, input_data, output_data, \
     steps_data, metadata, pattern, retry_count, max_retries, timeout_seconds, correlation_id, \
     tenant_id, started_at, completed_at, updated_at";

const FAILURE_KEY: &str = "failure";
const COMPENSATION_FAILURE_KEY: &str = "compensation_failure";

/// PostgreSQL-backed saga repository over the `saga_instances` table.
#[derive(Clone)]
pub struct PostgresSagaRepository {
    pool: PgPool,
}

impl PostgresSagaRepository {
    /// Creates a new PostgreSQL saga repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Folds failure details into the metadata column.
    fn metadata_column(saga: &SagaInstance) -> Result<serde_json::Value, RepositoryError> {
        let mut metadata = match &saga.metadata {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        if let Some(failure) = &saga.failure {
            metadata.insert(FAILURE_KEY.to_string(), serde_json::to_value(failure)?);
        }
        if let Some(failure) = &saga.compensation_failure {
            metadata.insert(COMPENSATION_FAILURE_KEY.to_string(), serde_json::to_value(failure)?);
        }
        Ok(serde_json::Value::Object(metadata))
    }

    fn row_to_saga(row: PgRow) -> Result<SagaInstance, RepositoryError> {
        let status: String = row.try_get("status")?;
        let pattern: String = row.try_get("pattern")?;
        let id: Uuid = row.try_get("id")?;

        let invalid = |message: String| RepositoryError::Constraint {
            entity_type: SagaInstance::ENTITY_TYPE,
            id: id.to_string(),
            message,
        };

        let mut metadata: serde_json::Value = row.try_get("metadata")?;
        let (failure, compensation_failure) = match metadata.as_object_mut() {
            Some(map) => (
                map.remove(FAILURE_KEY)
                    .map(serde_json::from_value::<SagaFailure>)
                    .transpose()?,
                map.remove(COMPENSATION_FAILURE_KEY)
                    .map(serde_json::from_value::<SagaFailure>)
                    .transpose()?,
            ),
            None => (None, None),
        };
        let steps_data: Vec<StepRecord> = serde_json::from_value(row.try_get("steps_data")?)?;

        Ok(SagaInstance {
            id: SagaId::from_uuid(id),
            saga_type: row.try_get("saga_type")?,
            status: status.parse().map_err(|e: crate::SagaError| invalid(e.to_string()))?,
            current_step: row.try_get::<i32, _>("current_step")?.max(0) as usize,
            total_steps: row.try_get::<i32, _>("total_steps")?.max(0) as usize,
            input_data: row.try_get("input_data")?,
            output_data: row.try_get("output_data")?,
            steps_data,
            metadata,
            pattern: pattern.parse().map_err(|e: crate::SagaError| invalid(e.to_string()))?,
            retry_count: row.try_get::<i32, _>("retry_count")?.max(0) as u32,
            max_retries: row.try_get::<i32, _>("max_retries")?.max(0) as u32,
            timeout_seconds: row
                .try_get::<Option<i64>, _>("timeout_seconds")?
                .map(|secs| secs.max(0) as u64),
            correlation_id: CorrelationId::from_uuid(row.try_get("correlation_id")?),
            tenant_id: row.try_get::<Option<String>, _>("tenant_id")?.map(TenantId::new),
            failure,
            compensation_failure,
            started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
            completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }
}

#[async_trait]
impl Repository<SagaInstance, PgTransaction> for PostgresSagaRepository {
    async fn save(&self, tx: &mut PgTransaction, saga: &SagaInstance) -> Result<(), RepositoryError> {
        let metadata = Self::metadata_column(saga)?;
        let steps_data = serde_json::to_value(&saga.steps_data)?;
        let to_i32 = |value: usize, column: &str| {
            i32::try_from(value).map_err(|_| RepositoryError::Constraint {
                entity_type: SagaInstance::ENTITY_TYPE,
                id: saga.entity_id(),
                message: format!("{column} out of range"),
            })
        };

        sqlx::query(&format!(
            r#"
            INSERT INTO saga_instances ({SAGA_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                current_step = EXCLUDED.current_step,
                output_data = EXCLUDED.output_data,
                steps_data = EXCLUDED.steps_data,
                metadata = EXCLUDED.metadata,
                retry_count = EXCLUDED.retry_count,
                completed_at = EXCLUDED.completed_at,
                updated_at = EXCLUDED.updated_at
            "#
        ))
        .bind(saga.id.as_uuid())
        .bind(&saga.saga_type)
        .bind(saga.status.as_str())
        .bind(to_i32(saga.current_step, "current_step")?)
        .bind(to_i32(saga.total_steps, "total_steps")?)
        .bind(&saga.input_data)
        .bind(&saga.output_data)
        .bind(steps_data)
        .bind(metadata)
        .bind(saga.pattern.as_str())
        .bind(saga.retry_count.min(i32::MAX as u32) as i32)
        .bind(saga.max_retries.min(i32::MAX as u32) as i32)
        .bind(saga.timeout_seconds.map(|secs| secs.min(i64::MAX as u64) as i64))
        .bind(saga.correlation_id.as_uuid())
        .bind(saga.tenant_id.as_ref().map(|t| t.as_str().to_string()))
        .bind(saga.started_at)
        .bind(saga.completed_at)
        .bind(saga.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<SagaInstance>, RepositoryError> {
        let Ok(uuid) = id.parse::<Uuid>() else {
            return Ok(None);
        };

        let row = sqlx::query(&format!("SELECT {SAGA_COLUMNS} FROM saga_instances WHERE id = $1"))
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_saga).transpose()
    }
}

#[async_trait]
impl SagaRepository<PgTransaction> for PostgresSagaRepository {
    async fn list(&self, filter: &SagaFilter) -> Result<Vec<SagaInstance>, RepositoryError> {
        let mut sql = format!("SELECT {SAGA_COLUMNS} FROM saga_instances WHERE 1=1");
        let mut param_count = 0;

        if !filter.statuses.is_empty() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ANY(${param_count})"));
        }
        if filter.tenant_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND tenant_id = ${param_count}"));
        }
        if filter.saga_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND saga_type = ${param_count}"));
        }
        if filter.started_after.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND started_at >= ${param_count}"));
        }

        sql.push_str(" ORDER BY started_at ASC");

        if filter.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }

        let mut query = sqlx::query(&sql);

        if !filter.statuses.is_empty() {
            let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
            query = query.bind(statuses);
        }
        if let Some(tenant_id) = &filter.tenant_id {
            query = query.bind(tenant_id.as_str().to_string());
        }
        if let Some(saga_type) = &filter.saga_type {
            query = query.bind(saga_type.clone());
        }
        if let Some(started_after) = filter.started_after {
            query = query.bind(started_after);
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_saga).collect()
    }
}

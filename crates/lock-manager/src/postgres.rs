use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::lock::ttl_to_chrono;
use crate::{LockError, LockManager, Result, SagaLock};

const LOCK_COLUMNS: &str = "lock_key, locked_by, locked_at, expires_at, metadata";

/// PostgreSQL-backed lock manager over the `saga_locks` table.
///
/// Lease times come from the database clock so that every process agrees
/// on expiry.
#[derive(Clone)]
pub struct PostgresLockManager {
    pool: PgPool,
}

impl PostgresLockManager {
    /// Creates a new PostgreSQL lock manager.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_lock(row: PgRow) -> Result<SagaLock> {
        let metadata: Option<serde_json::Value> = row.try_get("metadata")?;
        Ok(SagaLock {
            lock_key: row.try_get("lock_key")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get::<DateTime<Utc>, _>("locked_at")?,
            expires_at: row.try_get::<DateTime<Utc>, _>("expires_at")?,
            metadata: metadata.unwrap_or_else(|| serde_json::json!({})),
        })
    }

    fn ttl_secs(ttl: Duration) -> Result<f64> {
        ttl_to_chrono(ttl)?;
        Ok(ttl.as_secs_f64())
    }
}

#[async_trait]
impl LockManager for PostgresLockManager {
    async fn acquire_with_metadata(
        &self,
        lock_key: &str,
        holder_id: &str,
        ttl: Duration,
        metadata: serde_json::Value,
    ) -> Result<SagaLock> {
        let ttl_secs = Self::ttl_secs(ttl)?;

        // The conflict arm only fires for an expired lease, so of several
        // concurrent callers exactly one gets a row back.
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO saga_locks (lock_key, locked_by, locked_at, expires_at, metadata)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3), $4)
            ON CONFLICT (lock_key) DO UPDATE
                SET locked_by = EXCLUDED.locked_by,
                    locked_at = EXCLUDED.locked_at,
                    expires_at = EXCLUDED.expires_at,
                    metadata = EXCLUDED.metadata
                WHERE saga_locks.expires_at <= NOW()
            RETURNING {LOCK_COLUMNS}
            "#
        ))
        .bind(lock_key)
        .bind(holder_id)
        .bind(ttl_secs)
        .bind(&metadata)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            tracing::debug!(lock_key, holder_id, "lock acquired");
            return Self::row_to_lock(row);
        }

        let current = sqlx::query(&format!(
            "SELECT {LOCK_COLUMNS} FROM saga_locks WHERE lock_key = $1"
        ))
        .bind(lock_key)
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_lock)
        .transpose()?;

        match current {
            Some(held) => Err(LockError::AlreadyLocked {
                lock_key: lock_key.to_string(),
                held_by: held.locked_by,
                expires_at: held.expires_at,
            }),
            // Released between the two statements; report as contention so
            // the caller retries.
            None => Err(LockError::AlreadyLocked {
                lock_key: lock_key.to_string(),
                held_by: String::new(),
                expires_at: Utc::now(),
            }),
        }
    }

    async fn release(&self, lock_key: &str, holder_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM saga_locks WHERE lock_key = $1 AND locked_by = $2")
            .bind(lock_key)
            .bind(holder_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(lock_key, holder_id, "release of lock not held by caller ignored");
        }
        Ok(result.rows_affected() > 0)
    }

    async fn renew(&self, lock_key: &str, holder_id: &str, ttl: Duration) -> Result<SagaLock> {
        let ttl_secs = Self::ttl_secs(ttl)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE saga_locks
            SET expires_at = NOW() + make_interval(secs => $3)
            WHERE lock_key = $1 AND locked_by = $2
            RETURNING {LOCK_COLUMNS}
            "#
        ))
        .bind(lock_key)
        .bind(holder_id)
        .bind(ttl_secs)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_lock(row),
            None => Err(LockError::LockLost {
                lock_key: lock_key.to_string(),
                holder_id: holder_id.to_string(),
            }),
        }
    }

    async fn holder_of(&self, lock_key: &str) -> Result<Option<SagaLock>> {
        sqlx::query(&format!(
            "SELECT {LOCK_COLUMNS} FROM saga_locks WHERE lock_key = $1 AND expires_at > NOW()"
        ))
        .bind(lock_key)
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_lock)
        .transpose()
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM saga_locks WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

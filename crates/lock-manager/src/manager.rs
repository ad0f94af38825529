use std::time::Duration;

use async_trait::async_trait;

use crate::{LockError, Result, SagaLock};

/// Lease-based lock manager.
///
/// Implementations must make `acquire` atomic: of several concurrent callers
/// for the same free key, exactly one receives the lease.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Takes the lock if it is free or its lease has expired.
    ///
    /// Fails with [`LockError::AlreadyLocked`] while an unexpired lease
    /// exists, whoever the requester is.
    async fn acquire_with_metadata(
        &self,
        lock_key: &str,
        holder_id: &str,
        ttl: Duration,
        metadata: serde_json::Value,
    ) -> Result<SagaLock>;

    /// Releases the lock if `holder_id` holds it.
    ///
    /// Returns false (and changes nothing) when someone else holds the key.
    async fn release(&self, lock_key: &str, holder_id: &str) -> Result<bool>;

    /// Extends the caller's lease by `ttl` from now.
    ///
    /// Fails with [`LockError::LockLost`] if the lock was taken over or
    /// removed; the caller must stop acting on the protected resource.
    async fn renew(&self, lock_key: &str, holder_id: &str, ttl: Duration) -> Result<SagaLock>;

    /// Returns the current unexpired lease on a key, if any.
    async fn holder_of(&self, lock_key: &str) -> Result<Option<SagaLock>>;

    /// Deletes every expired lease and returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;

    /// Takes the lock with empty metadata.
    async fn acquire(&self, lock_key: &str, holder_id: &str, ttl: Duration) -> Result<SagaLock> {
        self.acquire_with_metadata(lock_key, holder_id, ttl, serde_json::json!({}))
            .await
    }
}

/// Backoff ceiling for contended acquisition.
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Extension methods for lock managers.
#[async_trait]
pub trait LockManagerExt: LockManager {
    /// Acquires a lock, backing off exponentially while it is contended.
    ///
    /// Gives up with the last `AlreadyLocked` error after `max_attempts`.
    async fn acquire_with_backoff(
        &self,
        lock_key: &str,
        holder_id: &str,
        ttl: Duration,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Result<SagaLock> {
        let mut attempts = 0;
        let mut backoff = base_delay;

        loop {
            match self.acquire(lock_key, holder_id, ttl).await {
                Ok(lock) => return Ok(lock),
                Err(err @ LockError::AlreadyLocked { .. }) => {
                    attempts += 1;
                    metrics::counter!("saga_lock_contention_total").increment(1);
                    if attempts >= max_attempts {
                        return Err(err);
                    }
                    let delay = backoff.min(BACKOFF_MAX) + Duration::from_millis(rand_jitter());
                    tracing::debug!(lock_key, attempts, ?delay, "lock contended, backing off");
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<T: LockManager + ?Sized> LockManagerExt for T {}

/// Returns 0-49ms of backoff jitter.
fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 50
}

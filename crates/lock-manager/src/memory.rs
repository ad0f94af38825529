//! In-memory lock manager for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::lock::expiry_after;
use crate::{LockError, LockManager, Result, SagaLock};

/// In-memory lock manager.
///
/// Leases live in a `RwLock`-protected map; there is no cross-process
/// coordination.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    leases: RwLock<HashMap<String, SagaLock>>,
}

fn poison_err<T>(_: PoisonError<T>) -> LockError {
    LockError::Poisoned
}

impl InMemoryLockManager {
    /// Creates an empty lock manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored leases, expired ones included.
    pub fn lease_count(&self) -> usize {
        self.leases.read().map(|l| l.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire_with_metadata(
        &self,
        lock_key: &str,
        holder_id: &str,
        ttl: Duration,
        metadata: serde_json::Value,
    ) -> Result<SagaLock> {
        let lease = SagaLock::new(lock_key, holder_id, ttl, metadata)?;
        let mut leases = self.leases.write().map_err(poison_err)?;

        if let Some(existing) = leases.get(lock_key)
            && !existing.is_expired_at(lease.locked_at)
        {
            return Err(LockError::AlreadyLocked {
                lock_key: lock_key.to_string(),
                held_by: existing.locked_by.clone(),
                expires_at: existing.expires_at,
            });
        }

        leases.insert(lock_key.to_string(), lease.clone());
        drop(leases);

        tracing::debug!(lock_key, holder_id, "lock acquired");
        Ok(lease)
    }

    async fn release(&self, lock_key: &str, holder_id: &str) -> Result<bool> {
        let mut leases = self.leases.write().map_err(poison_err)?;

        let Some(lease) = leases.get(lock_key) else {
            return Ok(false);
        };
        if !lease.is_held_by(holder_id) {
            tracing::warn!(lock_key, holder_id, held_by = %lease.locked_by, "release by non-holder ignored");
            return Ok(false);
        }

        leases.remove(lock_key);
        Ok(true)
    }

    async fn renew(&self, lock_key: &str, holder_id: &str, ttl: Duration) -> Result<SagaLock> {
        let expires_at = expiry_after(Utc::now(), ttl)?;
        let mut leases = self.leases.write().map_err(poison_err)?;

        match leases.get_mut(lock_key) {
            Some(lease) if lease.is_held_by(holder_id) => {
                lease.expires_at = expires_at;
                Ok(lease.clone())
            }
            _ => Err(LockError::LockLost {
                lock_key: lock_key.to_string(),
                holder_id: holder_id.to_string(),
            }),
        }
    }

    async fn holder_of(&self, lock_key: &str) -> Result<Option<SagaLock>> {
        let leases = self.leases.read().map_err(poison_err)?;
        Ok(leases.get(lock_key).filter(|l| !l.is_expired()).cloned())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        let now = Utc::now();
        let before = leases.len();
        leases.retain(|_, lease| !lease.is_expired_at(now));
        Ok((before - leases.len()) as u64)
    }
}

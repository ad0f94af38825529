use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{LockError, Result};

/// Longest lease a lock manager hands out.
pub const MAX_LOCK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A lease on a lock key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaLock {
    /// The locked key (for example `saga:<uuid>`).
    pub lock_key: String,

    /// Identifier of the holder.
    pub locked_by: String,

    /// When the current lease was acquired.
    pub locked_at: DateTime<Utc>,

    /// When the lease lapses unless renewed.
    pub expires_at: DateTime<Utc>,

    /// Free-form context about the holder's operation.
    pub metadata: serde_json::Value,
}

impl SagaLock {
    /// Creates a lease starting now.
    pub fn new(
        lock_key: impl Into<String>,
        holder_id: impl Into<String>,
        ttl: Duration,
        metadata: serde_json::Value,
    ) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            lock_key: lock_key.into(),
            locked_by: holder_id.into(),
            locked_at: now,
            expires_at: expiry_after(now, ttl)?,
            metadata,
        })
    }

    /// Returns true if the lease has lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Returns true if the lease has lapsed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Returns true if `holder_id` owns this lease.
    pub fn is_held_by(&self, holder_id: &str) -> bool {
        self.locked_by == holder_id
    }

    /// Returns the remaining lease time (zero if expired).
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Converts a lease duration, rejecting zero and out-of-range values.
pub(crate) fn ttl_to_chrono(ttl: Duration) -> Result<TimeDelta> {
    if ttl.is_zero() {
        return Err(LockError::InvalidTtl("TTL must be positive".to_string()));
    }
    if ttl > MAX_LOCK_TTL {
        return Err(LockError::InvalidTtl(format!(
            "TTL of {}s exceeds the {}s maximum",
            ttl.as_secs(),
            MAX_LOCK_TTL.as_secs()
        )));
    }
    TimeDelta::from_std(ttl).map_err(|e| LockError::InvalidTtl(e.to_string()))
}

/// Returns when a lease of `ttl` taken at `from` lapses.
pub(crate) fn expiry_after(from: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    from.checked_add_signed(ttl_to_chrono(ttl)?)
        .ok_or_else(|| LockError::InvalidTtl(format!("TTL of {}s overflows the clock", ttl.as_secs())))
}

/// Returns the conventional lock key for a saga instance.
pub fn saga_lock_key(saga_id: impl std::fmt::Display) -> String {
    format!("saga:{saga_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_lock_is_not_expired() {
        let lock = SagaLock::new("saga:1", "worker-a", Duration::from_secs(30), serde_json::json!({}))
            .unwrap();
        assert!(!lock.is_expired());
        assert!(lock.is_held_by("worker-a"));
        assert!(!lock.is_held_by("worker-b"));
        assert!(lock.remaining() > Duration::from_secs(29));
    }

    #[test]
    fn lock_expires_after_ttl() {
        let lock = SagaLock::new("saga:1", "worker-a", Duration::from_secs(5), serde_json::json!({}))
            .unwrap();
        let later = lock.locked_at + chrono::Duration::seconds(6);
        assert!(lock.is_expired_at(later));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let result = SagaLock::new("saga:1", "worker-a", Duration::ZERO, serde_json::json!({}));
        assert!(matches!(result, Err(LockError::InvalidTtl(_))));
    }

    #[test]
    fn oversized_ttl_is_rejected() {
        for ttl in [
            MAX_LOCK_TTL + Duration::from_secs(1),
            Duration::from_secs(1 << 60),
            Duration::MAX,
        ] {
            let result = SagaLock::new("saga:1", "worker-a", ttl, serde_json::json!({}));
            assert!(matches!(result, Err(LockError::InvalidTtl(_))), "{ttl:?}");
        }

        let longest = SagaLock::new("saga:1", "worker-a", MAX_LOCK_TTL, serde_json::json!({})).unwrap();
        assert!(!longest.is_expired());
    }

    #[test]
    fn saga_lock_key_format() {
        assert_eq!(saga_lock_key("abc"), "saga:abc");
    }
}

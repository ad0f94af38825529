//! Distributed lock manager.
//!
//! Locks are short-lived leases: a holder acquires a key for a TTL, renews
//! it while work is in progress and releases it when done. An expired lease
//! can be taken over by anyone, and a holder whose lease was taken over gets
//! [`LockError::LockLost`] on renewal and must stop acting on the resource.

pub mod error;
pub mod lock;
pub mod manager;
pub mod memory;
pub mod postgres;

pub use error::{LockError, Result};
pub use lock::{MAX_LOCK_TTL, SagaLock, saga_lock_key};
pub use manager::{LockManager, LockManagerExt};
pub use memory::InMemoryLockManager;
pub use postgres::PostgresLockManager;

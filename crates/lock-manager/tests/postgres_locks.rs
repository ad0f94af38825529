//! PostgreSQL lock manager tests
//!
//! Run with:
//!
//! ```bash
//! cargo test -p lock-manager --test postgres_locks -- --ignored --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use lock_manager::{LockError, LockManager, PostgresLockManager};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/001_create_saga_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_manager() -> PostgresLockManager {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_locks")
        .execute(&pool)
        .await
        .unwrap();

    PostgresLockManager::new(pool)
}

const TTL: Duration = Duration::from_secs(30);

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon"]
async fn acquire_contend_and_release() {
    let manager = get_test_manager().await;

    let lock = manager.acquire("saga:1", "worker-a", TTL).await.unwrap();
    assert_eq!(lock.locked_by, "worker-a");

    let contended = manager.acquire("saga:1", "worker-b", TTL).await;
    assert!(matches!(contended, Err(LockError::AlreadyLocked { .. })));

    assert!(!manager.release("saga:1", "worker-b").await.unwrap());
    assert!(manager.release("saga:1", "worker-a").await.unwrap());
    assert!(manager.holder_of("saga:1").await.unwrap().is_none());
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon"]
async fn expired_lease_is_taken_over_and_old_holder_loses_it() {
    let manager = get_test_manager().await;

    manager
        .acquire("saga:1", "worker-a", Duration::from_millis(200))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let lock = manager.acquire("saga:1", "worker-b", TTL).await.unwrap();
    assert_eq!(lock.locked_by, "worker-b");

    let renewed = manager.renew("saga:1", "worker-a", TTL).await;
    assert!(matches!(renewed, Err(LockError::LockLost { .. })));
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon"]
async fn concurrent_acquire_has_single_winner() {
    let manager = get_test_manager().await;

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .acquire("saga:shared", &format!("worker-{i}"), TTL)
                    .await
                    .is_ok()
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon"]
async fn purge_expired_leases() {
    let manager = get_test_manager().await;

    manager
        .acquire("saga:1", "worker-a", Duration::from_millis(100))
        .await
        .unwrap();
    manager.acquire("saga:2", "worker-a", TTL).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(manager.purge_expired().await.unwrap(), 1);
    assert!(manager.holder_of("saga:2").await.unwrap().is_some());
}

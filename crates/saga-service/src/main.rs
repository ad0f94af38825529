//! Maintenance worker entry point.
//!
//! The stock binary registers no saga definitions, so its sweeps purge
//! expired locks and refresh statistics but recover no overdue sagas.
//! Timeout recovery needs the step code, so it runs in processes that
//! register their definitions on a [`SagaService`] and drive a
//! [`MaintenanceWorker`] themselves.

use std::sync::Arc;

use event_store::{PostgresEventStore, TransactionalEventStore};
use lock_manager::PostgresLockManager;
use saga::PostgresSagaRepository;
use saga_metrics::PostgresMetricSink;
use saga_service::{MaintenanceWorker, SagaService, ServiceConfig, telemetry};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

async fn run_worker<S: TransactionalEventStore>(service: SagaService<S>, config: &ServiceConfig) {
    let saga_types = service.orchestrator().registry().types();
    if saga_types.is_empty() {
        tracing::info!("no saga types registered, timeout recovery is disabled");
    } else {
        tracing::info!(?saga_types, "timeout recovery enabled");
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    MaintenanceWorker::new(service, config.sweep_interval)
        .run(cancel)
        .await;
}

#[tokio::main]
async fn main() {
    // 1. Configuration and tracing
    let config = ServiceConfig::from_env();
    telemetry::init_tracing(&config).expect("failed to initialise tracing");

    // 2. Install Prometheus metrics recorder
    telemetry::install_metrics_exporter(config.metrics_addr)
        .expect("failed to install Prometheus recorder");
    tracing::info!(addr = %config.metrics_addr, "serving Prometheus metrics");

    // 3. Build backends and run until shutdown
    match &config.database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(url)
                .await
                .expect("failed to connect to database");

            let store = PostgresEventStore::new(pool.clone());
            store.run_migrations().await.expect("migrations failed");

            let service = SagaService::new(
                store,
                Arc::new(PostgresSagaRepository::new(pool.clone())),
                Arc::new(PostgresLockManager::new(pool.clone())),
                &config,
            )
            .with_metric_sink(Arc::new(PostgresMetricSink::new(pool)));

            tracing::info!("starting saga worker with PostgreSQL backends");
            run_worker(service, &config).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory backends");
            run_worker(SagaService::in_memory(&config), &config).await;
        }
    }

    tracing::info!("saga worker shut down gracefully");
}

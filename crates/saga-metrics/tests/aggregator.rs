//! Aggregator tests: sagas driven through the orchestrator, then measured.

use std::sync::Arc;

use event_store::{InMemoryEventStore, TransactionalEventStore};
use lock_manager::InMemoryLockManager;
use saga::{
    FnStep, InMemorySagaRepository, OrchestratorConfig, RetryPolicy, SagaDefinition,
    SagaInstance, SagaOrchestrator, SagaPattern, SagaRegistry, SagaRequest, SagaStatus,
    StepError,
};
use saga_metrics::{HealthThresholds, InMemoryMetricSink, MetricsAggregator};
use tokio_util::sync::CancellationToken;
use unit_of_work::{Repository, UnitOfWork};

type Store = InMemoryEventStore;

struct Setup {
    store: Store,
    sagas: Arc<InMemorySagaRepository>,
    sink: Arc<InMemoryMetricSink>,
    orchestrator: SagaOrchestrator<Store>,
    aggregator: MetricsAggregator<<Store as TransactionalEventStore>::Tx>,
}

fn setup() -> Setup {
    let store = InMemoryEventStore::new();
    let sagas = Arc::new(InMemorySagaRepository::new(store.clone()));
    let sink = Arc::new(InMemoryMetricSink::new());
    let registry = Arc::new(SagaRegistry::new());

    let ok = |name: &str| {
        FnStep::<Store>::new(name, |_, _| async { Ok(serde_json::json!({ "ok": true })) })
    };
    registry
        .register(SagaDefinition::new("provision").step(ok("a")).step(ok("b")))
        .unwrap();
    registry
        .register(
            SagaDefinition::new("refund")
                .step(ok("reserve"))
                .step(FnStep::new("charge", |_, _| async {
                    Err(StepError::permanent("card declined"))
                })),
        )
        .unwrap();
    registry
        .register(
            SagaDefinition::new("broken")
                .step(ok("reserve").with_compensation(|_, _| async {
                    Err(StepError::permanent("release rejected"))
                }))
                .step(FnStep::new("charge", |_, _| async {
                    Err(StepError::permanent("card declined"))
                })),
        )
        .unwrap();

    let config = OrchestratorConfig::default().with_retry_policy(RetryPolicy::no_retry());
    let orchestrator = SagaOrchestrator::new(
        UnitOfWork::new(store.clone()),
        sagas.clone(),
        Arc::new(InMemoryLockManager::new()),
        registry,
    )
    .with_config(config)
    .with_metric_sink(sink.clone());

    Setup {
        aggregator: MetricsAggregator::new(sagas.clone()),
        store,
        sagas,
        sink,
        orchestrator,
    }
}

async fn run(setup: &Setup, saga_type: &str) -> saga::Result<SagaInstance> {
    setup
        .orchestrator
        .start_saga(
            SagaRequest::new(saga_type, serde_json::json!({})),
            &CancellationToken::new(),
        )
        .await
}

#[tokio::test]
async fn test_statistics_reflect_outcomes() {
    let s = setup();
    run(&s, "provision").await.unwrap();
    run(&s, "provision").await.unwrap();
    assert!(run(&s, "refund").await.is_err());
    assert!(run(&s, "broken").await.is_err());
    s.orchestrator
        .create(SagaRequest::new("provision", serde_json::json!({})))
        .await
        .unwrap();

    let stats = s.aggregator.statistics().await.unwrap();

    assert_eq!(stats.total(), 5);
    assert_eq!(stats.counts.completed, 2);
    assert_eq!(stats.counts.compensated, 1);
    assert_eq!(stats.counts.failed, 1);
    assert_eq!(stats.counts.pending, 1);
    assert_eq!(stats.active(), 1);
    assert_eq!(stats.started_last_24h, 5);
    assert!(stats.average_completed_duration_secs.is_some());
    assert_eq!(stats.by_type["provision"].get(SagaStatus::Completed), 2);
    assert_eq!(stats.by_type["refund"].get(SagaStatus::Compensated), 1);
}

#[tokio::test]
async fn test_statistics_are_idempotent() {
    let s = setup();
    run(&s, "provision").await.unwrap();
    assert!(run(&s, "refund").await.is_err());

    let first = s.aggregator.statistics().await.unwrap();
    let second = s.aggregator.statistics().await.unwrap();

    assert_eq!(first.counts, second.counts);
    assert_eq!(first.by_type, second.by_type);
    assert_eq!(first.started_last_24h, second.started_last_24h);
    assert_eq!(
        first.average_completed_duration_secs,
        second.average_completed_duration_secs
    );
}

#[tokio::test]
async fn test_refresh_leaves_store_untouched() {
    let s = setup();
    let saga = run(&s, "provision").await.unwrap();
    let before = s.sagas.find_by_id(&saga.id().to_string()).await.unwrap();

    s.aggregator.refresh().await.unwrap();
    s.aggregator.refresh().await.unwrap();

    let after = s.sagas.find_by_id(&saga.id().to_string()).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_health_reports_failed_sagas() {
    let s = setup();
    run(&s, "provision").await.unwrap();
    assert!(s.aggregator.health().await.unwrap().healthy);

    let broken = run(&s, "broken").await;
    assert!(broken.is_err());

    let report = s.aggregator.health().await.unwrap();
    assert!(!report.healthy);
    assert_eq!(report.failed.len(), 1);
    let failed = &report.failed[0];
    assert_eq!(failed.saga_type, "broken");
    assert_eq!(failed.step_name.as_deref(), Some("reserve"));
    assert!(failed.message.contains("release rejected"));

    let tolerant = s.aggregator.clone().with_thresholds(HealthThresholds {
        max_failed: 1,
        ..HealthThresholds::default()
    });
    assert!(tolerant.health().await.unwrap().healthy);
}

#[tokio::test]
async fn test_health_reports_overdue_sagas() {
    let s = setup();
    let overdue = SagaInstance::new("provision", serde_json::json!({}), 2, SagaPattern::Orchestration)
        .with_timeout_seconds(Some(0));
    let mut tx = s.store.begin().await.unwrap();
    s.sagas.save(&mut tx, &overdue).await.unwrap();
    s.store.commit(tx).await.unwrap();

    let report = s.aggregator.health().await.unwrap();
    assert!(!report.healthy);
    assert_eq!(report.active, 1);
    assert_eq!(report.overdue, vec![overdue.id()]);
}

#[tokio::test]
async fn test_sink_receives_orchestrator_metrics() {
    let s = setup();
    let saga = run(&s, "provision").await.unwrap();

    let names: Vec<String> = s
        .sink
        .for_saga(saga.id())
        .await
        .into_iter()
        .map(|m| m.metric_name)
        .collect();
    assert!(names.iter().any(|n| n == saga::SAGA_DURATION_SECONDS));
    assert!(names.iter().any(|n| n == saga::STEP_DURATION_SECONDS));
}

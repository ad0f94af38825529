use std::sync::Arc;

use chrono::Utc;
use criterion::{Criterion, criterion_group, criterion_main};
use event_store::{InMemoryEventStore, InMemoryTransaction, TransactionalEventStore};
use saga::{InMemorySagaRepository, SagaInstance, SagaPattern, SagaStatus};
use saga_metrics::{HealthReport, HealthThresholds, MetricsAggregator, SagaStatistics};
use unit_of_work::Repository;

/// Builds N sagas spread across every status and three saga types.
fn make_sagas(n: usize) -> Vec<SagaInstance> {
    let types = ["provision", "checkout", "refund"];
    (0..n)
        .map(|i| {
            let mut saga = SagaInstance::new(
                types[i % types.len()],
                serde_json::json!({ "n": i }),
                3,
                SagaPattern::Orchestration,
            );
            let path: &[SagaStatus] = match i % 6 {
                0 => &[],
                1 => &[SagaStatus::Running],
                2 => &[SagaStatus::Running, SagaStatus::Completed],
                3 => &[SagaStatus::Running, SagaStatus::Compensating],
                4 => &[SagaStatus::Running, SagaStatus::Compensating, SagaStatus::Compensated],
                _ => &[SagaStatus::Running, SagaStatus::Compensating, SagaStatus::Failed],
            };
            for status in path {
                saga.transition(*status).unwrap();
            }
            saga
        })
        .collect()
}

fn bench_compute_10k(c: &mut Criterion) {
    let sagas = make_sagas(10_000);
    let now = Utc::now();

    c.bench_function("saga_metrics/compute_10k_sagas", |b| {
        b.iter(|| SagaStatistics::compute(&sagas, now));
    });
}

fn bench_health_10k(c: &mut Criterion) {
    let sagas = make_sagas(10_000);
    let now = Utc::now();

    c.bench_function("saga_metrics/health_10k_sagas", |b| {
        b.iter(|| HealthReport::evaluate(&sagas, HealthThresholds::default(), now));
    });
}

fn bench_aggregator_statistics_1k(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    let repository = Arc::new(InMemorySagaRepository::new(store.clone()));

    rt.block_on(async {
        let mut tx = store.begin().await.unwrap();
        for saga in make_sagas(1_000) {
            repository.save(&mut tx, &saga).await.unwrap();
        }
        store.commit(tx).await.unwrap();
    });

    let aggregator: MetricsAggregator<InMemoryTransaction> = MetricsAggregator::new(repository);

    c.bench_function("saga_metrics/aggregator_statistics_1k_sagas", |b| {
        b.iter(|| {
            rt.block_on(async {
                aggregator.statistics().await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_compute_10k,
    bench_health_10k,
    bench_aggregator_statistics_1k
);
criterion_main!(benches);

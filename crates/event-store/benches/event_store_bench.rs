use criterion::{Criterion, criterion_group, criterion_main};
use event_store::{
    AppendOptions, CorrelationId, EventStore, EventStoreExt, InMemoryEventStore, NewEvent,
    StreamId, TransactionalEventStore, Version,
};

fn make_event(correlation_id: CorrelationId) -> NewEvent {
    NewEvent::new(
        "StepCompleted",
        serde_json::json!({
            "type": "StepCompleted",
            "data": { "step_index": 0, "step_name": "create_user" }
        }),
    )
    .with_correlation_id(correlation_id)
}

fn bench_append_single_event(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_single_event", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let stream = StreamId::from("saga-bench");
                store
                    .append(
                        &stream,
                        vec![make_event(CorrelationId::new())],
                        AppendOptions::expect_new(),
                    )
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_append_batch_10(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_batch_10", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let stream = StreamId::from("saga-bench");
                let correlation_id = CorrelationId::new();
                let events = (0..10).map(|_| make_event(correlation_id)).collect();
                store
                    .append(&stream, events, AppendOptions::new())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_transactional_append(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/transactional_append_with_row", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let stream = StreamId::from("user-bench");
                let mut tx = store.begin().await.unwrap();
                store
                    .append_in(
                        &mut tx,
                        &stream,
                        vec![make_event(CorrelationId::new())],
                        AppendOptions::expect_new(),
                    )
                    .await
                    .unwrap();
                tx.put_row("users", "bench", serde_json::json!({"name": "bench"}));
                store.commit(tx).await.unwrap();
            });
        });
    });
}

fn bench_read_stream(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    let stream = StreamId::from("saga-bench");

    // Pre-populate with 100 events
    rt.block_on(async {
        let correlation_id = CorrelationId::new();
        let events = (0..100).map(|_| make_event(correlation_id)).collect();
        store
            .append(&stream, events, AppendOptions::new())
            .await
            .unwrap();
    });

    c.bench_function("event_store/read_stream_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                store.read_stream_to_vec(&stream).await.unwrap();
            });
        });
    });

    c.bench_function("event_store/read_stream_from_version_50", |b| {
        b.iter(|| {
            rt.block_on(async {
                use futures_util::TryStreamExt;
                let events: Vec<_> = store
                    .read_stream(&stream, Some(Version::new(50)))
                    .await
                    .unwrap()
                    .try_collect()
                    .await
                    .unwrap();
                assert_eq!(events.len(), 51);
            });
        });
    });
}

fn bench_read_by_correlation(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    let correlation_id = CorrelationId::new();

    // 10 streams of 100 events, every tenth stream correlated
    rt.block_on(async {
        for i in 0..10 {
            let stream = StreamId::for_aggregate("user", i);
            let correlation = if i % 10 == 0 {
                correlation_id
            } else {
                CorrelationId::new()
            };
            let events = (0..100).map(|_| make_event(correlation)).collect();
            store
                .append(&stream, events, AppendOptions::new())
                .await
                .unwrap();
        }
    });

    c.bench_function("event_store/read_by_correlation_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let events = store
                    .read_by_correlation_to_vec(correlation_id)
                    .await
                    .unwrap();
                assert_eq!(events.len(), 100);
            });
        });
    });
}

criterion_group!(
    benches,
    bench_append_single_event,
    bench_append_batch_10,
    bench_transactional_append,
    bench_read_stream,
    bench_read_by_correlation,
);
criterion_main!(benches);

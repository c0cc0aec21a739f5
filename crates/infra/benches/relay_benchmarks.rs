use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use eventbus_events::{EventInput, InMemoryBroker};
use eventbus_infra::event_store::{EventFilter, EventStore, InMemoryEventStore, OutboxTransaction};
use eventbus_infra::outbox::OutboxWriter;
use eventbus_infra::workers::{Relay, RelayConfig};

const BACKLOG: usize = 1_000;

/// Store with `count` unpublished events spread over a few topics.
fn seeded_store(count: usize) -> InMemoryEventStore {
    let store = InMemoryEventStore::new();
    let writer = OutboxWriter::new();
    let mut tx = store.begin();
    for i in 0..count {
        let topic = format!("topic-{}", i % 4);
        let input = EventInput::new(topic, "bench.event", "application/json", vec![b'x'; 256])
            .with_key(format!("key-{}", i % 32));
        writer.send(&mut tx, input).unwrap();
    }
    tx.commit().unwrap();
    store
}

/// Drain a full backlog through the relay at different batch sizes.
fn bench_relay_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("relay_drain");
    group.throughput(Throughput::Elements(BACKLOG as u64));

    for batch_size in [10usize, 100, 500] {
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &batch_size| {
            b.iter_batched(
                || {
                    let config = RelayConfig::default().with_batch_size(batch_size);
                    Relay::new(seeded_store(BACKLOG), InMemoryBroker::new(), config)
                },
                |relay| {
                    let mut published = 0;
                    while published < BACKLOG {
                        published += relay.run_once().unwrap().published;
                    }
                    black_box(published)
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

/// Cost of a relay cycle that finds nothing to do.
fn bench_relay_idle_cycle(c: &mut Criterion) {
    let relay = Relay::new(InMemoryEventStore::new(), InMemoryBroker::new(), RelayConfig::default());
    c.bench_function("relay_idle_cycle", |b| {
        b.iter(|| black_box(relay.run_once().unwrap()));
    });
}

/// Outbox insert cost inside an in-memory transaction.
fn bench_outbox_insert(c: &mut Criterion) {
    let store = InMemoryEventStore::new();
    c.bench_function("outbox_insert_commit", |b| {
        b.iter(|| {
            let mut tx = store.begin();
            let event = tx
                .insert_event(EventInput::new("orders", "order.created", "application/json", b"{}".to_vec()))
                .unwrap();
            tx.commit().unwrap();
            black_box(event.id)
        });
    });
    black_box(store.count(&EventFilter::all()).unwrap());
}

criterion_group!(benches, bench_relay_drain, bench_relay_idle_cycle, bench_outbox_insert);
criterion_main!(benches);

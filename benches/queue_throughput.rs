use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::json;
use servegraph::envelope::EventEnvelope;
use servegraph::queue::{Queue, QueueCfg};
use tokio::runtime::Runtime;

const BATCH_SIZES: &[usize] = &[64, 256, 1024];
const CONSUMERS: usize = 4;

/// Pushes `batch` keyed envelopes through a queue while consumer tasks
/// drain it, then waits for every envelope to come back out.
async fn pump_batch(cfg: QueueCfg, batch: usize) {
    let (queue, consumers) = Queue::new(&cfg, CONSUMERS);
    let drains: Vec<_> = consumers
        .into_iter()
        .map(|consumer| {
            tokio::spawn(async move {
                let mut pulled = 0usize;
                while consumer.pull().await.is_ok() {
                    pulled += 1;
                }
                pulled
            })
        })
        .collect();

    for i in 0..batch {
        queue
            .enqueue(EventEnvelope::new(json!(i)).with_key(format!("key-{}", i % 16)))
            .await
            .expect("enqueue");
    }
    queue.close();

    let mut drained = 0usize;
    for drain in drains {
        drained += drain.await.expect("join");
    }
    assert_eq!(drained, batch);
}

fn queue_throughput(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");

    // Capacity covers the whole batch, so enqueue never waits.
    let mut group = c.benchmark_group("queue_pump");
    for &batch in BATCH_SIZES {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &size| {
            b.to_async(&runtime)
                .iter(|| pump_batch(QueueCfg::bounded(size), size));
        });
    }
    group.finish();

    // A small buffer forces producers onto the back-pressure path.
    let mut group = c.benchmark_group("queue_pump_bounded");
    for &batch in BATCH_SIZES {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &size| {
            b.to_async(&runtime)
                .iter(|| pump_batch(QueueCfg::bounded(8), size));
        });
    }
    group.finish();
}

criterion_group!(benches, queue_throughput);
criterion_main!(benches);

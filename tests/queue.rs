mod common;

use async_trait::async_trait;
use common::*;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use servegraph::config::EngineConfig;
use servegraph::context::Context;
use servegraph::engine::{DataflowEngine, EngineError, SyncEngine};
use servegraph::envelope::EventEnvelope;
use servegraph::graph::{CompiledGraph, GraphBuilder};
use servegraph::queue::{Queue, QueueCfg, QueueError, StreamSink};
use servegraph::steps::Step;

/********************
 * Queue mechanics
 ********************/

#[tokio::test]
async fn test_bounded_queue_applies_backpressure_without_loss() {
    let (queue, mut consumers) = Queue::new(&QueueCfg::bounded(1), 1);
    let consumer = consumers.remove(0);
    let queue = Arc::new(queue);

    let producer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            for i in 0..10 {
                queue.enqueue(EventEnvelope::stream("k", json!(i))).await.unwrap();
            }
        })
    };

    // A slow consumer forces the producer to wait on every slot; nothing
    // is dropped and arrival order is enqueue order.
    let mut seen = Vec::new();
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        seen.push(consumer.pull().await.unwrap().body);
    }
    producer.await.unwrap();
    let expected: Vec<Value> = (0..10).map(|i| json!(i)).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_enqueue_timeout_reports_the_wait() {
    let (queue, _consumers) = Queue::new(&QueueCfg::bounded(1), 1);
    queue
        .enqueue(EventEnvelope::stream("k", json!(0)))
        .await
        .unwrap();

    let wait = Duration::from_millis(25);
    let err = queue
        .enqueue_timeout(EventEnvelope::stream("k", json!(1)), wait)
        .await
        .unwrap_err();
    assert_eq!(err, QueueError::Timeout { waited: wait });
}

#[tokio::test]
async fn test_close_drains_buffered_envelopes_first() {
    let (queue, mut consumers) = Queue::new(&QueueCfg::bounded(4), 1);
    let consumer = consumers.remove(0);
    queue.enqueue(EventEnvelope::stream("k", json!(1))).await.unwrap();
    queue.enqueue(EventEnvelope::stream("k", json!(2))).await.unwrap();

    queue.close();
    queue.close(); // idempotent
    assert!(queue.is_closed());
    assert_eq!(
        queue
            .enqueue(EventEnvelope::stream("k", json!(3)))
            .await
            .unwrap_err(),
        QueueError::Closed
    );

    assert_eq!(consumer.pull().await.unwrap().body, json!(1));
    assert_eq!(consumer.pull().await.unwrap().body, json!(2));
    assert_eq!(consumer.pull().await.unwrap_err(), QueueError::Closed);
}

#[tokio::test]
async fn test_keyed_envelopes_stick_to_one_slot_in_order() {
    let (queue, consumers) = Queue::new(&QueueCfg::bounded(32), 2);
    let keys = ["alpha", "beta", "gamma", "delta"];
    for seq in 0..3 {
        for key in keys {
            queue
                .enqueue(EventEnvelope::stream(key, json!(format!("{key}-{seq}"))))
                .await
                .unwrap();
        }
    }
    queue.close();

    let mut per_slot: Vec<Vec<String>> = Vec::new();
    for consumer in &consumers {
        let mut drained = Vec::new();
        while let Ok(envelope) = consumer.pull().await {
            drained.push(envelope.body.as_str().unwrap().to_string());
        }
        per_slot.push(drained);
    }

    for key in keys {
        let holders: Vec<&Vec<String>> = per_slot
            .iter()
            .filter(|slot| slot.iter().any(|s| s.starts_with(key)))
            .collect();
        assert_eq!(holders.len(), 1, "key {key} spread across slots");
        let ordered: Vec<String> = holders[0]
            .iter()
            .filter(|s| s.starts_with(key))
            .cloned()
            .collect();
        let expected: Vec<String> = (0..3).map(|seq| format!("{key}-{seq}")).collect();
        assert_eq!(ordered, expected, "key {key} out of order");
    }
}

#[tokio::test]
async fn test_keyless_envelopes_round_robin_across_slots() {
    let (queue, consumers) = Queue::new(&QueueCfg::bounded(8), 2);
    for i in 0..4 {
        queue.enqueue(EventEnvelope::new(json!(i))).await.unwrap();
    }
    queue.close();

    let mut slots = Vec::new();
    for consumer in &consumers {
        let mut drained = Vec::new();
        while let Ok(envelope) = consumer.pull().await {
            drained.push(envelope.body.clone());
        }
        slots.push(drained);
    }
    assert_eq!(slots[0], vec![json!(0), json!(2)]);
    assert_eq!(slots[1], vec![json!(1), json!(3)]);
}

#[tokio::test]
async fn test_broadcast_copies_to_every_slot() {
    let (queue, consumers) = Queue::new(&QueueCfg::new().broadcast(), 2);
    for i in 0..3 {
        queue.enqueue(EventEnvelope::stream("k", json!(i))).await.unwrap();
    }
    queue.close();

    for consumer in &consumers {
        let mut drained = Vec::new();
        while let Ok(envelope) = consumer.pull().await {
            drained.push(envelope.body.clone());
        }
        assert_eq!(drained, vec![json!(0), json!(1), json!(2)]);
    }
}

#[test]
fn test_queue_errors_map_to_taxonomy_labels() {
    assert_eq!(EngineError::from(QueueError::Closed).label(), "QueueClosed");
    let timeout = QueueError::Timeout {
        waited: Duration::from_millis(5),
    };
    assert_eq!(EngineError::from(timeout).label(), "QueueTimeout");
}

/********************
 * Queue steps in graphs
 ********************/

#[tokio::test]
async fn test_live_engine_keeps_per_key_fifo_under_distribution() {
    let (log_a, rec_a) = collector();
    let (log_b, rec_b) = collector();
    let mut builder = GraphBuilder::new();
    builder
        .add_step(Step::queue("work", QueueCfg::new()))
        .unwrap()
        .add_step(Step::task("a", rec_a))
        .unwrap()
        .add_step(Step::task("b", rec_b))
        .unwrap()
        .connect("work", "a")
        .unwrap()
        .connect("work", "b")
        .unwrap();
    let graph = builder.compile().unwrap();

    let live = DataflowEngine::new(graph, Context::new());
    let keys = ["alpha", "beta", "gamma"];
    let mut handles = Vec::new();
    for seq in 0..4 {
        for key in keys {
            let envelope = EventEnvelope::stream(key, json!(format!("{key}-{seq}")));
            handles.push(live.submit(envelope).await.unwrap());
        }
    }
    for handle in handles {
        handle.join().await.unwrap();
    }
    live.shutdown().await;

    let slots = [log_a.lock().clone(), log_b.lock().clone()];
    for key in keys {
        let holders: Vec<&Vec<Value>> = slots
            .iter()
            .filter(|log| {
                log.iter()
                    .any(|v| v.as_str().is_some_and(|s| s.starts_with(key)))
            })
            .collect();
        assert_eq!(holders.len(), 1, "key {key} handled by both workers");
        let ordered: Vec<String> = holders[0]
            .iter()
            .filter_map(|v| v.as_str())
            .filter(|s| s.starts_with(key))
            .map(str::to_string)
            .collect();
        let expected: Vec<String> = (0..4).map(|seq| format!("{key}-{seq}")).collect();
        assert_eq!(ordered, expected, "key {key} reordered");
    }
}

#[tokio::test]
async fn test_broadcast_step_fans_copies_to_all_successors() {
    let (log_a, rec_a) = collector();
    let (log_b, rec_b) = collector();
    let mut builder = GraphBuilder::new();
    builder
        .add_step(Step::queue("fanout", QueueCfg::new().broadcast()))
        .unwrap()
        .add_step(Step::task("a", rec_a))
        .unwrap()
        .add_step(Step::task("b", rec_b))
        .unwrap()
        .connect("fanout", "a")
        .unwrap()
        .connect("fanout", "b")
        .unwrap();
    let graph = builder.compile().unwrap();

    let live = DataflowEngine::new(graph, Context::new());
    for i in 0..3 {
        live.process(EventEnvelope::stream("k", json!(i))).await.unwrap();
    }
    live.shutdown().await;

    let expected = vec![json!(0), json!(1), json!(2)];
    assert_eq!(*log_a.lock(), expected);
    assert_eq!(*log_b.lock(), expected);
}

#[tokio::test]
async fn test_full_queue_times_out_when_a_wait_bound_is_set() {
    let stall = Arc::new(Mutex::new(Vec::new()));
    let mut builder = GraphBuilder::new();
    builder
        .add_step(Step::queue("work", QueueCfg::new()))
        .unwrap()
        .add_step(Step::task("slow", SlowRecorder(stall, Duration::from_secs(60))))
        .unwrap()
        .connect("work", "slow")
        .unwrap();
    let graph = builder.compile().unwrap();

    let config = EngineConfig::new()
        .with_mailbox_capacity(1)
        .with_queue_capacity(1)
        .with_queue_wait_timeout(Duration::from_millis(50));
    let live = DataflowEngine::with_config(graph, Context::new(), config);

    // Saturate the stage: one envelope in the worker, one in its mailbox,
    // one held by the blocked puller, one buffered in the queue.
    let mut handles = Vec::new();
    for i in 0..4 {
        handles.push(live.submit(EventEnvelope::stream("k", json!(i))).await.unwrap());
    }
    let overflow = live
        .submit(EventEnvelope::stream("k", json!(4)))
        .await
        .unwrap();
    let err = overflow.join().await.unwrap_err();
    assert_eq!(err.label(), "QueueTimeout");
    // No shutdown here: the stalled worker is reaped with the runtime.
}

/********************
 * Stream sinks
 ********************/

struct RecordingSink(Arc<Mutex<Vec<Value>>>);

#[async_trait]
impl StreamSink for RecordingSink {
    async fn push(&self, envelope: &EventEnvelope) -> Result<(), QueueError> {
        self.0.lock().push(envelope.body.clone());
        Ok(())
    }
}

struct RejectingSink;

#[async_trait]
impl StreamSink for RejectingSink {
    async fn push(&self, _envelope: &EventEnvelope) -> Result<(), QueueError> {
        Err(QueueError::Stream {
            message: "stream unavailable".into(),
        })
    }
}

fn sink_graph(sink: impl StreamSink + 'static) -> Arc<CompiledGraph> {
    let mut builder = GraphBuilder::new();
    builder
        .add_step(Step::task("ingest", Tag("ingest")))
        .unwrap()
        .add_step(Step::queue("records", QueueCfg::new().with_sink(sink)))
        .unwrap()
        .add_step(Step::task("out", Tag("out")))
        .unwrap()
        .connect("ingest", "records")
        .unwrap()
        .connect("records", "out")
        .unwrap();
    builder.compile().unwrap()
}

#[tokio::test]
async fn test_both_engines_mirror_queue_traffic_into_the_sink() {
    let pushed = Arc::new(Mutex::new(Vec::new()));
    let graph = sink_graph(RecordingSink(Arc::clone(&pushed)));

    let sync = SyncEngine::new(Arc::clone(&graph), Context::new());
    let out = sync.process(EventEnvelope::new(json!(null))).await.unwrap();
    assert_eq!(out.body, json!(["ingest", "out"]));
    assert_eq!(*pushed.lock(), vec![json!(["ingest"])]);
    pushed.lock().clear();

    let live = DataflowEngine::new(graph, Context::new());
    let out = live.process(EventEnvelope::new(json!(null))).await.unwrap();
    live.shutdown().await;
    assert_eq!(out.body, json!(["ingest", "out"]));
    assert_eq!(*pushed.lock(), vec![json!(["ingest"])]);
}

#[tokio::test]
async fn test_sink_rejection_fails_the_envelope() {
    let graph = sink_graph(RejectingSink);
    let sync = SyncEngine::new(graph, Context::new());
    let err = sync.process(EventEnvelope::new(json!(null))).await.unwrap_err();
    assert!(matches!(
        &err,
        EngineError::Queue(QueueError::Stream { message }) if message.contains("unavailable")
    ));
}

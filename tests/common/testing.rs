#![allow(dead_code)]

use std::sync::Arc;

use servegraph::context::Context;
use servegraph::engine::{DataflowEngine, SyncEngine};
use servegraph::envelope::EventEnvelope;
use servegraph::graph::CompiledGraph;

/// Runs the same envelope through the offline and the live engine and
/// asserts the serialized responses match byte for byte.
pub async fn assert_engines_agree(
    graph: Arc<CompiledGraph>,
    envelope: EventEnvelope,
) -> EventEnvelope {
    let sync = SyncEngine::new(Arc::clone(&graph), Context::new());
    let offline = sync.process(envelope.clone()).await.unwrap();

    let live = DataflowEngine::new(graph, Context::new());
    let served = live.process(envelope).await.unwrap();
    live.shutdown().await;

    assert_eq!(
        serde_json::to_string(&offline).unwrap(),
        serde_json::to_string(&served).unwrap()
    );
    offline
}

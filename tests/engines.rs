mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;

use servegraph::context::Context;
use servegraph::dispatch::STEP_HEADER;
use servegraph::engine::{DataflowEngine, Engine, EngineError, SyncEngine};
use servegraph::envelope::EventEnvelope;
use servegraph::graph::GraphBuilder;
use servegraph::queue::QueueCfg;
use servegraph::steps::Step;

/********************
 * Engine equivalence
 ********************/

#[tokio::test]
async fn test_engines_agree_on_io_addressing() {
    let envelope = EventEnvelope::http("/score", "POST", json!({"req": {"body": 21}}));
    let out = assert_engines_agree(io_flow(), envelope).await;
    assert_eq!(out.body, json!({"req": {"body": 21}, "resp": 42}));
}

#[tokio::test]
async fn test_engines_agree_on_a_linear_pipeline() {
    let out = assert_engines_agree(tagged_pipeline(), EventEnvelope::new(json!(null))).await;
    assert_eq!(out.body, json!(["parse", "enrich", "score"]));
}

#[tokio::test]
async fn test_engines_agree_on_single_dispatch() {
    let out = assert_engines_agree(
        model_router(),
        EventEnvelope::http("/api/m2", "POST", json!({})),
    )
    .await;
    assert_eq!(out.body, json!(2));

    let out = assert_engines_agree(
        model_router(),
        EventEnvelope::http("/api/m1", "POST", json!({})),
    )
    .await;
    assert_eq!(out.body, json!(1));
}

#[tokio::test]
async fn test_engines_agree_on_ensemble_aggregation() {
    let out = assert_engines_agree(
        model_ensemble(),
        EventEnvelope::http("/api/all", "POST", json!({})),
    )
    .await;
    assert_eq!(out.body, json!({"m1": 1, "m2": 2}));
}

#[tokio::test]
async fn test_engines_agree_on_keyed_queue_distribution() {
    let mut builder = GraphBuilder::new();
    builder
        .add_step(Step::task("ingest", Tag("ingest")))
        .unwrap()
        .add_step(Step::queue("work", QueueCfg::new()))
        .unwrap()
        .add_step(Step::task("a", Tag("a")))
        .unwrap()
        .add_step(Step::task("b", Tag("b")))
        .unwrap()
        .connect("ingest", "work")
        .unwrap()
        .connect("work", "a")
        .unwrap()
        .connect("work", "b")
        .unwrap();
    let graph = builder.compile().unwrap();

    // Keyed records hash to the same worker in both engines.
    for key in ["alpha", "beta", "gamma"] {
        assert_engines_agree(Arc::clone(&graph), keyed(key, 0)).await;
    }
}

#[tokio::test]
async fn test_engines_agree_on_step_header_resumption() {
    let envelope =
        EventEnvelope::new(json!(["pre"])).with_header(STEP_HEADER, "enrich");
    let out = assert_engines_agree(tagged_pipeline(), envelope).await;
    assert_eq!(out.body, json!(["pre", "enrich", "score"]));
}

/********************
 * Error redirection
 ********************/

#[tokio::test]
async fn test_engines_agree_on_error_redirects() {
    let mut builder = GraphBuilder::new();
    builder
        .add_step(Step::task("score", Explode).with_on_error("fallback"))
        .unwrap()
        .add_step(Step::task("fallback", Fixed(json!("recovered"))))
        .unwrap();
    let graph = builder.compile().unwrap();

    let out = assert_engines_agree(graph, EventEnvelope::new(json!({"q": 7}))).await;
    assert_eq!(out.body, json!("recovered"));
    assert!(out.is_errored());
    let error = out.error.unwrap();
    assert_eq!(error.step, "score");
    assert_eq!(error.code, "StepExecutionError");
}

#[tokio::test]
async fn test_failure_without_a_handler_is_terminal_in_both() {
    let mut builder = GraphBuilder::new();
    builder.add_step(Step::task("score", Explode)).unwrap();
    let graph = builder.compile().unwrap();

    let sync = SyncEngine::new(Arc::clone(&graph), Context::new());
    let offline = sync.process(EventEnvelope::new(json!(1))).await.unwrap_err();

    let live = DataflowEngine::new(graph, Context::new());
    let served = live.process(EventEnvelope::new(json!(1))).await.unwrap_err();
    live.shutdown().await;

    assert_eq!(offline.label(), "StepExecutionError");
    assert_eq!(served.label(), "StepExecutionError");
    assert!(matches!(offline, EngineError::StepFailed { step, .. } if step == "score"));
}

#[tokio::test]
async fn test_live_engine_survives_per_envelope_failures() {
    let mut builder = GraphBuilder::new();
    builder.add_step(Step::task("double", Double)).unwrap();
    let graph = builder.compile().unwrap();

    let live = DataflowEngine::new(graph, Context::new());
    // A malformed body fails its own traversal only.
    let err = live
        .process(EventEnvelope::new(json!("not a number")))
        .await
        .unwrap_err();
    assert_eq!(err.label(), "StepExecutionError");

    let out = live.process(EventEnvelope::new(json!(21))).await.unwrap();
    assert_eq!(out.body, json!(42));
    live.shutdown().await;
}

/********************
 * Response selection
 ********************/

#[tokio::test]
async fn test_responder_beats_later_terminals() {
    let mut builder = GraphBuilder::new();
    builder
        .add_step(Step::task("parse", Tag("parse")))
        .unwrap()
        .add_step(Step::task("answer", Fixed(json!("done"))).respond())
        .unwrap()
        .add_step(Step::task("audit", Fixed(json!("audited"))))
        .unwrap()
        .connect("parse", "answer")
        .unwrap()
        .connect("parse", "audit")
        .unwrap();
    let graph = builder.compile().unwrap();

    let out = assert_engines_agree(graph, EventEnvelope::new(json!(null))).await;
    assert_eq!(out.body, json!("done"));
}

#[tokio::test]
async fn test_latest_declared_terminal_breaks_fan_out_ties() {
    let mut builder = GraphBuilder::new();
    builder
        .add_step(Step::task("parse", Tag("parse")))
        .unwrap()
        .add_step(Step::task("b", Fixed(json!("b"))))
        .unwrap()
        .add_step(Step::task("c", Fixed(json!("c"))))
        .unwrap()
        .connect("parse", "b")
        .unwrap()
        .connect("parse", "c")
        .unwrap();
    let graph = builder.compile().unwrap();

    let out = assert_engines_agree(graph, EventEnvelope::new(json!(null))).await;
    assert_eq!(out.body, json!("c"));
}

/********************
 * Shared engine surface
 ********************/

#[tokio::test]
async fn test_both_engines_serve_through_the_trait_object() {
    let graph = io_flow();
    let engines: Vec<Box<dyn Engine>> = vec![
        Box::new(SyncEngine::new(Arc::clone(&graph), Context::new())),
        Box::new(DataflowEngine::new(graph, Context::new())),
    ];

    for engine in &engines {
        let out = engine
            .run(EventEnvelope::http("/score", "POST", json!({"req": {"body": 5}})))
            .await
            .unwrap();
        assert_eq!(out.body, json!({"req": {"body": 5}, "resp": 10}));
    }
}

#![allow(dead_code)]

use serde_json::json;
use std::sync::Arc;

use servegraph::envelope::EventEnvelope;
use servegraph::graph::{CompiledGraph, GraphBuilder, Topology};
use servegraph::router::Router;
use servegraph::steps::Step;

use super::handlers::{Double, Fixed, Tag};

/// The io-addressing example flow: one task reading `req.body` and
/// writing its result under `resp`.
pub fn io_flow() -> Arc<CompiledGraph> {
    let mut builder = GraphBuilder::new();
    builder
        .add_step(
            Step::task("double", Double)
                .with_input_path("req.body")
                .with_result_path("resp"),
        )
        .unwrap();
    builder.compile().unwrap()
}

/// Three tagging stages in a row; the terminal body is the visit order.
pub fn tagged_pipeline() -> Arc<CompiledGraph> {
    let mut builder = GraphBuilder::new();
    builder.add_step(Step::task("parse", Tag("parse"))).unwrap();
    builder.add_step(Step::task("enrich", Tag("enrich"))).unwrap();
    builder.add_step(Step::task("score", Tag("score"))).unwrap();
    builder.connect("parse", "enrich").unwrap();
    builder.connect("enrich", "score").unwrap();
    builder.compile().unwrap()
}

/// Router-topology graph with two single-dispatch model routes.
pub fn model_router() -> Arc<CompiledGraph> {
    let router = Router::new()
        .with_route("m1", Step::task("m1", Fixed(json!(1))))
        .with_route("m2", Step::task("m2", Fixed(json!(2))));
    let mut builder = GraphBuilder::new();
    builder.set_topology(Topology::Router).unwrap();
    builder.add_step(Step::router("api", router)).unwrap();
    builder.compile().unwrap()
}

/// Router-topology graph with an ensemble over the same two models.
pub fn model_ensemble() -> Arc<CompiledGraph> {
    let router = Router::ensemble()
        .with_route("m1", Step::task("m1", Fixed(json!(1))))
        .with_route("m2", Step::task("m2", Fixed(json!(2))));
    let mut builder = GraphBuilder::new();
    builder.set_topology(Topology::Router).unwrap();
    builder.add_step(Step::router("api", router)).unwrap();
    builder.compile().unwrap()
}

/// A keyed stream record.
pub fn keyed(key: &str, n: i64) -> EventEnvelope {
    EventEnvelope::stream(key, json!(n))
}

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use serde_json::Value;
use servegraph::context::Context;
use servegraph::graph::{GraphBuilder, Topology};
use servegraph::router::Router;
use servegraph::steps::{Handler, Step, StepError};

/// A no-op handler for benchmarking graph structure operations.
struct BenchHandler;

#[async_trait::async_trait]
impl Handler for BenchHandler {
    async fn handle(&self, input: Value, _: &Context) -> Result<Value, StepError> {
        Ok(input)
    }
}

/// step_0 -> step_1 -> ... -> step_{n-1}
fn linear_pipeline(steps: usize) -> GraphBuilder {
    let mut builder = GraphBuilder::new();
    for i in 0..steps {
        builder
            .add_step(Step::task(format!("step_{i}"), BenchHandler))
            .expect("add step");
    }
    for i in 0..steps.saturating_sub(1) {
        builder
            .connect(format!("step_{i}"), format!("step_{}", i + 1))
            .expect("connect");
    }
    builder
}

/// source -> [width parallel sinks]
fn fanout(width: usize) -> GraphBuilder {
    let mut builder = GraphBuilder::new();
    builder
        .add_step(Step::task("source", BenchHandler))
        .expect("add source");
    for i in 0..width {
        builder
            .add_step(Step::task(format!("sink_{i}"), BenchHandler))
            .expect("add sink");
        builder
            .connect("source", format!("sink_{i}"))
            .expect("connect");
    }
    builder
}

/// A single router step carrying `routes` child routes.
fn wide_router(routes: usize) -> GraphBuilder {
    let mut router = Router::new();
    for i in 0..routes {
        router = router.with_route(
            format!("r{i}"),
            Step::task(format!("r{i}_step"), BenchHandler),
        );
    }
    let mut builder = GraphBuilder::new();
    builder.set_topology(Topology::Router).expect("topology");
    builder
        .add_step(Step::router("api", router))
        .expect("add router");
    builder
}

/// A linear pipeline closed back on itself; compilation must reject it.
fn ring(steps: usize) -> GraphBuilder {
    let mut builder = linear_pipeline(steps);
    builder
        .connect(format!("step_{}", steps - 1), "step_0")
        .expect("close ring");
    builder
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_compile");

    for size in [16, 64, 256] {
        group.bench_with_input(BenchmarkId::new("linear", size), &size, |b, &size| {
            b.iter(|| linear_pipeline(size).compile().expect("compile"));
        });
    }

    for width in [16, 64, 256] {
        group.bench_with_input(BenchmarkId::new("fanout", width), &width, |b, &width| {
            b.iter(|| fanout(width).compile().expect("compile"));
        });
    }

    for routes in [8, 64, 256] {
        group.bench_with_input(BenchmarkId::new("router", routes), &routes, |b, &routes| {
            b.iter(|| wide_router(routes).compile().expect("compile"));
        });
    }

    group.finish();
}

fn bench_cycle_rejection(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_cycle_rejection");

    for size in [16, 64, 256] {
        group.bench_with_input(BenchmarkId::new("ring", size), &size, |b, &size| {
            b.iter(|| ring(size).compile().expect_err("ring must not compile"));
        });
    }

    group.finish();
}

fn bench_recompile(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_recompile");

    // Once frozen, compile() only clones the shared graph handle.
    let mut builder = linear_pipeline(64);
    builder.compile().expect("compile");
    group.bench_function("frozen_linear_64", |b| {
        b.iter(|| builder.compile().expect("recompile"));
    });

    group.finish();
}

criterion_group!(benches, bench_compile, bench_cycle_rejection, bench_recompile);
criterion_main!(benches);

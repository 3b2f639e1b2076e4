//! # Servegraph: composable model-serving dataflow graphs
//!
//! Servegraph wires named steps into serving topologies — a flat router
//! fanning requests out to model steps, or a full DAG with queues between
//! function units — and drives event envelopes through them.
//!
//! ## Core Concepts
//!
//! - **Envelopes**: every request, stream record, or manual trigger
//!   travels as an [`envelope::EventEnvelope`] with a JSON body, routing
//!   path, optional partition key, and transport headers
//! - **Steps**: named units of work — tasks wrapping a [`steps::Handler`],
//!   routers, queues, and error handlers — each with its own io
//!   addressing (`input_path`, `result_path`, `full_event`) into the body
//! - **Graphs**: a mutable [`graph::GraphBuilder`] compiles into an
//!   immutable, validated [`graph::CompiledGraph`]; cycles, duplicates,
//!   unreachable steps, and illegal cross-function edges are compile
//!   errors, never runtime surprises
//! - **Engines**: [`engine::SyncEngine`] runs one envelope at a time for
//!   deterministic offline testing; [`engine::DataflowEngine`] runs a
//!   worker per step for live concurrent serving — identical results for
//!   the same single-key, non-ensemble graph
//! - **Queues and dispatch**: bounded [`queue::Queue`]s buffer between
//!   pipeline stages with per-key FIFO, and the
//!   [`dispatch::DistributedDispatcher`] carries envelopes to steps owned
//!   by other function units
//!
//! ## Quick Start
//!
//! ```
//! use async_trait::async_trait;
//! use serde_json::{Value, json};
//! use servegraph::context::Context;
//! use servegraph::engine::SyncEngine;
//! use servegraph::envelope::EventEnvelope;
//! use servegraph::graph::GraphBuilder;
//! use servegraph::steps::{Handler, Step, StepError};
//!
//! struct Double;
//!
//! #[async_trait]
//! impl Handler for Double {
//!     async fn handle(&self, input: Value, _ctx: &Context) -> Result<Value, StepError> {
//!         let n = input.as_i64().ok_or(StepError::MissingInput { what: "number" })?;
//!         Ok(json!(n * 2))
//!     }
//! }
//!
//! fn main() -> miette::Result<()> {
//!     let mut builder = GraphBuilder::new();
//!     builder.add_step(
//!         Step::task("double", Double)
//!             .with_input_path("n")
//!             .with_result_path("resp"),
//!     )?;
//!     let graph = builder.compile()?;
//!
//!     let runtime = tokio::runtime::Builder::new_current_thread()
//!         .enable_all()
//!         .build()
//!         .expect("runtime");
//!     runtime.block_on(async {
//!         let engine = SyncEngine::new(graph, Context::new());
//!         let out = engine
//!             .process(EventEnvelope::new(json!({"n": 21})))
//!             .await
//!             .unwrap();
//!         assert_eq!(out.body, json!({"n": 21, "resp": 42}));
//!     });
//!     Ok(())
//! }
//! ```
//!
//! ## Routing
//!
//! A router step keys off the path segment after its prefix, or runs every
//! route concurrently in ensemble mode and aggregates the outputs by route
//! name:
//!
//! ```
//! use servegraph::graph::{GraphBuilder, Topology};
//! use servegraph::router::Router;
//! use servegraph::steps::{RemoteSpec, Step};
//!
//! fn main() -> miette::Result<()> {
//!     let router = Router::new()
//!         .with_route("fraud", Step::remote_task("fraud", RemoteSpec::url("http://models/fraud")))
//!         .with_route("churn", Step::remote_task("churn", RemoteSpec::url("http://models/churn")));
//!
//!     let mut builder = GraphBuilder::new();
//!     builder.set_topology(Topology::Router)?;
//!     builder.add_step(Step::router("api", router))?;
//!     let graph = builder.compile()?;
//!
//!     assert_eq!(graph.topology(), Topology::Router);
//!     assert_eq!(graph.entries(), ["api"]);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Guide
//!
//! - [`envelope`] - The event envelope and its error stamp
//! - [`paths`] - Dot-path extraction and merging over JSON bodies
//! - [`steps`] - Handlers, step declarations, and the handler registry
//! - [`router`] - Route tables and dispatch strategies
//! - [`queue`] - Bounded queues with back-pressure and per-key FIFO
//! - [`graph`] - Builder, compile-time validation, compiled graphs
//! - [`engine`] - The sync and dataflow execution engines
//! - [`dispatch`] - Cross-function transport and retry policy
//! - [`context`] - Step-visible parameters, secrets, and resources
//! - [`config`] - Engine tuning knobs and environment loading
//! - [`telemetry`] - Tracing and panic-report bootstrap

pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod envelope;
pub mod graph;
pub mod paths;
pub mod queue;
pub mod router;
pub mod steps;
pub mod telemetry;

//! Graph definition, validation, and compilation.
//!
//! A serving graph is assembled with [`GraphBuilder`] — steps, edges,
//! topology, child functions — and compiled into an immutable
//! [`CompiledGraph`] that any number of concurrent traversals share without
//! locking. Compilation validates the whole structure up front: unique
//! names, resolvable references, acyclicity (with the offending back edge
//! reported), reachability from the entry points, addressing conflicts,
//! and the rule that edges crossing function units must leave from a queue
//! step.
//!
//! The first successful compile freezes the topology; later mutation fails
//! with [`GraphError::TopologyImmutable`] and recompiling returns the same
//! compiled value.
//!
//! # Quick Start
//!
//! ```
//! use servegraph::graph::GraphBuilder;
//! use servegraph::steps::Step;
//! # use servegraph::context::Context;
//! # use servegraph::steps::{Handler, StepError};
//! # use async_trait::async_trait;
//! # use serde_json::Value;
//! # struct MyHandler;
//! # #[async_trait]
//! # impl Handler for MyHandler {
//! #     async fn handle(&self, input: Value, _ctx: &Context) -> Result<Value, StepError> {
//! #         Ok(input)
//! #     }
//! # }
//!
//! # fn main() -> Result<(), servegraph::graph::GraphError> {
//! let mut builder = GraphBuilder::new();
//! builder
//!     .add_step(Step::task("parse", MyHandler).with_input_path("req.body"))?
//!     .add_step(Step::task("score", MyHandler).with_result_path("resp"))?
//!     .connect("parse", "score")?;
//! let graph = builder.compile()?;
//!
//! assert_eq!(graph.terminals(), ["score"]);
//! # Ok(())
//! # }
//! ```

mod builder;
mod compiled;
mod errors;
mod validate;

pub use builder::GraphBuilder;
pub use compiled::{CompiledGraph, FunctionSpec, Topology};
pub use errors::GraphError;

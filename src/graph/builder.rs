//! GraphBuilder: incremental assembly of a serving graph.
//!
//! The builder collects steps, edges, topology, and child function
//! declarations, then [`compile`](GraphBuilder::compile)s them into an
//! immutable [`CompiledGraph`]. The first successful compile freezes the
//! builder: later structural mutation fails with
//! [`GraphError::TopologyImmutable`], and recompiling returns the same
//! compiled value. A failed compile poisons the builder, which keeps
//! reporting that error — a graph that failed validation is not usable.

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::graph::compiled::{CompiledGraph, FunctionSpec, Topology};
use crate::graph::errors::GraphError;
use crate::graph::validate;
use crate::steps::{HandlerRegistry, Step};

enum BuilderState {
    Open,
    Frozen(Arc<CompiledGraph>),
    Poisoned(GraphError),
}

/// Builder for serving graphs.
///
/// Mutators take `&mut self` and return `Result<&mut Self, GraphError>` so
/// assembly chains with `?`, and so every mutation can observe the
/// frozen/poisoned state.
///
/// # Examples
///
/// ```
/// use servegraph::graph::{GraphBuilder, GraphError};
/// use servegraph::steps::Step;
/// # use servegraph::context::Context;
/// # use servegraph::steps::{Handler, StepError};
/// # use async_trait::async_trait;
/// # use serde_json::Value;
/// # struct Echo;
/// # #[async_trait]
/// # impl Handler for Echo {
/// #     async fn handle(&self, input: Value, _ctx: &Context) -> Result<Value, StepError> {
/// #         Ok(input)
/// #     }
/// # }
///
/// # fn main() -> Result<(), GraphError> {
/// let mut builder = GraphBuilder::new();
/// builder
///     .add_step(Step::task("validate", Echo))?
///     .add_step(Step::task("enrich", Echo))?
///     .connect("validate", "enrich")?;
///
/// let graph = builder.compile()?;
/// assert_eq!(graph.entries(), ["validate"]);
///
/// // The topology is frozen now.
/// assert!(matches!(
///     builder.add_step(Step::task("late", Echo)),
///     Err(GraphError::TopologyImmutable)
/// ));
/// // Recompiling is a no-op returning the same graph.
/// assert!(std::sync::Arc::ptr_eq(&graph, &builder.compile()?));
/// # Ok(())
/// # }
/// ```
pub struct GraphBuilder {
    steps: Vec<Step>,
    edges: FxHashMap<String, Vec<String>>,
    topology: Topology,
    functions: FxHashMap<String, FunctionSpec>,
    registry: HandlerRegistry,
    state: BuilderState,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    /// Creates an empty flow-topology builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            edges: FxHashMap::default(),
            topology: Topology::default(),
            functions: FxHashMap::default(),
            registry: HandlerRegistry::new(),
            state: BuilderState::Open,
        }
    }

    /// Creates a builder that resolves named handlers through `registry`.
    #[must_use]
    pub fn with_registry(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            ..Self::new()
        }
    }

    fn ensure_open(&self) -> Result<(), GraphError> {
        match &self.state {
            BuilderState::Open => Ok(()),
            BuilderState::Frozen(_) => Err(GraphError::TopologyImmutable),
            BuilderState::Poisoned(error) => Err(error.clone()),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.name() == name)
    }

    /// Appends a step after the most recently added one.
    pub fn add_step(&mut self, step: Step) -> Result<&mut Self, GraphError> {
        self.ensure_open()?;
        self.steps.push(step);
        Ok(self)
    }

    /// Inserts a step directly after the named sibling.
    pub fn add_step_after(&mut self, step: Step, after: &str) -> Result<&mut Self, GraphError> {
        self.ensure_open()?;
        let pos = self.position(after).ok_or_else(|| GraphError::UnknownStep {
            name: after.to_string(),
            referenced_by: step.name().to_string(),
        })?;
        self.steps.insert(pos + 1, step);
        Ok(self)
    }

    /// Inserts a step directly before the named sibling.
    pub fn add_step_before(&mut self, step: Step, before: &str) -> Result<&mut Self, GraphError> {
        self.ensure_open()?;
        let pos = self
            .position(before)
            .ok_or_else(|| GraphError::UnknownStep {
                name: before.to_string(),
                referenced_by: step.name().to_string(),
            })?;
        self.steps.insert(pos, step);
        Ok(self)
    }

    /// Appends a task step whose handler is resolved by name through the
    /// builder's [`HandlerRegistry`], constructed with `params`.
    pub fn add_named_task(
        &mut self,
        name: impl Into<String>,
        handler: &str,
        params: Value,
    ) -> Result<&mut Self, GraphError> {
        self.ensure_open()?;
        let built = self.registry.build(handler, &params)?;
        let mut step = Step::task_shared(name, built);
        step.params = params;
        self.steps.push(step);
        Ok(self)
    }

    /// Adds an edge. Both endpoints are resolved at compile time, so
    /// forward references are fine. Duplicate edges are ignored.
    pub fn connect(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Result<&mut Self, GraphError> {
        self.ensure_open()?;
        let (from, to) = (from.into(), to.into());
        let targets = self.edges.entry(from).or_default();
        if !targets.contains(&to) {
            targets.push(to);
        }
        Ok(self)
    }

    /// Declares the graph's topology (default [`Topology::Flow`]).
    pub fn set_topology(&mut self, topology: Topology) -> Result<&mut Self, GraphError> {
        self.ensure_open()?;
        self.topology = topology;
        Ok(self)
    }

    /// Declares a child function unit steps may be assigned to with
    /// [`Step::on_function`].
    pub fn add_child_function(
        &mut self,
        name: impl Into<String>,
        spec: FunctionSpec,
    ) -> Result<&mut Self, GraphError> {
        self.ensure_open()?;
        self.functions.insert(name.into(), spec);
        Ok(self)
    }

    /// Steps in insertion order, as assembled so far. Empty once frozen;
    /// the parts have moved into the compiled graph.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    /// Edges as `(from, to)` pairs in declaration order per source. Empty
    /// once frozen.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.steps.iter().flat_map(|step| {
            self.edges
                .get(step.name())
                .into_iter()
                .flatten()
                .map(move |to| (step.name(), to.as_str()))
        })
    }

    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// True once a compile succeeded.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        matches!(self.state, BuilderState::Frozen(_))
    }

    /// Validates the assembled graph and freezes the topology.
    ///
    /// Idempotent: recompiling a frozen builder returns the same
    /// [`CompiledGraph`]. A validation failure poisons the builder and is
    /// returned again on every later call.
    #[instrument(skip(self), err)]
    pub fn compile(&mut self) -> Result<Arc<CompiledGraph>, GraphError> {
        match &self.state {
            BuilderState::Frozen(graph) => return Ok(Arc::clone(graph)),
            BuilderState::Poisoned(error) => return Err(error.clone()),
            BuilderState::Open => {}
        }

        let steps = std::mem::take(&mut self.steps);
        let edges = std::mem::take(&mut self.edges);
        let functions = std::mem::take(&mut self.functions);

        match validate::compile(steps, edges, self.topology, functions) {
            Ok(compiled) => {
                let compiled = Arc::new(compiled);
                debug!(
                    topology = %compiled.topology(),
                    steps = compiled.len(),
                    entries = compiled.entries().len(),
                    "graph compiled"
                );
                self.state = BuilderState::Frozen(Arc::clone(&compiled));
                Ok(compiled)
            }
            Err(error) => {
                self.state = BuilderState::Poisoned(error.clone());
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for GraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            BuilderState::Open => "open",
            BuilderState::Frozen(_) => "frozen",
            BuilderState::Poisoned(_) => "poisoned",
        };
        f.debug_struct("GraphBuilder")
            .field("steps", &self.steps.len())
            .field("topology", &self.topology)
            .field("functions", &self.functions.len())
            .field("state", &state)
            .finish()
    }
}

// Inline tests live in tests/graph.rs alongside the validation suites.

//! The immutable, validated form of a serving graph.
//!
//! A [`CompiledGraph`] is produced once by
//! [`GraphBuilder::compile`](crate::graph::GraphBuilder::compile) and never
//! changes afterwards. Engines share it freely across concurrent traversals
//! without locking; every accessor is a plain read.

use rustc_hash::FxHashMap;
use std::fmt;

use crate::steps::Step;

/// Shape of a compiled graph.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Topology {
    /// A single router step dispatching to its routes; no edges.
    Router,
    /// A general DAG of steps connected by edges.
    #[default]
    Flow,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Router => f.write_str("router"),
            Self::Flow => f.write_str("flow"),
        }
    }
}

/// Deployment description of a child function unit.
///
/// The endpoint is optional at build time; when absent, the dispatcher
/// falls back to the context's endpoint resolver at runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FunctionSpec {
    endpoint: Option<String>,
}

impl FunctionSpec {
    /// A function whose endpoint is resolved at runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A function reachable at a fixed endpoint.
    #[must_use]
    pub fn at(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

/// A validated, frozen serving graph.
///
/// Step order follows insertion order, which drives the deterministic
/// defaults: sync traversal visits successors in declared edge order, and
/// when several terminal steps are reached the latest one in insertion
/// order supplies the response.
pub struct CompiledGraph {
    steps: Vec<Step>,
    index: FxHashMap<String, usize>,
    edges: FxHashMap<String, Vec<String>>,
    topology: Topology,
    functions: FxHashMap<String, FunctionSpec>,
    entries: Vec<String>,
    terminals: Vec<String>,
}

impl CompiledGraph {
    pub(crate) fn from_parts(
        steps: Vec<Step>,
        index: FxHashMap<String, usize>,
        edges: FxHashMap<String, Vec<String>>,
        topology: Topology,
        functions: FxHashMap<String, FunctionSpec>,
        entries: Vec<String>,
        terminals: Vec<String>,
    ) -> Self {
        Self {
            steps,
            index,
            edges,
            topology,
            functions,
            entries,
            terminals,
        }
    }

    #[must_use]
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Steps in insertion order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Looks a step up by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.index.get(name).map(|&pos| &self.steps[pos])
    }

    /// Insertion position of a step, used for deterministic tie-breaking.
    #[must_use]
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Successors of a step in declared edge order.
    #[must_use]
    pub fn successors(&self, name: &str) -> &[String] {
        self.edges.get(name).map_or(&[], Vec::as_slice)
    }

    /// Entry steps: the router in router topology, otherwise every step
    /// with no inbound edge or on_error reference.
    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Steps with no outgoing edges, in insertion order.
    #[must_use]
    pub fn terminals(&self) -> &[String] {
        &self.terminals
    }

    #[must_use]
    pub fn is_terminal(&self, name: &str) -> bool {
        self.terminals.iter().any(|t| t == name)
    }

    /// Declared child function units.
    #[must_use]
    pub fn functions(&self) -> &FxHashMap<String, FunctionSpec> {
        &self.functions
    }

    /// Fixed endpoint declared for a child function, if any.
    #[must_use]
    pub fn function_endpoint(&self, function: &str) -> Option<&str> {
        self.functions.get(function).and_then(FunctionSpec::endpoint)
    }

    /// Steps owned by one function unit, in insertion order.
    pub fn steps_in_function<'a>(&'a self, function: &'a str) -> impl Iterator<Item = &'a Step> {
        self.steps
            .iter()
            .filter(move |step| step.effective_function() == function)
    }
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("topology", &self.topology)
            .field("steps", &self.steps.len())
            .field("entries", &self.entries)
            .field("terminals", &self.terminals)
            .field("functions", &self.functions.len())
            .finish()
    }
}

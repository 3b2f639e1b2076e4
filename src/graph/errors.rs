//! Build-time graph errors.
//!
//! Everything here is fatal at compile or mutation time: a graph that
//! produced one of these is not runnable (and a failed compile poisons the
//! builder so later calls keep returning the same error).

use miette::Diagnostic;
use thiserror::Error;

use crate::steps::RegistryError;

/// Errors raised while assembling or compiling a serving graph.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum GraphError {
    /// The graph has no steps at all.
    #[error("graph has no steps")]
    #[diagnostic(
        code(servegraph::graph::empty),
        help("add at least one step before compiling")
    )]
    EmptyGraph,

    /// Two steps share a name.
    #[error("duplicate step name '{name}'")]
    #[diagnostic(
        code(servegraph::graph::duplicate_step),
        help("step names must be unique within a graph")
    )]
    DuplicateStepName { name: String },

    /// An edge, placement hint, or on_error reference names a step that
    /// does not exist.
    #[error("'{referenced_by}' references unknown step '{name}'")]
    #[diagnostic(code(servegraph::graph::unknown_step))]
    UnknownStep { name: String, referenced_by: String },

    /// The graph contains a cycle; `from -> to` is the offending back edge.
    #[error("graph contains a cycle: back edge '{from}' -> '{to}'")]
    #[diagnostic(
        code(servegraph::graph::cycle),
        help("serving graphs are DAGs; break the cycle or route through an external trigger")
    )]
    CyclicGraph { from: String, to: String },

    /// A step cannot be reached from any entry point.
    #[error("step '{name}' is unreachable from the graph's entry points")]
    #[diagnostic(
        code(servegraph::graph::unreachable),
        help("connect the step or reference it from a router/on_error, or remove it")
    )]
    UnreachableStep { name: String },

    /// An edge crosses function units without going through a queue step.
    #[error("edge '{from}' -> '{to}' crosses function units without a queue")]
    #[diagnostic(
        code(servegraph::graph::cross_function),
        help("steps owned by different functions may only be linked through a queue step")
    )]
    InvalidCrossFunctionEdge { from: String, to: String },

    /// Structural mutation was attempted after the first successful compile.
    #[error("graph topology is immutable after compile")]
    #[diagnostic(
        code(servegraph::graph::immutable),
        help("build a new GraphBuilder; compiled graphs never change shape")
    )]
    TopologyImmutable,

    /// A step combines `full_event` with input/result path addressing.
    #[error("step '{step}' sets full_event together with input/result paths")]
    #[diagnostic(
        code(servegraph::graph::config_conflict),
        help("full_event hands the whole envelope over; path addressing does not apply")
    )]
    ConfigConflict { step: String },

    /// A router declares two routes under one name.
    #[error("router '{router}' declares route '{route}' more than once")]
    #[diagnostic(code(servegraph::graph::duplicate_route))]
    DuplicateRoute { router: String, route: String },

    /// A step or remote target names a function unit the graph never
    /// declared.
    #[error("step '{step}' references undeclared function '{function}'")]
    #[diagnostic(
        code(servegraph::graph::unknown_function),
        help("declare the function with add_child_function before compiling")
    )]
    UnknownFunction { function: String, step: String },

    /// The declared topology does not match the graph's shape.
    #[error("topology mismatch: {detail}")]
    #[diagnostic(code(servegraph::graph::topology))]
    TopologyMismatch { detail: String },

    /// A named handler could not be resolved or constructed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),
}

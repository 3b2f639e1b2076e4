//! Execution engines: two scheduling disciplines over one semantics.
//!
//! [`SyncEngine`] drives one envelope at a time to termination, depth
//! first along declared edge order — strictly deterministic, made for
//! offline testing. [`DataflowEngine`] runs every step as an independent
//! worker pulling from a bounded mailbox, processing many envelopes
//! concurrently while preserving per-key FIFO order.
//!
//! For the same graph and the same single-key, non-ensemble input both
//! engines produce identical terminal envelopes, so the sync engine can
//! stand in for the live one in tests.
//!
//! Every envelope walks the same state machine, surfaced through
//! [`TraversalPhase`] in the logs:
//!
//! ```text
//! created -> entered(step) -> (running -> advanced | queued | routed | errored)* -> terminated
//! ```

mod dataflow;
mod executor;
mod sync;

pub use dataflow::{DataflowEngine, RunHandle};
pub use sync::SyncEngine;

use async_trait::async_trait;
use miette::Diagnostic;
use std::fmt;
use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::envelope::EventEnvelope;
use crate::paths::PathError;
use crate::queue::QueueError;
use crate::steps::StepError;

/// Header carrying the run id an envelope belongs to, stamped at submit
/// time so envelopes re-associate with their run after queue transit.
pub const RUN_HEADER: &str = "x-servegraph-run";

/// Common surface of both engines: drive one envelope to its terminal
/// result.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn run(&self, envelope: EventEnvelope) -> Result<EventEnvelope, EngineError>;
}

// =============================================================================
// Traversal state machine
// =============================================================================

/// Phase of an envelope's traversal, used in structured logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraversalPhase {
    Created,
    Entered,
    Running,
    Advanced,
    Queued,
    Routed,
    Errored,
    Terminated,
}

impl fmt::Display for TraversalPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Created => "created",
            Self::Entered => "entered",
            Self::Running => "running",
            Self::Advanced => "advanced",
            Self::Queued => "queued",
            Self::Routed => "routed",
            Self::Errored => "errored",
            Self::Terminated => "terminated",
        };
        f.write_str(phase)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Runtime errors local to a single envelope's traversal.
///
/// None of these affect other in-flight envelopes or the engine's
/// liveness; they surface as that envelope's terminal result unless an
/// `on_error` step intercepts them.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    /// A step's handler raised; wrapped with the originating step name.
    #[error("step '{step}' failed: {source}")]
    #[diagnostic(code(servegraph::engine::step_failed))]
    StepFailed {
        step: String,
        #[source]
        source: StepError,
    },

    /// No route matched the envelope's path segment.
    #[error("no route for '{route}'")]
    #[diagnostic(
        code(servegraph::engine::route_not_found),
        help("check the router's prefix and the path's route segment against the declared routes")
    )]
    RouteNotFound { route: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Dispatch(#[from] DispatchError),

    /// The run was cancelled; only this envelope's traversal stops.
    #[error("run cancelled")]
    #[diagnostic(code(servegraph::engine::cancelled))]
    Cancelled,

    /// The engine has shut down and accepts no further envelopes.
    #[error("engine is shut down")]
    #[diagnostic(code(servegraph::engine::closed))]
    Closed,

    /// A resumption target names a step the graph does not contain.
    #[error("unknown step '{name}'")]
    #[diagnostic(code(servegraph::engine::unknown_step))]
    UnknownStep { name: String },

    /// The engine's function unit owns none of the graph's entry steps.
    #[error("function '{function}' owns no entry steps")]
    #[diagnostic(
        code(servegraph::engine::no_entries),
        help("submit to the function owning the entries, or resume a specific step with process_from")
    )]
    NoEntrySteps { function: String },

    /// A worker task died without delivering a result.
    #[error("worker failed: {message}")]
    #[diagnostic(code(servegraph::engine::join))]
    Join { message: String },
}

impl EngineError {
    /// Short taxonomy name stamped into an envelope's error field when the
    /// failure is redirected to an `on_error` step.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::StepFailed { .. } => "StepExecutionError",
            Self::RouteNotFound { .. } => "RouteNotFound",
            Self::Path(_) => "PathNotFound",
            Self::Queue(QueueError::Closed) => "QueueClosed",
            Self::Queue(QueueError::Timeout { .. }) => "QueueTimeout",
            Self::Queue(QueueError::Stream { .. }) => "StepExecutionError",
            Self::Dispatch(DispatchError::Remote { .. }) => "RemoteExecutionError",
            Self::Dispatch(_) => "EndpointUnreachable",
            Self::Cancelled => "Cancelled",
            Self::Closed => "EngineClosed",
            Self::UnknownStep { .. } | Self::NoEntrySteps { .. } => "UnknownStep",
            Self::Join { .. } => "StepExecutionError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Labels follow the runtime error taxonomy.
    fn test_error_labels() {
        let failed = EngineError::StepFailed {
            step: "score".into(),
            source: StepError::Failed("boom".into()),
        };
        assert_eq!(failed.label(), "StepExecutionError");

        assert_eq!(
            EngineError::RouteNotFound { route: "x".into() }.label(),
            "RouteNotFound"
        );
        assert_eq!(EngineError::Queue(QueueError::Closed).label(), "QueueClosed");
        assert_eq!(
            EngineError::Queue(QueueError::Timeout {
                waited: std::time::Duration::from_secs(1)
            })
            .label(),
            "QueueTimeout"
        );
        assert_eq!(
            EngineError::Dispatch(DispatchError::Remote {
                endpoint: "http://x".into(),
                message: "raised".into()
            })
            .label(),
            "RemoteExecutionError"
        );
        assert_eq!(
            EngineError::Dispatch(DispatchError::NoTransport).label(),
            "EndpointUnreachable"
        );
    }

    #[test]
    /// Phases render lowercase for log fields.
    fn test_phase_display() {
        assert_eq!(TraversalPhase::Entered.to_string(), "entered");
        assert_eq!(TraversalPhase::Terminated.to_string(), "terminated");
    }
}

//! The handler capability implemented by task and error-handler steps.

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::context::Context;
use crate::envelope::EventEnvelope;

// ============================================================================
// Core Trait
// ============================================================================

/// Core capability trait for step logic.
///
/// A `Handler` is a single unit of processing: it receives the step's input
/// (selected from the envelope body per the step's `input_path`), does its
/// work, and returns the value the engine merges back per `result_path`.
///
/// Steps configured with `full_event` bypass body addressing entirely and go
/// through [`handle_envelope`](Handler::handle_envelope), which sees and
/// returns the whole envelope. The default implementation of
/// `handle_envelope` simply applies [`handle`](Handler::handle) to the body,
/// so most implementors only write `handle`.
///
/// # Design Principles
///
/// - **Stateless**: handlers should be deterministic over their input
/// - **Focused**: one responsibility per handler
/// - **Explicit**: everything a handler needs arrives via the input value or
///   the [`Context`]; there is no ambient state
///
/// # Examples
///
/// ```
/// use servegraph::context::Context;
/// use servegraph::steps::{Handler, StepError};
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
///
/// struct Threshold;
///
/// #[async_trait]
/// impl Handler for Threshold {
///     async fn handle(&self, input: Value, ctx: &Context) -> Result<Value, StepError> {
///         let cutoff = ctx.param_or("cutoff", json!(0.5));
///         let score = input
///             .get("score")
///             .and_then(Value::as_f64)
///             .ok_or(StepError::MissingInput { what: "score" })?;
///         Ok(json!({"accepted": score >= cutoff.as_f64().unwrap_or(0.5)}))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync {
    /// Processes the step's input value and returns its result.
    async fn handle(&self, input: Value, ctx: &Context) -> Result<Value, StepError>;

    /// Processes the whole envelope; used when the step declares
    /// `full_event`. The default applies [`handle`](Handler::handle) to the
    /// body and keeps all other envelope fields.
    async fn handle_envelope(
        &self,
        envelope: EventEnvelope,
        ctx: &Context,
    ) -> Result<EventEnvelope, StepError> {
        let mut envelope = envelope;
        let body = std::mem::take(&mut envelope.body);
        let body = self.handle(body, ctx).await?;
        Ok(envelope.with_body(body))
    }
}

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Handler")
    }
}

/// Errors raised by handler execution.
///
/// These are fatal for the envelope being processed: the engine wraps them
/// with the originating step name and either routes the envelope to the
/// step's `on_error` handler or surfaces them as the traversal's terminal
/// error.
#[derive(Debug, Error, Diagnostic)]
pub enum StepError {
    /// Expected input data is missing from the step's input value.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(servegraph::steps::missing_input),
        help("Check the upstream step's result shape and this step's input_path.")
    )]
    MissingInput { what: &'static str },

    /// External provider or service error.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(servegraph::steps::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    #[diagnostic(code(servegraph::steps::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Input validation failed.
    #[error("validation failed: {0}")]
    #[diagnostic(
        code(servegraph::steps::validation),
        help("Check input data format and required fields.")
    )]
    ValidationFailed(String),

    /// Catch-all failure with a handler-provided message.
    #[error("{0}")]
    #[diagnostic(code(servegraph::steps::failed))]
    Failed(String),
}

//! Step model: named graph nodes with a typed kind and addressing config.
//!
//! Every node in a serving graph is a [`Step`]: a task running a
//! [`Handler`], a [`Router`](crate::router::Router) branching by route key,
//! a queue decoupling producers from consumers, or an error handler fed by
//! `on_error` edges. The kind is a closed tagged union — there is no
//! string-typed dispatch at runtime; handlers are resolved when the graph is
//! built.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::context::ROOT_FUNCTION;
use crate::queue::QueueCfg;
use crate::router::Router;
use crate::steps::handler::Handler;

/// Reference to the logic a task step executes.
#[derive(Clone)]
pub enum HandlerRef {
    /// An in-process handler.
    Local(Arc<dyn Handler>),
    /// An external REST/RPC target invoked through the dispatcher.
    Remote(RemoteSpec),
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(_) => f.write_str("HandlerRef::Local(..)"),
            Self::Remote(spec) => f.debug_tuple("HandlerRef::Remote").field(spec).finish(),
        }
    }
}

/// Addressing of a remote task's target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteTarget {
    /// Another function unit of this graph, resolved through the declared
    /// function endpoints or the context's endpoint resolver.
    Function(String),
    /// A fixed URL.
    Url(String),
}

/// Describes an external REST/RPC target for a remote task step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteSpec {
    target: RemoteTarget,
}

impl RemoteSpec {
    /// Targets another function unit by name.
    #[must_use]
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            target: RemoteTarget::Function(name.into()),
        }
    }

    /// Targets a fixed URL.
    #[must_use]
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            target: RemoteTarget::Url(url.into()),
        }
    }

    #[must_use]
    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }
}

/// What a step does when an envelope reaches it.
#[derive(Clone)]
pub enum StepKind {
    /// Runs a handler (local or remote) against the envelope.
    Task(HandlerRef),
    /// Branches to one or all of its routes.
    Router(Router),
    /// Buffers envelopes between producers and consumers.
    Queue(QueueCfg),
    /// Runs a handler for envelopes redirected via `on_error`.
    ErrorHandler(HandlerRef),
}

impl StepKind {
    /// Short lowercase label for logs and error stamps.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Task(_) => "task",
            Self::Router(_) => "router",
            Self::Queue(_) => "queue",
            Self::ErrorHandler(_) => "error_handler",
        }
    }

    /// True for queue steps, the only steps allowed to feed other function
    /// units.
    #[must_use]
    pub fn is_queue(&self) -> bool {
        matches!(self, Self::Queue(_))
    }
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Input/output addressing for a step.
///
/// `full_event` hands the whole envelope to the handler, bypassing body
/// addressing; combining it with either path is rejected at compile time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepIo {
    pub(crate) full_event: bool,
    pub(crate) input_path: Option<String>,
    pub(crate) result_path: Option<String>,
}

impl StepIo {
    /// True when `full_event` is combined with an input or result path.
    #[must_use]
    pub fn conflicts(&self) -> bool {
        self.full_event && (self.input_path.is_some() || self.result_path.is_some())
    }

    #[must_use]
    pub fn full_event(&self) -> bool {
        self.full_event
    }

    #[must_use]
    pub fn input_path(&self) -> Option<&str> {
        self.input_path.as_deref()
    }

    #[must_use]
    pub fn result_path(&self) -> Option<&str> {
        self.result_path.as_deref()
    }
}

/// A named node in a serving graph.
///
/// Constructed through the kind-specific constructors and configured with
/// the fluent `with_*` methods, then handed to the graph builder. Steps are
/// value objects; the compiled graph owns its own copies and never changes
/// them after compile.
///
/// # Examples
///
/// ```
/// use servegraph::context::Context;
/// use servegraph::steps::{Handler, Step, StepError};
/// use async_trait::async_trait;
/// use serde_json::Value;
///
/// struct Uppercase;
///
/// #[async_trait]
/// impl Handler for Uppercase {
///     async fn handle(&self, input: Value, _ctx: &Context) -> Result<Value, StepError> {
///         Ok(Value::String(
///             input.as_str().unwrap_or_default().to_uppercase(),
///         ))
///     }
/// }
///
/// let step = Step::task("shout", Uppercase)
///     .with_input_path("req.body")
///     .with_result_path("resp")
///     .with_on_error("catcher");
///
/// assert_eq!(step.name(), "shout");
/// assert_eq!(step.io().input_path(), Some("req.body"));
/// assert_eq!(step.on_error(), Some("catcher"));
/// ```
#[derive(Clone, Debug)]
pub struct Step {
    pub(crate) name: String,
    pub(crate) kind: StepKind,
    pub(crate) function: Option<String>,
    pub(crate) io: StepIo,
    pub(crate) on_error: Option<String>,
    pub(crate) responder: bool,
    pub(crate) concurrency: usize,
    /// Constructor parameters recorded when built from a registry.
    pub(crate) params: Value,
}

impl Step {
    fn with_kind(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            function: None,
            io: StepIo::default(),
            on_error: None,
            responder: false,
            concurrency: 1,
            params: Value::Null,
        }
    }

    /// Creates a task step running a local handler.
    #[must_use]
    pub fn task(name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::with_kind(name, StepKind::Task(HandlerRef::Local(Arc::new(handler))))
    }

    /// Creates a task step from an already shared handler.
    #[must_use]
    pub fn task_shared(name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self::with_kind(name, StepKind::Task(HandlerRef::Local(handler)))
    }

    /// Creates a task step whose handler is an external REST/RPC target.
    #[must_use]
    pub fn remote_task(name: impl Into<String>, spec: RemoteSpec) -> Self {
        Self::with_kind(name, StepKind::Task(HandlerRef::Remote(spec)))
    }

    /// Creates a router step.
    #[must_use]
    pub fn router(name: impl Into<String>, router: Router) -> Self {
        Self::with_kind(name, StepKind::Router(router))
    }

    /// Creates a queue step.
    #[must_use]
    pub fn queue(name: impl Into<String>, cfg: QueueCfg) -> Self {
        Self::with_kind(name, StepKind::Queue(cfg))
    }

    /// Creates an error-handler step fed by `on_error` redirects.
    #[must_use]
    pub fn error_handler(name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::with_kind(
            name,
            StepKind::ErrorHandler(HandlerRef::Local(Arc::new(handler))),
        )
    }

    /// Declares the step's input address inside the envelope body.
    #[must_use]
    pub fn with_input_path(mut self, path: impl Into<String>) -> Self {
        self.io.input_path = Some(path.into());
        self
    }

    /// Declares where the step's result is merged into the body.
    #[must_use]
    pub fn with_result_path(mut self, path: impl Into<String>) -> Self {
        self.io.result_path = Some(path.into());
        self
    }

    /// Hands the whole envelope to the handler instead of an addressed body
    /// slice. Mutually exclusive with the path settings.
    #[must_use]
    pub fn with_full_event(mut self) -> Self {
        self.io.full_event = true;
        self
    }

    /// Names the step that receives this step's failures.
    #[must_use]
    pub fn with_on_error(mut self, step: impl Into<String>) -> Self {
        self.on_error = Some(step.into());
        self
    }

    /// Assigns the step to a non-root function unit.
    #[must_use]
    pub fn on_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    /// Marks this step's output as the run's response.
    ///
    /// Without a responder the engines return the output of the last
    /// terminal step in insertion order.
    #[must_use]
    pub fn respond(mut self) -> Self {
        self.responder = true;
        self
    }

    /// Allows the dataflow engine to run up to `workers` copies of this
    /// step, sharding inbound envelopes by partition key so per-key FIFO
    /// order is preserved. Values below 1 are treated as 1.
    #[must_use]
    pub fn parallel(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> &StepKind {
        &self.kind
    }

    /// The owning function unit, `None` meaning the root function.
    #[must_use]
    pub fn function(&self) -> Option<&str> {
        self.function.as_deref()
    }

    /// The owning function unit with the root default applied.
    #[must_use]
    pub fn effective_function(&self) -> &str {
        self.function.as_deref().unwrap_or(ROOT_FUNCTION)
    }

    #[must_use]
    pub fn io(&self) -> &StepIo {
        &self.io
    }

    #[must_use]
    pub fn on_error(&self) -> Option<&str> {
        self.on_error.as_deref()
    }

    #[must_use]
    pub fn is_responder(&self) -> bool {
        self.responder
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind.name())
    }
}

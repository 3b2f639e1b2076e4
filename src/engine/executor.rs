//! Shared step execution semantics.
//!
//! Both engines delegate the actual running of a step to [`Executor`], so
//! io addressing, router dispatch, ensemble aggregation, and error
//! redirection behave identically regardless of scheduling discipline.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::context::Context;
use crate::dispatch::DistributedDispatcher;
use crate::engine::{EngineError, TraversalPhase};
use crate::envelope::{EnvelopeError, EventEnvelope};
use crate::graph::CompiledGraph;
use crate::paths;
use crate::router::{RouteStrategy, Router};
use crate::steps::{Handler, HandlerRef, RemoteSpec, RemoteTarget, Step, StepKind};

/// Result of running one step on one envelope.
pub(crate) enum StepOutcome {
    /// The step produced an output; traversal continues along its edges.
    Advanced(EventEnvelope),
    /// The step failed and its `on_error` target takes over, with the
    /// failure stamped into the envelope's error field.
    Redirected { to: String, envelope: EventEnvelope },
    /// The step failed with no `on_error` target; the failure is this
    /// envelope's terminal result.
    Failed(EngineError),
}

/// Log phase an advancing envelope lands in, by step kind.
pub(crate) fn advance_phase(kind: &StepKind) -> TraversalPhase {
    match kind {
        StepKind::Queue(_) => TraversalPhase::Queued,
        StepKind::Router(_) => TraversalPhase::Routed,
        _ => TraversalPhase::Advanced,
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Runs individual steps against a compiled graph and context.
pub(crate) struct Executor {
    graph: Arc<CompiledGraph>,
    ctx: Context,
    dispatcher: Arc<DistributedDispatcher>,
}

impl Executor {
    pub(crate) fn new(
        graph: Arc<CompiledGraph>,
        ctx: Context,
        dispatcher: DistributedDispatcher,
    ) -> Self {
        ctx.bind_graph(Arc::clone(&graph));
        Self {
            graph,
            ctx,
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub(crate) fn graph(&self) -> &Arc<CompiledGraph> {
        &self.graph
    }

    pub(crate) fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub(crate) fn dispatcher(&self) -> &Arc<DistributedDispatcher> {
        &self.dispatcher
    }

    /// Runs a step, translating failure into the step's declared error
    /// policy: redirect to `on_error` or surface as terminal.
    pub(crate) async fn run_step(&self, step: &Step, envelope: EventEnvelope) -> StepOutcome {
        debug!(
            envelope = %envelope.id,
            step = step.name(),
            phase = %TraversalPhase::Running,
            "running step"
        );
        let fallback = step.on_error().map(|_| envelope.clone());
        match self.execute(step, envelope).await {
            Ok(out) => StepOutcome::Advanced(out),
            Err(error) => {
                if let (Some(to), Some(original)) = (step.on_error(), fallback) {
                    debug!(
                        step = step.name(),
                        to,
                        phase = %TraversalPhase::Errored,
                        %error,
                        "redirecting failure to error handler"
                    );
                    let stamped = original.with_error(EnvelopeError::new(
                        step.name(),
                        error.label(),
                        error.to_string(),
                    ));
                    StepOutcome::Redirected {
                        to: to.to_string(),
                        envelope: stamped,
                    }
                } else {
                    StepOutcome::Failed(error)
                }
            }
        }
    }

    /// Executes a step's own work: handler invocation with io addressing,
    /// router dispatch, remote call, or queue sink mirroring.
    pub(crate) async fn execute(
        &self,
        step: &Step,
        envelope: EventEnvelope,
    ) -> Result<EventEnvelope, EngineError> {
        match step.kind() {
            StepKind::Task(HandlerRef::Local(handler))
            | StepKind::ErrorHandler(HandlerRef::Local(handler)) => {
                self.invoke(step, handler, envelope).await
            }
            StepKind::Task(HandlerRef::Remote(spec))
            | StepKind::ErrorHandler(HandlerRef::Remote(spec)) => {
                self.remote_task(step, spec, envelope).await
            }
            StepKind::Router(router) => self.route(step, router, envelope).await,
            StepKind::Queue(cfg) => {
                if let Some(sink) = cfg.sink() {
                    sink.push(&envelope).await.map_err(EngineError::Queue)?;
                }
                Ok(envelope)
            }
        }
    }

    /// Boxed recursion point for nested routers.
    fn execute_child<'a>(
        &'a self,
        step: &'a Step,
        envelope: EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<EventEnvelope, EngineError>> + Send + 'a>> {
        Box::pin(self.execute(step, envelope))
    }

    /// Local handler invocation under the step's io policy.
    ///
    /// `full_event` hands the whole envelope over; otherwise the handler
    /// sees the body (or the `input_path` sub-value) and its result either
    /// replaces the body or is merged at `result_path`.
    async fn invoke(
        &self,
        step: &Step,
        handler: &Arc<dyn Handler>,
        envelope: EventEnvelope,
    ) -> Result<EventEnvelope, EngineError> {
        let io = step.io();
        let wrap = |source| EngineError::StepFailed {
            step: step.name().to_string(),
            source,
        };

        if io.full_event() {
            return handler
                .handle_envelope(envelope, &self.ctx)
                .await
                .map_err(wrap);
        }

        let mut envelope = envelope;
        let input = match io.input_path() {
            Some(path) => paths::extract(&envelope.body, path)?,
            // Keep the original body around only when a later merge needs it.
            None if io.result_path().is_some() => envelope.body.clone(),
            None => std::mem::take(&mut envelope.body),
        };
        let result = handler.handle(input, &self.ctx).await.map_err(wrap)?;
        let body = match io.result_path() {
            Some(path) => paths::merge(std::mem::take(&mut envelope.body), path, result),
            None => result,
        };
        Ok(envelope.with_body(body))
    }

    /// Remote task invocation: same io policy as a local handler, with the
    /// addressed body travelling as the outbound envelope's payload.
    async fn remote_task(
        &self,
        step: &Step,
        spec: &RemoteSpec,
        envelope: EventEnvelope,
    ) -> Result<EventEnvelope, EngineError> {
        let endpoint = match spec.target() {
            RemoteTarget::Url(url) => url.clone(),
            RemoteTarget::Function(function) => {
                DistributedDispatcher::resolve_endpoint(&self.graph, &self.ctx, function)?
            }
        };

        let io = step.io();
        if io.full_event() {
            return Ok(self.dispatcher.call(&endpoint, &envelope).await?);
        }

        let mut envelope = envelope;
        let outbound = match io.input_path() {
            Some(path) => {
                let input = paths::extract(&envelope.body, path)?;
                envelope.clone().with_body(input)
            }
            None => envelope.clone(),
        };
        let response = self.dispatcher.call(&endpoint, &outbound).await?;
        let body = match io.result_path() {
            Some(path) => paths::merge(std::mem::take(&mut envelope.body), path, response.body),
            None => response.body,
        };
        Ok(envelope.with_body(body))
    }

    /// Router dispatch.
    ///
    /// The router's own `input_path` narrows what child steps see; its
    /// `result_path` places the routed result back into the pre-narrowing
    /// body. Single mode runs the one matching route; ensemble runs every
    /// route on a copy and aggregates the outputs keyed by route name.
    async fn route(
        &self,
        step: &Step,
        router: &Router,
        envelope: EventEnvelope,
    ) -> Result<EventEnvelope, EngineError> {
        let io = step.io();
        let original = io.result_path().map(|_| envelope.body.clone());
        let narrowed = match io.input_path() {
            Some(path) => {
                let input = paths::extract(&envelope.body, path)?;
                envelope.with_body(input)
            }
            None => envelope,
        };

        let routed = match router.strategy() {
            RouteStrategy::Single => {
                let Some(key) = router.route_key(&narrowed.path) else {
                    return Err(EngineError::RouteNotFound {
                        route: narrowed.path.clone(),
                    });
                };
                let Some(route) = router.find_route(key) else {
                    return Err(EngineError::RouteNotFound {
                        route: key.to_string(),
                    });
                };
                debug!(router = step.name(), route = route.name(), "dispatching route");
                self.execute_child(route.step(), narrowed).await?
            }
            RouteStrategy::Ensemble => {
                let copies = router.routes().iter().map(|route| {
                    let envelope = narrowed.clone();
                    async move { (route, self.execute_child(route.step(), envelope).await) }
                });
                let mut aggregate = Map::new();
                // join_all preserves declared route order, so the aggregate's
                // insertion order is deterministic.
                for (route, outcome) in futures_util::future::join_all(copies).await {
                    match outcome {
                        Ok(out) => {
                            aggregate.insert(route.name().to_string(), out.body);
                        }
                        Err(error) if route.is_optional() => {
                            warn!(
                                router = step.name(),
                                route = route.name(),
                                %error,
                                "optional route failed; recording error marker"
                            );
                            aggregate.insert(
                                route.name().to_string(),
                                json!({ "error": error.to_string() }),
                            );
                        }
                        Err(error) => return Err(error),
                    }
                }
                narrowed.with_body(Value::Object(aggregate))
            }
        };

        match (original, io.result_path()) {
            (Some(original), Some(path)) => {
                let mut routed = routed;
                let result = std::mem::take(&mut routed.body);
                Ok(routed.with_body(paths::merge(original, path, result)))
            }
            _ => Ok(routed),
        }
    }
}

// =============================================================================
// Response selection
// =============================================================================

/// Tracks candidate terminal envelopes during a traversal and picks the
/// run's response.
///
/// The first responder-step output wins outright. Otherwise the output of
/// the terminal step latest in declaration order wins, with later arrivals
/// replacing earlier ones at the same step. If nothing terminal was
/// reached the original input stands in.
#[derive(Default)]
pub(crate) struct ResponseTracker {
    responder: Option<EventEnvelope>,
    terminal: Option<(usize, EventEnvelope)>,
}

impl ResponseTracker {
    /// Records a step's output if that step is a responder or a terminal.
    pub(crate) fn record(&mut self, graph: &CompiledGraph, name: &str, envelope: EventEnvelope) {
        let Some(step) = graph.step(name) else {
            return;
        };
        if step.is_responder() {
            if self.responder.is_none() {
                self.responder = Some(envelope);
            }
            return;
        }
        if graph.is_terminal(name) {
            self.record_terminal(graph, name, envelope);
        }
    }

    /// Records a remote dispatch response as the target step's terminal
    /// arrival. The remote sub-graph already ran to completion, so the
    /// branch is finished locally even if the target has remote-side
    /// successors.
    pub(crate) fn record_remote(
        &mut self,
        graph: &CompiledGraph,
        name: &str,
        envelope: EventEnvelope,
    ) {
        if graph.step(name).is_some_and(Step::is_responder) {
            if self.responder.is_none() {
                self.responder = Some(envelope);
            }
            return;
        }
        self.record_terminal(graph, name, envelope);
    }

    fn record_terminal(&mut self, graph: &CompiledGraph, name: &str, envelope: EventEnvelope) {
        let Some(idx) = graph.step_index(name) else {
            return;
        };
        match &self.terminal {
            Some((best, _)) if *best > idx => {}
            _ => self.terminal = Some((idx, envelope)),
        }
    }

    pub(crate) fn finish(self, fallback: EventEnvelope) -> EventEnvelope {
        if let Some(responder) = self.responder {
            responder
        } else if let Some((_, terminal)) = self.terminal {
            terminal
        } else {
            fallback
        }
    }
}

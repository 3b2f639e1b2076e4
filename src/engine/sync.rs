//! Deterministic single-envelope engine.
//!
//! [`SyncEngine`] drives one envelope at a time through the whole graph,
//! depth first in declared edge order, inside the caller's task. Queue
//! steps degenerate to a pass-through (after mirroring to their sink, if
//! any) and function boundaries are ignored — every step runs locally, so
//! a distributed graph can be exercised end to end in one process.
//! Remote task steps still perform their calls through the dispatcher.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::context::Context;
use crate::dispatch::{DistributedDispatcher, STEP_HEADER};
use crate::engine::executor::{Executor, ResponseTracker, StepOutcome, advance_phase};
use crate::engine::{Engine, EngineError, TraversalPhase};
use crate::envelope::EventEnvelope;
use crate::graph::CompiledGraph;
use crate::queue::{DeliveryMode, partition_for};
use crate::steps::StepKind;

pub struct SyncEngine {
    executor: Executor,
}

impl SyncEngine {
    /// Creates an engine with no remote connectivity.
    #[must_use]
    pub fn new(graph: Arc<CompiledGraph>, ctx: Context) -> Self {
        Self::with_dispatcher(graph, ctx, DistributedDispatcher::disconnected())
    }

    /// Creates an engine that performs remote task calls through the given
    /// dispatcher.
    #[must_use]
    pub fn with_dispatcher(
        graph: Arc<CompiledGraph>,
        ctx: Context,
        dispatcher: DistributedDispatcher,
    ) -> Self {
        Self {
            executor: Executor::new(graph, ctx, dispatcher),
        }
    }

    /// Runs one envelope from the graph's entry steps to termination and
    /// returns its response.
    ///
    /// An envelope carrying a step address header resumes there instead,
    /// mirroring how the live engine serves cross-function handoffs.
    pub async fn process(
        &self,
        mut envelope: EventEnvelope,
    ) -> Result<EventEnvelope, EngineError> {
        if let Some(target) = envelope.headers.remove(STEP_HEADER) {
            return self.process_from(&target, envelope).await;
        }
        let starts = self.executor.graph().entries().to_vec();
        self.traverse(starts, envelope).await
    }

    /// Resumes traversal at a specific step, as when an envelope arrives
    /// from another function unit mid-graph.
    pub async fn process_from(
        &self,
        step: &str,
        envelope: EventEnvelope,
    ) -> Result<EventEnvelope, EngineError> {
        if !self.executor.graph().contains(step) {
            return Err(EngineError::UnknownStep {
                name: step.to_string(),
            });
        }
        self.traverse(vec![step.to_string()], envelope).await
    }

    async fn traverse(
        &self,
        starts: Vec<String>,
        envelope: EventEnvelope,
    ) -> Result<EventEnvelope, EngineError> {
        debug!(envelope = %envelope.id, phase = %TraversalPhase::Created, "traversal started");
        let graph = Arc::clone(self.executor.graph());
        let fallback = envelope.clone();
        let mut tracker = ResponseTracker::default();
        // Reverse push so the stack pops starts, and later successors, in
        // declared order.
        let mut stack: Vec<(String, EventEnvelope)> = starts
            .iter()
            .rev()
            .map(|name| (name.clone(), envelope.clone()))
            .collect();
        // Round-robin counters for keyless shared queues, one per queue step.
        let mut spread: FxHashMap<String, AtomicUsize> = FxHashMap::default();

        while let Some((name, envelope)) = stack.pop() {
            let Some(step) = graph.step(&name) else {
                return Err(EngineError::UnknownStep { name });
            };
            debug!(envelope = %envelope.id, step = %name, phase = %TraversalPhase::Entered, "step entered");

            match self.executor.run_step(step, envelope).await {
                StepOutcome::Advanced(out) => {
                    debug!(
                        envelope = %out.id,
                        step = %name,
                        phase = %advance_phase(step.kind()),
                        "step advanced"
                    );
                    let successors = graph.successors(&name);
                    if successors.is_empty() {
                        debug!(envelope = %out.id, step = %name, phase = %TraversalPhase::Terminated, "branch terminated");
                        tracker.record(&graph, &name, out);
                        continue;
                    }
                    if step.is_responder() {
                        tracker.record(&graph, &name, out.clone());
                    }
                    match step.kind() {
                        // A shared queue hands each envelope to exactly one
                        // successor, keyed or round-robin, with the same
                        // partitioning the dataflow engine uses.
                        StepKind::Queue(cfg) if cfg.mode() == DeliveryMode::Shared => {
                            let counter = spread.entry(name.clone()).or_default();
                            let slot = partition_for(out.key.as_deref(), successors.len(), counter);
                            stack.push((successors[slot].clone(), out));
                        }
                        // Everything else fans a copy out to every successor.
                        _ => {
                            for successor in successors.iter().skip(1).rev() {
                                stack.push((successor.clone(), out.clone()));
                            }
                            stack.push((successors[0].clone(), out));
                        }
                    }
                }
                StepOutcome::Redirected { to, envelope } => stack.push((to, envelope)),
                StepOutcome::Failed(error) => return Err(error),
            }
        }

        let response = tracker.finish(fallback);
        debug!(envelope = %response.id, phase = %TraversalPhase::Terminated, "traversal complete");
        Ok(response)
    }
}

#[async_trait]
impl Engine for SyncEngine {
    async fn run(&self, envelope: EventEnvelope) -> Result<EventEnvelope, EngineError> {
        self.process(envelope).await
    }
}


// Engine equivalence and failure-path suites live in tests/engines.rs.

//! Concurrent streaming engine.
//!
//! [`DataflowEngine`] spawns a worker task per step (one per concurrency
//! slot) pulling from a bounded mailbox, so many envelopes are in flight
//! at once while each envelope still observes the graph's declared order.
//! Keyed envelopes hash to a fixed mailbox slot, preserving per-key FIFO;
//! keyless ones spread round-robin. Queue steps feed real in-process
//! queues whose consumers forward to the successor steps, applying the
//! same partitioning the sync engine uses.
//!
//! A run is one submitted envelope tracked to its terminal result. Steps
//! owned by other function units are reached through the dispatcher; the
//! remote engine resumes mid-graph via [`process_from`].
//!
//! The engine must be created inside a Tokio runtime. Dropping it without
//! [`shutdown`](DataflowEngine::shutdown) lets workers drain and exit on
//! their own, but open runs then resolve to a join error rather than
//! [`EngineError::Closed`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::Context;
use crate::dispatch::{DistributedDispatcher, STEP_HEADER};
use crate::engine::executor::{Executor, ResponseTracker, StepOutcome, advance_phase};
use crate::engine::{Engine, EngineError, RUN_HEADER, TraversalPhase};
use crate::envelope::EventEnvelope;
use crate::graph::CompiledGraph;
use crate::queue::{DeliveryMode, Queue, QueueConsumer};
use crate::steps::{Step, StepKind};

// =============================================================================
// Run tracking
// =============================================================================

/// One submitted envelope and everything needed to resolve its result.
struct RunState {
    id: String,
    /// In-flight envelope copies belonging to this run. The run completes
    /// when the count returns to zero.
    pending: AtomicUsize,
    cancelled: AtomicBool,
    interrupt: Notify,
    tracker: Mutex<ResponseTracker>,
    fallback: EventEnvelope,
    done: Mutex<Option<oneshot::Sender<Result<EventEnvelope, EngineError>>>>,
}

impl RunState {
    fn new(
        id: String,
        fallback: EventEnvelope,
    ) -> (Arc<Self>, oneshot::Receiver<Result<EventEnvelope, EngineError>>) {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(Self {
            id,
            pending: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            interrupt: Notify::new(),
            tracker: Mutex::new(ResponseTracker::default()),
            fallback,
            done: Mutex::new(Some(tx)),
        });
        (state, rx)
    }

    /// Accounts for `n` further in-flight copies. Always called before the
    /// copies are handed off, so the count cannot touch zero early.
    fn reserve(&self, n: usize) {
        self.pending.fetch_add(n, Ordering::AcqRel);
    }

    /// Releases one in-flight copy; the last one out resolves the run.
    fn release(&self, runs: &RunTable) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let tracker = std::mem::take(&mut *self.tracker.lock());
            let mut response = tracker.finish(self.fallback.clone());
            response.headers.remove(RUN_HEADER);
            debug!(run = %self.id, envelope = %response.id, phase = %TraversalPhase::Terminated, "run complete");
            self.complete(runs, Ok(response));
        }
    }

    /// Resolves the run exactly once; later calls are no-ops.
    fn complete(&self, runs: &RunTable, result: Result<EventEnvelope, EngineError>) {
        let Some(tx) = self.done.lock().take() else {
            return;
        };
        runs.remove(&self.id);
        let _ = tx.send(result);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.interrupt.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Live runs keyed by run id, shared between the engine and its workers.
/// Completion removes the entry, which is what lets queue consumers drop
/// envelopes whose run has already resolved.
#[derive(Clone, Default)]
struct RunTable(Arc<Mutex<FxHashMap<String, Arc<RunState>>>>);

impl RunTable {
    fn insert(&self, run: Arc<RunState>) {
        self.0.lock().insert(run.id.clone(), run);
    }

    fn get(&self, id: &str) -> Option<Arc<RunState>> {
        self.0.lock().get(id).cloned()
    }

    fn remove(&self, id: &str) {
        self.0.lock().remove(id);
    }

    fn drain(&self) -> Vec<Arc<RunState>> {
        self.0.lock().drain().map(|(_, run)| run).collect()
    }
}

// =============================================================================
// Mailboxes
// =============================================================================

/// An envelope in flight between two steps of the same run.
#[derive(Clone)]
struct Delivery {
    envelope: EventEnvelope,
    run: Arc<RunState>,
}

/// Bounded per-step mailbox, one sender per concurrency slot. Keyed
/// envelopes always land in the same slot.
#[derive(Clone)]
struct Inbox {
    slots: Vec<flume::Sender<Delivery>>,
    spread: Arc<AtomicUsize>,
}

impl Inbox {
    async fn deliver(&self, delivery: Delivery) -> Result<(), EngineError> {
        let slot = crate::queue::partition_for(
            delivery.envelope.key.as_deref(),
            self.slots.len(),
            &self.spread,
        );
        self.slots[slot]
            .send_async(delivery)
            .await
            .map_err(|_| EngineError::Closed)
    }
}

// =============================================================================
// Workers
// =============================================================================

/// Per-step worker: pulls deliveries from one mailbox slot, runs the step,
/// and hands the output onward.
struct StepWorker {
    executor: Arc<Executor>,
    runs: RunTable,
    step_idx: usize,
    /// Successor mailboxes in declared edge order (non-queue steps only;
    /// queue steps forward through their queue instead).
    successors: Vec<(String, Inbox)>,
    on_error: Option<(String, Inbox)>,
    queue: Option<Arc<Queue>>,
    /// In-flight copies one enqueue turns into: 1 shared, fan-out size
    /// when broadcasting.
    queue_deliveries: usize,
    enqueue_wait: Option<Duration>,
}

impl StepWorker {
    async fn run(self, rx: flume::Receiver<Delivery>) {
        while let Ok(Delivery { envelope, run }) = rx.recv_async().await {
            self.process(envelope, run).await;
        }
    }

    async fn process(&self, envelope: EventEnvelope, run: Arc<RunState>) {
        let step = &self.executor.graph().steps()[self.step_idx];

        let interrupted = run.interrupt.notified();
        tokio::pin!(interrupted);
        interrupted.as_mut().enable();
        if run.is_cancelled() {
            run.complete(&self.runs, Err(EngineError::Cancelled));
            return;
        }

        debug!(envelope = %envelope.id, step = step.name(), phase = %TraversalPhase::Entered, "step entered");
        let outcome = tokio::select! {
            _ = &mut interrupted => {
                run.complete(&self.runs, Err(EngineError::Cancelled));
                return;
            }
            outcome = self.executor.run_step(step, envelope) => outcome,
        };

        match outcome {
            StepOutcome::Advanced(out) => {
                debug!(
                    envelope = %out.id,
                    step = step.name(),
                    phase = %advance_phase(step.kind()),
                    "step advanced"
                );
                self.forward(step, out, &run).await;
            }
            StepOutcome::Redirected { to, envelope } => match &self.on_error {
                Some((name, inbox)) if *name == to => {
                    run.reserve(1);
                    if inbox
                        .deliver(Delivery {
                            envelope,
                            run: Arc::clone(&run),
                        })
                        .await
                        .is_err()
                    {
                        run.complete(&self.runs, Err(EngineError::Closed));
                        return;
                    }
                    run.release(&self.runs);
                }
                _ => run.complete(&self.runs, Err(EngineError::UnknownStep { name: to })),
            },
            StepOutcome::Failed(error) => run.complete(&self.runs, Err(error)),
        }
    }

    async fn forward(&self, step: &Step, out: EventEnvelope, run: &Arc<RunState>) {
        if let Some(queue) = &self.queue {
            run.reserve(self.queue_deliveries);
            let interrupted = run.interrupt.notified();
            tokio::pin!(interrupted);
            interrupted.as_mut().enable();
            if run.is_cancelled() {
                run.complete(&self.runs, Err(EngineError::Cancelled));
                return;
            }
            // The back-pressure wait for a queue slot is cancellable.
            let enqueued = tokio::select! {
                _ = &mut interrupted => {
                    run.complete(&self.runs, Err(EngineError::Cancelled));
                    return;
                }
                enqueued = async {
                    match self.enqueue_wait {
                        Some(wait) => queue.enqueue_timeout(out, wait).await,
                        None => queue.enqueue(out).await,
                    }
                } => enqueued,
            };
            if let Err(error) = enqueued {
                run.complete(&self.runs, Err(EngineError::Queue(error)));
                return;
            }
            run.release(&self.runs);
            return;
        }

        if self.successors.is_empty() {
            debug!(envelope = %out.id, step = step.name(), phase = %TraversalPhase::Terminated, "branch terminated");
            run.tracker.lock().record(self.executor.graph(), step.name(), out);
            run.release(&self.runs);
            return;
        }

        if step.is_responder() {
            run.tracker
                .lock()
                .record(self.executor.graph(), step.name(), out.clone());
        }

        run.reserve(self.successors.len());
        if let Some(((_, last), head)) = self.successors.split_last() {
            for (_, inbox) in head {
                let delivery = Delivery {
                    envelope: out.clone(),
                    run: Arc::clone(run),
                };
                if inbox.deliver(delivery).await.is_err() {
                    run.complete(&self.runs, Err(EngineError::Closed));
                    return;
                }
            }
            let delivery = Delivery {
                envelope: out,
                run: Arc::clone(run),
            };
            if last.deliver(delivery).await.is_err() {
                run.complete(&self.runs, Err(EngineError::Closed));
                return;
            }
        }
        run.release(&self.runs);
    }
}

/// Where one queue consumer slot sends the envelopes it pulls.
enum PullTarget {
    Local { inbox: Inbox },
    Remote { step: String, function: String },
}

/// Drains one queue consumer slot and forwards to the matching successor,
/// re-associating each envelope with its run through the run header.
struct QueuePuller {
    executor: Arc<Executor>,
    runs: RunTable,
    target: PullTarget,
}

impl QueuePuller {
    async fn run(self, consumer: QueueConsumer) {
        while let Ok(envelope) = consumer.pull().await {
            let Some(run_id) = envelope.header(RUN_HEADER).map(str::to_string) else {
                warn!(envelope = %envelope.id, "envelope left the queue without a run header; dropping");
                continue;
            };
            let Some(run) = self.runs.get(&run_id) else {
                debug!(envelope = %envelope.id, run = %run_id, "run already resolved; dropping envelope");
                continue;
            };
            if run.is_cancelled() {
                run.complete(&self.runs, Err(EngineError::Cancelled));
                continue;
            }

            match &self.target {
                PullTarget::Local { inbox } => {
                    let delivery = Delivery {
                        envelope,
                        run: Arc::clone(&run),
                    };
                    if inbox.deliver(delivery).await.is_err() {
                        run.complete(&self.runs, Err(EngineError::Closed));
                    }
                }
                PullTarget::Remote { step, function } => {
                    let graph = self.executor.graph();
                    let interrupted = run.interrupt.notified();
                    tokio::pin!(interrupted);
                    interrupted.as_mut().enable();
                    let sent = tokio::select! {
                        _ = &mut interrupted => {
                            run.complete(&self.runs, Err(EngineError::Cancelled));
                            continue;
                        }
                        sent = self.executor.dispatcher().dispatch(
                            graph,
                            self.executor.ctx(),
                            function,
                            step,
                            envelope,
                        ) => sent,
                    };
                    match sent {
                        Ok(response) => {
                            run.tracker.lock().record_remote(graph, step, response);
                            run.release(&self.runs);
                        }
                        Err(error) => {
                            run.complete(&self.runs, Err(EngineError::Dispatch(error)));
                        }
                    }
                }
            }
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct DataflowEngine {
    executor: Arc<Executor>,
    runs: RunTable,
    /// Mailboxes for locally owned steps; taken on shutdown so worker
    /// receivers drain and exit in graph order.
    inboxes: Mutex<Option<FxHashMap<String, Inbox>>>,
    queues: Vec<Arc<Queue>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Entry steps owned by this engine's function unit.
    entries: Vec<String>,
    closed: AtomicBool,
}

/// Handle to one submitted envelope's run.
pub struct RunHandle {
    id: String,
    run: Arc<RunState>,
    done: oneshot::Receiver<Result<EventEnvelope, EngineError>>,
}

impl RunHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Requests cancellation of this run only; other in-flight envelopes
    /// are untouched. The running step is interrupted even while awaiting
    /// a remote call or a queue slot.
    pub fn cancel(&self) {
        debug!(run = %self.id, "cancellation requested");
        self.run.cancel();
    }

    /// Awaits the run's terminal envelope.
    pub async fn join(self) -> Result<EventEnvelope, EngineError> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Join {
                message: "run dropped without a result".to_string(),
            }),
        }
    }
}

impl DataflowEngine {
    /// Starts an engine with default configuration and no remote
    /// connectivity.
    #[must_use]
    pub fn new(graph: Arc<CompiledGraph>, ctx: Context) -> Self {
        Self::with_config(graph, ctx, EngineConfig::default())
    }

    /// Starts an engine with the given configuration.
    #[must_use]
    pub fn with_config(graph: Arc<CompiledGraph>, ctx: Context, config: EngineConfig) -> Self {
        let dispatcher = DistributedDispatcher::disconnected().with_timeout(config.remote_timeout);
        Self::with_dispatcher(graph, ctx, config, dispatcher)
    }

    /// Starts an engine that reaches other function units through the
    /// given dispatcher.
    #[must_use]
    pub fn with_dispatcher(
        graph: Arc<CompiledGraph>,
        ctx: Context,
        config: EngineConfig,
        dispatcher: DistributedDispatcher,
    ) -> Self {
        let executor = Arc::new(Executor::new(Arc::clone(&graph), ctx, dispatcher));
        let runs = RunTable::default();
        let function = executor.ctx().current_function().to_string();

        // Mailboxes first, so successor handles exist when workers spawn.
        let mut inboxes: FxHashMap<String, Inbox> = FxHashMap::default();
        let mut mailboxes: Vec<(usize, Vec<flume::Receiver<Delivery>>)> = Vec::new();
        for (idx, step) in graph.steps().iter().enumerate() {
            if step.effective_function() != function {
                continue;
            }
            let slots = step.concurrency();
            let mut senders = Vec::with_capacity(slots);
            let mut receivers = Vec::with_capacity(slots);
            for _ in 0..slots {
                let (tx, rx) = flume::bounded(config.mailbox_capacity);
                senders.push(tx);
                receivers.push(rx);
            }
            inboxes.insert(
                step.name().to_string(),
                Inbox {
                    slots: senders,
                    spread: Arc::new(AtomicUsize::new(0)),
                },
            );
            mailboxes.push((idx, receivers));
        }

        let mut workers = Vec::new();
        let mut queues = Vec::new();

        for (idx, receivers) in mailboxes {
            let step = &graph.steps()[idx];

            let mut queue_handle = None;
            let mut queue_deliveries = 0;
            if let StepKind::Queue(cfg) = step.kind() {
                let successors = graph.successors(step.name());
                // A queue with no successors is a plain terminal; envelopes
                // stop after the sink mirror.
                if !successors.is_empty() {
                    let mut cfg = cfg.clone();
                    if cfg.capacity().is_none() {
                        cfg = cfg.with_capacity(config.queue_capacity);
                    }
                    queue_deliveries = match cfg.mode() {
                        DeliveryMode::Shared => 1,
                        DeliveryMode::Broadcast => successors.len(),
                    };
                    // One consumer slot per successor keeps the partition
                    // math identical to the sync engine's successor pick.
                    let (queue, consumers) = Queue::new(&cfg, successors.len());
                    let queue = Arc::new(queue);
                    for (slot, consumer) in consumers.into_iter().enumerate() {
                        let name = &successors[slot];
                        let target = match inboxes.get(name) {
                            Some(inbox) => PullTarget::Local {
                                inbox: inbox.clone(),
                            },
                            None => {
                                let Some(successor) = graph.step(name) else {
                                    continue;
                                };
                                PullTarget::Remote {
                                    step: name.clone(),
                                    function: successor.effective_function().to_string(),
                                }
                            }
                        };
                        let puller = QueuePuller {
                            executor: Arc::clone(&executor),
                            runs: runs.clone(),
                            target,
                        };
                        workers.push(tokio::spawn(puller.run(consumer)));
                    }
                    queues.push(Arc::clone(&queue));
                    queue_handle = Some(queue);
                }
            }

            let successors: Vec<(String, Inbox)> = if matches!(step.kind(), StepKind::Queue(_)) {
                Vec::new()
            } else {
                graph
                    .successors(step.name())
                    .iter()
                    .filter_map(|name| {
                        inboxes.get(name).map(|inbox| (name.clone(), inbox.clone()))
                    })
                    .collect()
            };
            let on_error = step.on_error().and_then(|target| {
                inboxes
                    .get(target)
                    .map(|inbox| (target.to_string(), inbox.clone()))
            });

            for rx in receivers {
                let worker = StepWorker {
                    executor: Arc::clone(&executor),
                    runs: runs.clone(),
                    step_idx: idx,
                    successors: successors.clone(),
                    on_error: on_error.clone(),
                    queue: queue_handle.clone(),
                    queue_deliveries,
                    enqueue_wait: config.queue_wait_timeout,
                };
                workers.push(tokio::spawn(worker.run(rx)));
            }
        }

        let entries: Vec<String> = graph
            .entries()
            .iter()
            .filter(|name| {
                graph
                    .step(name)
                    .is_some_and(|step| step.effective_function() == function)
            })
            .cloned()
            .collect();

        debug!(
            %function,
            steps = inboxes.len(),
            entries = entries.len(),
            "dataflow engine started"
        );

        Self {
            executor,
            runs,
            inboxes: Mutex::new(Some(inboxes)),
            queues,
            workers: Mutex::new(workers),
            entries,
            closed: AtomicBool::new(false),
        }
    }

    /// Submits an envelope to the graph's local entry steps and returns a
    /// handle to await or cancel the run.
    pub async fn submit(&self, envelope: EventEnvelope) -> Result<RunHandle, EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        if self.entries.is_empty() {
            return Err(EngineError::NoEntrySteps {
                function: self.executor.ctx().current_function().to_string(),
            });
        }
        self.start_run(self.entries.clone(), envelope).await
    }

    /// Runs one envelope to termination. An envelope carrying a step
    /// address header resumes there, which is how a function unit serves
    /// handoffs arriving from its peers.
    pub async fn process(&self, mut envelope: EventEnvelope) -> Result<EventEnvelope, EngineError> {
        if let Some(target) = envelope.headers.remove(STEP_HEADER) {
            return self.process_from(&target, envelope).await;
        }
        self.submit(envelope).await?.join().await
    }

    /// Resumes traversal at a specific locally owned step and awaits the
    /// local sub-graph's terminal result.
    pub async fn process_from(
        &self,
        step: &str,
        envelope: EventEnvelope,
    ) -> Result<EventEnvelope, EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        if self.inbox(step).is_none() {
            return Err(EngineError::UnknownStep {
                name: step.to_string(),
            });
        }
        let handle = self.start_run(vec![step.to_string()], envelope).await?;
        handle.join().await
    }

    async fn start_run(
        &self,
        targets: Vec<String>,
        envelope: EventEnvelope,
    ) -> Result<RunHandle, EngineError> {
        let run_id = Uuid::new_v4().to_string();
        let envelope = envelope.with_header(RUN_HEADER, run_id.clone());
        debug!(run = %run_id, envelope = %envelope.id, phase = %TraversalPhase::Created, "run submitted");

        let (run, done) = RunState::new(run_id.clone(), envelope.clone());
        self.runs.insert(Arc::clone(&run));
        run.reserve(targets.len());
        for name in &targets {
            let Some(inbox) = self.inbox(name) else {
                run.complete(&self.runs, Err(EngineError::UnknownStep { name: name.clone() }));
                break;
            };
            let delivery = Delivery {
                envelope: envelope.clone(),
                run: Arc::clone(&run),
            };
            if inbox.deliver(delivery).await.is_err() {
                run.complete(&self.runs, Err(EngineError::Closed));
                break;
            }
        }

        Ok(RunHandle {
            id: run_id,
            run,
            done,
        })
    }

    fn inbox(&self, name: &str) -> Option<Inbox> {
        self.inboxes.lock().as_ref().and_then(|map| map.get(name).cloned())
    }

    /// Stops accepting envelopes, drains in-flight work, and joins every
    /// worker. Runs still open afterwards resolve to
    /// [`EngineError::Closed`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("dataflow engine shutting down");
        for queue in &self.queues {
            queue.close();
        }
        // Dropping the engine-held senders lets entry workers drain and
        // exit; their successor handles drop with them, cascading through
        // the graph.
        self.inboxes.lock().take();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(error) = worker.await {
                warn!(%error, "worker ended abnormally during shutdown");
            }
        }
        for run in self.runs.drain() {
            run.complete(&self.runs, Err(EngineError::Closed));
        }
    }
}

#[async_trait]
impl Engine for DataflowEngine {
    async fn run(&self, envelope: EventEnvelope) -> Result<EventEnvelope, EngineError> {
        self.process(envelope).await
    }
}

//! Bounded queues decoupling producer steps from consumer steps.
//!
//! A [`Queue`] is the only mutable structure shared between concurrent
//! traversals. It buffers envelopes in bounded per-consumer channels:
//! enqueueing completes immediately while capacity remains and waits
//! (back-pressure) once full — envelopes are never dropped. Envelopes that
//! share a partition key always land on the same consumer slot, preserving
//! per-key FIFO order; keyless envelopes are spread round-robin. A queue
//! with a single consumer is therefore globally FIFO.
//!
//! [`DeliveryMode::Shared`] delivers each envelope to exactly one consumer
//! (work distribution); [`DeliveryMode::Broadcast`] clones it to every
//! consumer. Queues may additionally mirror traffic into an external
//! durable stream through a [`StreamSink`] — the stream itself is somebody
//! else's problem, the engine only needs the push contract.
//!
//! # Examples
//!
//! ```no_run
//! use servegraph::envelope::EventEnvelope;
//! use servegraph::queue::{Queue, QueueCfg, QueueError};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), QueueError> {
//! let (queue, consumers) = Queue::new(&QueueCfg::bounded(8), 2);
//! queue
//!     .enqueue(EventEnvelope::stream("user-1", json!({"n": 1})))
//!     .await?;
//! let envelope = consumers[0].pull().await?;
//! assert_eq!(envelope.key.as_deref(), Some("user-1"));
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::envelope::EventEnvelope;

/// Buffer size used when a queue config does not set its own capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum QueueError {
    /// The queue was closed; producers can no longer enqueue and consumers
    /// have drained the remaining buffer.
    #[error("queue is closed")]
    #[diagnostic(
        code(servegraph::queue::closed),
        help("the owning engine closed this queue during shutdown; no further envelopes flow")
    )]
    Closed,

    /// A bounded wait on the queue elapsed.
    #[error("queue wait timed out after {waited:?}")]
    #[diagnostic(
        code(servegraph::queue::timeout),
        help("raise the queue capacity, add consumers, or lengthen the wait timeout")
    )]
    Timeout { waited: Duration },

    /// The external stream sink rejected a push.
    #[error("stream sink push failed: {message}")]
    #[diagnostic(code(servegraph::queue::stream))]
    Stream { message: String },
}

// =============================================================================
// Configuration
// =============================================================================

/// Whether an envelope goes to one consumer or all of them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Each envelope is delivered to exactly one consumer.
    #[default]
    Shared,
    /// Every consumer receives a copy of every envelope.
    Broadcast,
}

/// Push contract against an external durable stream.
///
/// Implementations wrap whatever transport actually stores the records; the
/// engine mirrors every envelope passing the queue step into the sink and
/// otherwise ignores it.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn push(&self, envelope: &EventEnvelope) -> Result<(), QueueError>;
}

/// Configuration attached to a queue step.
#[derive(Clone, Default)]
pub struct QueueCfg {
    pub(crate) capacity: Option<usize>,
    pub(crate) mode: DeliveryMode,
    pub(crate) sink: Option<std::sync::Arc<dyn StreamSink>>,
}

impl QueueCfg {
    /// A shared-mode queue using the engine's default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A shared-mode queue with an explicit buffer capacity.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self::new().with_capacity(capacity)
    }

    /// Sets the buffer capacity. Values below 1 are treated as 1.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    /// Switches delivery to broadcast: every consumer sees every envelope.
    #[must_use]
    pub fn broadcast(mut self) -> Self {
        self.mode = DeliveryMode::Broadcast;
        self
    }

    /// Mirrors every envelope reaching the queue step into `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: impl StreamSink + 'static) -> Self {
        self.sink = Some(std::sync::Arc::new(sink));
        self
    }

    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    #[must_use]
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    #[must_use]
    pub fn sink(&self) -> Option<&std::sync::Arc<dyn StreamSink>> {
        self.sink.as_ref()
    }
}

impl std::fmt::Debug for QueueCfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueCfg")
            .field("capacity", &self.capacity)
            .field("mode", &self.mode)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

// =============================================================================
// Partitioning
// =============================================================================

/// Maps a partition key to a consumer slot.
///
/// Keyed envelopes hash deterministically so one key always reaches the same
/// slot; keyless envelopes rotate through slots via `rr`.
pub(crate) fn partition_for(key: Option<&str>, slots: usize, rr: &AtomicUsize) -> usize {
    debug_assert!(slots > 0);
    match key {
        Some(key) => {
            let mut hasher = FxHasher::default();
            key.hash(&mut hasher);
            (hasher.finish() as usize) % slots
        }
        None => rr.fetch_add(1, Ordering::Relaxed) % slots,
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Producer side of a bounded, partitioned envelope buffer.
pub struct Queue {
    mode: DeliveryMode,
    slots: usize,
    senders: Mutex<Option<Vec<flume::Sender<EventEnvelope>>>>,
    rr: AtomicUsize,
}

/// One consumer slot of a [`Queue`].
///
/// After the queue is closed, `pull` keeps yielding whatever is still
/// buffered for this slot and only then reports [`QueueError::Closed`].
pub struct QueueConsumer {
    slot: usize,
    rx: flume::Receiver<EventEnvelope>,
}

impl Queue {
    /// Builds a queue and its consumer slots.
    ///
    /// `consumers` below 1 is treated as 1. The configured capacity bounds
    /// each slot's buffer; unset capacity falls back to
    /// [`DEFAULT_QUEUE_CAPACITY`].
    #[must_use]
    pub fn new(cfg: &QueueCfg, consumers: usize) -> (Self, Vec<QueueConsumer>) {
        let slots = consumers.max(1);
        let capacity = cfg.capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY).max(1);

        let mut senders = Vec::with_capacity(slots);
        let mut handles = Vec::with_capacity(slots);
        for slot in 0..slots {
            let (tx, rx) = flume::bounded(capacity);
            senders.push(tx);
            handles.push(QueueConsumer { slot, rx });
        }

        let queue = Self {
            mode: cfg.mode,
            slots,
            senders: Mutex::new(Some(senders)),
            rr: AtomicUsize::new(0),
        };
        (queue, handles)
    }

    /// Number of consumer slots.
    #[must_use]
    pub fn consumers(&self) -> usize {
        self.slots
    }

    #[must_use]
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// True once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.senders.lock().is_none()
    }

    /// Delivers an envelope, waiting while the target buffer is full.
    ///
    /// Shared mode picks one slot by partition key (round-robin when
    /// keyless); broadcast mode copies the envelope to every slot.
    pub async fn enqueue(&self, envelope: EventEnvelope) -> Result<(), QueueError> {
        // Clone senders out of the lock; flume senders are cheap handles
        // and the send must not happen under the mutex.
        let senders = match &*self.senders.lock() {
            Some(senders) => senders.clone(),
            None => return Err(QueueError::Closed),
        };

        match self.mode {
            DeliveryMode::Shared => {
                let slot = partition_for(envelope.key.as_deref(), senders.len(), &self.rr);
                senders[slot]
                    .send_async(envelope)
                    .await
                    .map_err(|_| QueueError::Closed)
            }
            DeliveryMode::Broadcast => {
                if let Some((last, rest)) = senders.split_last() {
                    for sender in rest {
                        sender
                            .send_async(envelope.clone())
                            .await
                            .map_err(|_| QueueError::Closed)?;
                    }
                    last.send_async(envelope)
                        .await
                        .map_err(|_| QueueError::Closed)?;
                }
                Ok(())
            }
        }
    }

    /// [`enqueue`](Self::enqueue) bounded by `wait`; surfaces
    /// [`QueueError::Timeout`] instead of waiting indefinitely on a full
    /// buffer.
    pub async fn enqueue_timeout(
        &self,
        envelope: EventEnvelope,
        wait: Duration,
    ) -> Result<(), QueueError> {
        match tokio::time::timeout(wait, self.enqueue(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout { waited: wait }),
        }
    }

    /// Closes the producer side. Consumers drain what is buffered, then see
    /// [`QueueError::Closed`]. Idempotent.
    pub fn close(&self) {
        self.senders.lock().take();
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("mode", &self.mode)
            .field("slots", &self.slots)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl QueueConsumer {
    /// Slot index this consumer drains.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Envelopes currently buffered for this slot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Waits for the next envelope in this slot's FIFO order.
    pub async fn pull(&self) -> Result<EventEnvelope, QueueError> {
        self.rx.recv_async().await.map_err(|_| QueueError::Closed)
    }

    /// [`pull`](Self::pull) bounded by `wait`; surfaces
    /// [`QueueError::Timeout`] when nothing arrives in time.
    pub async fn pull_timeout(&self, wait: Duration) -> Result<EventEnvelope, QueueError> {
        match tokio::time::timeout(wait, self.rx.recv_async()).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(QueueError::Closed),
            Err(_) => Err(QueueError::Timeout { waited: wait }),
        }
    }
}

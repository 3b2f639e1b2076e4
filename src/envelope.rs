//! Event envelope: the unit of data flowing through a serving graph.
//!
//! An [`EventEnvelope`] carries a JSON body plus the routing and addressing
//! metadata the engine needs: a path for router dispatch, an optional
//! partition key for queue ordering, timestamps, and an error slot that is
//! stamped when a step fails and the envelope is redirected to an error
//! handler.
//!
//! Envelopes are created once per inbound request or stream record and are
//! never mutated in place by concurrently running steps: every hop derives a
//! new envelope via [`EventEnvelope::with_body`] or a plain clone.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// How an envelope entered the graph.
///
/// HTTP-like triggers carry `path`/`method` for router dispatch; stream
/// triggers carry a partition `key` and event `time` instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// An HTTP-like request (path + method populated).
    Http,
    /// A stream/record trigger (key + time populated).
    Stream,
    /// Constructed directly, e.g. in tests or offline replays.
    Manual,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Stream => write!(f, "stream"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Error details stamped onto an envelope when a step fails.
///
/// Carries the taxonomy label, a human-readable message, and the name of the
/// step that raised the error, so error-handler steps can inspect what went
/// wrong without parsing log output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeError {
    /// Name of the step where the failure originated.
    pub step: String,
    /// Short taxonomy label, e.g. `StepExecutionError` or `QueueClosed`.
    pub code: String,
    /// Human-readable failure message.
    pub message: String,
}

impl EnvelopeError {
    /// Creates an error record for the given originating step.
    #[must_use]
    pub fn new(
        step: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step: step.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.step, self.message)
    }
}

/// The unit of data routed through a serving graph.
///
/// # Examples
///
/// ## HTTP-like construction
/// ```
/// use servegraph::envelope::{EventEnvelope, TriggerKind};
/// use serde_json::json;
///
/// let envelope = EventEnvelope::http("/api/m1/infer", "POST", json!({"x": 1}));
/// assert_eq!(envelope.path, "/api/m1/infer");
/// assert_eq!(envelope.method, "POST");
/// assert_eq!(envelope.trigger, TriggerKind::Http);
/// assert!(envelope.key.is_none());
/// ```
///
/// ## Stream-record construction
/// ```
/// use servegraph::envelope::{EventEnvelope, TriggerKind};
/// use serde_json::json;
///
/// let envelope = EventEnvelope::stream("user-42", json!({"click": "buy"}));
/// assert_eq!(envelope.key.as_deref(), Some("user-42"));
/// assert_eq!(envelope.trigger, TriggerKind::Stream);
/// ```
///
/// # Serialization
///
/// Envelopes serialize to JSON for cross-function dispatch:
/// ```
/// use servegraph::envelope::EventEnvelope;
/// use serde_json::json;
///
/// let envelope = EventEnvelope::new(json!({"a": 1}));
/// let wire = serde_json::to_string(&envelope).unwrap();
/// let parsed: EventEnvelope = serde_json::from_str(&wire).unwrap();
/// assert_eq!(parsed.id, envelope.id);
/// assert_eq!(parsed.body, envelope.body);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier, assigned once at creation and preserved across hops.
    pub id: String,
    /// Routing path (router dispatch keys off its segments).
    pub path: String,
    /// HTTP-like method; defaults to `POST`.
    pub method: String,
    /// Optional partition/record key; queues order envelopes per key.
    pub key: Option<String>,
    /// Event time (assigned at creation for manual/HTTP triggers).
    pub time: DateTime<Utc>,
    /// The payload steps read from and write to.
    pub body: Value,
    /// Transport metadata; also used for run/step addressing across hops.
    pub headers: FxHashMap<String, String>,
    /// Populated when a step fails and the envelope is error-routed.
    pub error: Option<EnvelopeError>,
    /// How this envelope entered the graph.
    pub trigger: TriggerKind,
}

impl EventEnvelope {
    /// Creates an envelope with the given body and a fresh unique id.
    ///
    /// Path is empty, method is `POST`, trigger is [`TriggerKind::Manual`].
    #[must_use]
    pub fn new(body: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            path: String::new(),
            method: "POST".to_string(),
            key: None,
            time: Utc::now(),
            body,
            headers: FxHashMap::default(),
            error: None,
            trigger: TriggerKind::Manual,
        }
    }

    /// Creates an HTTP-like envelope with path and method populated.
    #[must_use]
    pub fn http(path: impl Into<String>, method: impl Into<String>, body: Value) -> Self {
        let mut envelope = Self::new(body);
        envelope.path = path.into();
        envelope.method = method.into();
        envelope.trigger = TriggerKind::Http;
        envelope
    }

    /// Creates a stream-record envelope with the partition key populated.
    #[must_use]
    pub fn stream(key: impl Into<String>, body: Value) -> Self {
        let mut envelope = Self::new(body);
        envelope.key = Some(key.into());
        envelope.trigger = TriggerKind::Stream;
        envelope
    }

    /// Returns a derived envelope carrying `body`, preserving all metadata.
    ///
    /// This is how steps advance an envelope: the original is never mutated
    /// in place, so concurrent branches each hold an independent copy.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Sets the routing path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the partition key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Returns a derived envelope with the error slot stamped.
    #[must_use]
    pub fn with_error(mut self, error: EnvelopeError) -> Self {
        self.error = Some(error);
        self
    }

    /// True if this envelope has been error-stamped.
    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.error.is_some()
    }

    /// Looks up a header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

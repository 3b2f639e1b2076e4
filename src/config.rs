//! Engine tuning knobs.
//!
//! [`EngineConfig`] sizes the dataflow engine's per-step mailboxes and
//! queue buffers and bounds remote calls and queue waits. Values come from
//! code or, via [`EngineConfig::from_env`], from `SERVEGRAPH_*` environment
//! variables (a `.env` file is honored through dotenvy).

use std::time::Duration;
use tracing::warn;

use crate::queue::DEFAULT_QUEUE_CAPACITY;

/// Runtime tuning for the execution engines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Capacity of each dataflow step's inbound mailbox.
    pub mailbox_capacity: usize,
    /// Default buffer capacity for queue steps that set none themselves.
    pub queue_capacity: usize,
    /// Upper bound on a single remote dispatch round trip.
    pub remote_timeout: Duration,
    /// Upper bound on waiting for queue capacity; `None` waits
    /// indefinitely (pure back-pressure).
    pub queue_wait_timeout: Option<Duration>,
}

impl EngineConfig {
    pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;
    pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads overrides from `SERVEGRAPH_MAILBOX_CAPACITY`,
    /// `SERVEGRAPH_QUEUE_CAPACITY`, `SERVEGRAPH_REMOTE_TIMEOUT_MS`, and
    /// `SERVEGRAPH_QUEUE_WAIT_TIMEOUT_MS`. Unset or unparseable variables
    /// fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            mailbox_capacity: env_usize(
                "SERVEGRAPH_MAILBOX_CAPACITY",
                Self::DEFAULT_MAILBOX_CAPACITY,
            ),
            queue_capacity: env_usize("SERVEGRAPH_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY),
            remote_timeout: env_millis("SERVEGRAPH_REMOTE_TIMEOUT_MS")
                .unwrap_or(Self::DEFAULT_REMOTE_TIMEOUT),
            queue_wait_timeout: env_millis("SERVEGRAPH_QUEUE_WAIT_TIMEOUT_MS"),
        }
    }

    /// Sets the mailbox capacity; values below 1 are treated as 1.
    #[must_use]
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }

    /// Sets the default queue capacity; values below 1 are treated as 1.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_queue_wait_timeout(mut self, timeout: Duration) -> Self {
        self.queue_wait_timeout = Some(timeout);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: Self::DEFAULT_MAILBOX_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            remote_timeout: Self::DEFAULT_REMOTE_TIMEOUT,
            queue_wait_timeout: None,
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(%name, %raw, "ignoring unparseable capacity override");
            default
        }),
        Err(_) => default,
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            warn!(%name, %raw, "ignoring unparseable timeout override");
            None
        }
    }
}

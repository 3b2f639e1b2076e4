//! Cross-function dispatch: turning graph edges into remote calls.
//!
//! When a queue step's successor is owned by another function unit, the
//! engine hands the envelope to the [`DistributedDispatcher`]. The
//! dispatcher resolves the target function's endpoint (graph declaration
//! first, then the context's resolver), stamps the target step into the
//! [`STEP_HEADER`] header so the receiving side resumes at the right step,
//! and invokes the configured [`Transport`].
//!
//! Transports are pluggable; the engine core never depends on a specific
//! one. Transport failures ([`DispatchError::Unreachable`]) are retried
//! with bounded exponential backoff per [`RetryPolicy`]; a remote graph
//! that itself raised ([`DispatchError::Remote`]) is never retried.

use async_trait::async_trait;
use miette::Diagnostic;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::config::EngineConfig;
use crate::context::Context;
use crate::envelope::EventEnvelope;
use crate::graph::CompiledGraph;

/// Header naming the step the receiving engine resumes traversal at.
pub const STEP_HEADER: &str = "x-servegraph-step";

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while dispatching an envelope across function units.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum DispatchError {
    /// The dispatcher has no transport configured.
    #[error("no transport configured for remote dispatch")]
    #[diagnostic(
        code(servegraph::dispatch::no_transport),
        help("construct the DistributedDispatcher with a Transport implementation")
    )]
    NoTransport,

    /// No endpoint was declared or resolvable for the target function.
    #[error("no endpoint known for function '{function}'")]
    #[diagnostic(
        code(servegraph::dispatch::missing_endpoint),
        help("declare the endpoint with add_child_function or provide an EndpointResolver")
    )]
    MissingEndpoint { function: String },

    /// The endpoint could not be reached; retryable.
    #[error("endpoint '{endpoint}' unreachable: {message}")]
    #[diagnostic(code(servegraph::dispatch::unreachable))]
    Unreachable { endpoint: String, message: String },

    /// The remote graph raised while executing; not retried.
    #[error("remote execution failed at '{endpoint}': {message}")]
    #[diagnostic(code(servegraph::dispatch::remote))]
    Remote { endpoint: String, message: String },
}

impl DispatchError {
    /// Only transport-level unreachability is safe to retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Wire contract for invoking a remote function unit.
///
/// Implementations own serialization and the actual protocol; the
/// dispatcher only sees envelopes going out and coming back.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        endpoint: &str,
        envelope: &EventEnvelope,
    ) -> Result<EventEnvelope, DispatchError>;
}

/// Transport for single-function deployments: every send fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTransport;

#[async_trait]
impl Transport for NoTransport {
    async fn send(
        &self,
        _endpoint: &str,
        _envelope: &EventEnvelope,
    ) -> Result<EventEnvelope, DispatchError> {
        Err(DispatchError::NoTransport)
    }
}

/// HTTP transport posting envelopes as JSON.
#[cfg(feature = "http-transport")]
#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http-transport")]
impl HttpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "http-transport")]
#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        endpoint: &str,
        envelope: &EventEnvelope,
    ) -> Result<EventEnvelope, DispatchError> {
        let response = self
            .client
            .post(endpoint)
            .json(envelope)
            .send()
            .await
            .map_err(|error| DispatchError::Unreachable {
                endpoint: endpoint.to_string(),
                message: error.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Remote {
                endpoint: endpoint.to_string(),
                message: format!("{status}: {body}"),
            });
        }

        response
            .json::<EventEnvelope>()
            .await
            .map_err(|error| DispatchError::Remote {
                endpoint: endpoint.to_string(),
                message: format!("malformed response envelope: {error}"),
            })
    }
}

// =============================================================================
// Retry policy
// =============================================================================

/// Bounded exponential backoff for retryable dispatch failures.
///
/// The default performs no retries beyond the transport's own behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    retries: usize,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retry attempts after the initial one.
    #[must_use]
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay = base;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = max;
        self
    }

    /// Disables jitter; delays become exact powers of the base.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    #[must_use]
    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Backoff before retry number `attempt` (zero-based): the base delay
    /// doubled per attempt, capped, with up to 50% downward jitter.
    #[must_use]
    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(16) as u32;
        let capped = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter && !capped.is_zero() {
            let millis = capped.as_millis() as u64;
            Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
        } else {
            capped
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Resolves cross-function edges into remote invocations.
pub struct DistributedDispatcher {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl Default for DistributedDispatcher {
    fn default() -> Self {
        Self::disconnected()
    }
}

impl DistributedDispatcher {
    #[must_use]
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::shared(Arc::new(transport))
    }

    #[must_use]
    pub fn shared(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: EngineConfig::DEFAULT_REMOTE_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// A dispatcher without a transport; every dispatch fails with
    /// [`DispatchError::NoTransport`]. The default for single-function
    /// graphs.
    #[must_use]
    pub fn disconnected() -> Self {
        Self::new(NoTransport)
    }

    /// Bounds each remote round trip; an elapsed timeout counts as
    /// [`DispatchError::Unreachable`].
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolves a function's endpoint: the graph's declaration wins,
    /// otherwise the context's resolver is consulted.
    pub fn resolve_endpoint(
        graph: &CompiledGraph,
        ctx: &Context,
        function: &str,
    ) -> Result<String, DispatchError> {
        graph
            .function_endpoint(function)
            .map(str::to_string)
            .or_else(|| ctx.remote_endpoint(function))
            .ok_or_else(|| DispatchError::MissingEndpoint {
                function: function.to_string(),
            })
    }

    /// Sends an envelope to the function owning `target_step`, stamping
    /// [`STEP_HEADER`] so the remote engine resumes there, and awaits the
    /// remote sub-graph's response envelope.
    #[instrument(skip(self, graph, ctx, envelope), err)]
    pub async fn dispatch(
        &self,
        graph: &CompiledGraph,
        ctx: &Context,
        function: &str,
        target_step: &str,
        envelope: EventEnvelope,
    ) -> Result<EventEnvelope, DispatchError> {
        let endpoint = Self::resolve_endpoint(graph, ctx, function)?;
        let envelope = envelope.with_header(STEP_HEADER, target_step);
        self.call(&endpoint, &envelope).await
    }

    /// Invokes an endpoint directly, applying the timeout and retry
    /// policy. Used for remote task steps addressed by URL.
    pub async fn call(
        &self,
        endpoint: &str,
        envelope: &EventEnvelope,
    ) -> Result<EventEnvelope, DispatchError> {
        let mut attempt = 0;
        loop {
            let outcome = tokio::time::timeout(self.timeout, self.transport.send(endpoint, envelope))
                .await
                .unwrap_or_else(|_| {
                    Err(DispatchError::Unreachable {
                        endpoint: endpoint.to_string(),
                        message: format!("no response within {:?}", self.timeout),
                    })
                });

            match outcome {
                Ok(response) => return Ok(response),
                Err(error) if error.is_retryable() && attempt < self.retry.retries() => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        endpoint,
                        attempt,
                        ?delay,
                        %error,
                        "retrying unreachable endpoint"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl std::fmt::Debug for DistributedDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedDispatcher")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

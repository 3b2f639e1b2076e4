//! Per-deployment execution context passed explicitly to every handler.
//!
//! A [`Context`] is created once per deployed graph instance and shared by
//! every envelope traversal. It carries the read-only `parameters` map, the
//! name of the function unit this process is running as, and the injected
//! capabilities the engine itself never implements: secret lookup, store
//! resource access, and remote endpoint resolution.
//!
//! Handlers receive `&Context` on every invocation; there is no ambient or
//! global state to reach for.

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

use crate::graph::CompiledGraph;

/// The implicit owning function of steps that declare none.
pub const ROOT_FUNCTION: &str = "root";

/// Secret lookup capability, delegated to the hosting platform.
pub trait SecretStore: Send + Sync {
    /// Returns the secret value for `key`, or `None` when absent.
    fn secret(&self, key: &str) -> Option<String>;
}

/// Store-resource lookup capability (feature sets, artifacts, ...).
pub trait ResourceStore: Send + Sync {
    /// Returns the resource identified by `uri`, or `None` when absent.
    fn resource(&self, uri: &str) -> Option<Value>;
}

/// Resolves a function unit name to its externally reachable endpoint.
pub trait EndpointResolver: Send + Sync {
    /// Returns the endpoint URL for `function`, or `None` when unknown.
    fn endpoint(&self, function: &str) -> Option<String>;
}

/// Environment-backed [`SecretStore`].
///
/// Reads secrets from process environment variables, loading a `.env` file
/// once on construction when present. This is the default store; platforms
/// with a real secret service inject their own implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    #[must_use]
    pub fn new() -> Self {
        dotenvy::dotenv().ok();
        Self
    }
}

impl SecretStore for EnvSecretStore {
    fn secret(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Map-backed [`ResourceStore`], empty by default.
#[derive(Clone, Debug, Default)]
pub struct StaticResources {
    resources: FxHashMap<String, Value>,
}

impl StaticResources {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource under `uri`.
    #[must_use]
    pub fn with_resource(mut self, uri: impl Into<String>, value: Value) -> Self {
        self.resources.insert(uri.into(), value);
        self
    }
}

impl ResourceStore for StaticResources {
    fn resource(&self, uri: &str) -> Option<Value> {
        self.resources.get(uri).cloned()
    }
}

/// Map-backed [`EndpointResolver`], empty by default.
///
/// # Examples
///
/// ```
/// use servegraph::context::{EndpointResolver, StaticEndpoints};
///
/// let endpoints = StaticEndpoints::new().with_endpoint("enrich", "http://enrich.local:8080");
/// assert_eq!(
///     endpoints.endpoint("enrich").as_deref(),
///     Some("http://enrich.local:8080")
/// );
/// assert!(endpoints.endpoint("unknown").is_none());
/// ```
#[derive(Clone, Debug, Default)]
pub struct StaticEndpoints {
    endpoints: FxHashMap<String, String>,
}

impl StaticEndpoints {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the endpoint URL for a function unit.
    #[must_use]
    pub fn with_endpoint(mut self, function: impl Into<String>, url: impl Into<String>) -> Self {
        self.endpoints.insert(function.into(), url.into());
        self
    }
}

impl EndpointResolver for StaticEndpoints {
    fn endpoint(&self, function: &str) -> Option<String> {
        self.endpoints.get(function).cloned()
    }
}

/// Process/graph-scoped state handed to every step invocation.
///
/// # Examples
///
/// ```
/// use servegraph::context::Context;
/// use serde_json::json;
///
/// let ctx = Context::new()
///     .with_param("model_version", json!("v3"))
///     .with_function("enrich");
///
/// assert_eq!(ctx.param("model_version"), Some(&json!("v3")));
/// assert_eq!(ctx.param_or("threshold", json!(0.5)), json!(0.5));
/// assert_eq!(ctx.current_function(), "enrich");
/// ```
pub struct Context {
    parameters: FxHashMap<String, Value>,
    current_function: String,
    secrets: Arc<dyn SecretStore>,
    resources: Arc<dyn ResourceStore>,
    endpoints: Arc<dyn EndpointResolver>,
    graph: OnceLock<Arc<CompiledGraph>>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a context for the root function with empty parameters,
    /// env-backed secrets, and empty resource/endpoint tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parameters: FxHashMap::default(),
            current_function: ROOT_FUNCTION.to_string(),
            secrets: Arc::new(EnvSecretStore::new()),
            resources: Arc::new(StaticResources::new()),
            endpoints: Arc::new(StaticEndpoints::new()),
            graph: OnceLock::new(),
        }
    }

    /// Sets a deploy-time parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Replaces the full parameter map.
    #[must_use]
    pub fn with_parameters(mut self, parameters: FxHashMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Names the function unit this process runs as (default: `root`).
    ///
    /// The engine executes only steps owned by this function; edges leading
    /// to other functions go through the distributed dispatcher.
    #[must_use]
    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.current_function = function.into();
        self
    }

    /// Injects a secret store implementation.
    #[must_use]
    pub fn with_secrets(mut self, secrets: impl SecretStore + 'static) -> Self {
        self.secrets = Arc::new(secrets);
        self
    }

    /// Injects a resource store implementation.
    #[must_use]
    pub fn with_resources(mut self, resources: impl ResourceStore + 'static) -> Self {
        self.resources = Arc::new(resources);
        self
    }

    /// Injects an endpoint resolver implementation.
    #[must_use]
    pub fn with_endpoints(mut self, endpoints: impl EndpointResolver + 'static) -> Self {
        self.endpoints = Arc::new(endpoints);
        self
    }

    /// Reads a deploy-time parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// Reads a deploy-time parameter, falling back to `default`.
    #[must_use]
    pub fn param_or(&self, key: &str, default: Value) -> Value {
        self.parameters.get(key).cloned().unwrap_or(default)
    }

    /// The name of the function unit this process runs as.
    #[must_use]
    pub fn current_function(&self) -> &str {
        &self.current_function
    }

    /// Looks up a secret through the injected store.
    #[must_use]
    pub fn secret(&self, key: &str) -> Option<String> {
        self.secrets.secret(key)
    }

    /// Looks up a store resource through the injected store.
    #[must_use]
    pub fn store_resource(&self, uri: &str) -> Option<Value> {
        self.resources.resource(uri)
    }

    /// Resolves a function unit name to its endpoint URL.
    #[must_use]
    pub fn remote_endpoint(&self, function: &str) -> Option<String> {
        self.endpoints.endpoint(function)
    }

    /// Binds the owning compiled graph. Called once by the engine that
    /// adopts this context; later calls against a different graph are
    /// ignored with a warning.
    pub(crate) fn bind_graph(&self, graph: Arc<CompiledGraph>) {
        if self.graph.set(graph).is_err() {
            tracing::warn!("context already bound to a compiled graph; ignoring rebind");
        }
    }

    /// Handle to the owning compiled graph, once an engine has adopted
    /// this context.
    #[must_use]
    pub fn graph(&self) -> Option<&Arc<CompiledGraph>> {
        self.graph.get()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("parameters", &self.parameters)
            .field("current_function", &self.current_function)
            .field("graph_bound", &self.graph.get().is_some())
            .finish_non_exhaustive()
    }
}

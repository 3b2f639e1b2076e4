//! Build-time handler registry.
//!
//! Graphs can reference handlers by name instead of embedding them
//! directly. The registry maps names to factories; the graph builder looks
//! the name up while the graph is being assembled, so a missing or
//! misconfigured handler surfaces as a build error rather than a runtime
//! failure.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::steps::handler::Handler;

/// Constructs a handler instance from JSON parameters.
pub type HandlerFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn Handler>, RegistryError> + Send + Sync>;

/// Errors raised while resolving a named handler.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum RegistryError {
    #[error("no handler registered under '{name}'")]
    #[diagnostic(
        code(servegraph::registry::unknown),
        help("register the handler with HandlerRegistry::register before building the graph")
    )]
    Unknown { name: String },

    #[error("handler '{name}' rejected its parameters: {message}")]
    #[diagnostic(
        code(servegraph::registry::construction),
        help("check the parameter object passed to add_named_task against the factory's contract")
    )]
    Construction { name: String, message: String },
}

/// Maps handler names to factories.
///
/// Factories receive the parameter object recorded on the step, letting one
/// registered name back many differently configured steps.
///
/// # Examples
///
/// ```
/// use servegraph::context::Context;
/// use servegraph::steps::{Handler, HandlerRegistry, RegistryError, StepError};
/// use async_trait::async_trait;
/// use serde_json::{Value, json};
/// use std::sync::Arc;
///
/// struct Scale(f64);
///
/// #[async_trait]
/// impl Handler for Scale {
///     async fn handle(&self, input: Value, _ctx: &Context) -> Result<Value, StepError> {
///         let x = input.as_f64().ok_or(StepError::MissingInput { what: "number" })?;
///         Ok(json!(x * self.0))
///     }
/// }
///
/// let registry = HandlerRegistry::new().with_factory("scale", |params| {
///     let factor = params.get("factor").and_then(Value::as_f64).ok_or_else(|| {
///         RegistryError::Construction {
///             name: "scale".into(),
///             message: "missing numeric 'factor'".into(),
///         }
///     })?;
///     Ok(Arc::new(Scale(factor)) as Arc<dyn Handler>)
/// });
///
/// assert!(registry.build("scale", &json!({"factor": 2.0})).is_ok());
/// assert!(registry.build("scale", &json!({})).is_err());
/// ```
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: FxHashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: FxHashMap::default(),
        }
    }

    /// Registers a factory under `name`, replacing any previous entry.
    ///
    /// # Returns
    /// A mutable reference to self for method chaining.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Arc<dyn Handler>, RegistryError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Builder-style method for registering a factory.
    ///
    /// Consumes self and returns it, enabling fluent construction.
    #[must_use]
    pub fn with_factory<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<Arc<dyn Handler>, RegistryError> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    /// Registers a parameter-less handler under `name`.
    pub fn register_handler(
        &mut self,
        name: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> &mut Self {
        let shared: Arc<dyn Handler> = Arc::new(handler);
        self.register(name, move |_params| Ok(Arc::clone(&shared)))
    }

    /// Builder-style variant of [`register_handler`](Self::register_handler).
    #[must_use]
    pub fn with_handler(mut self, name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.register_handler(name, handler);
        self
    }

    /// True when a factory is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Constructs the handler registered under `name` with `params`.
    pub fn build(&self, name: &str, params: &Value) -> Result<Arc<dyn Handler>, RegistryError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RegistryError::Unknown { name: name.into() })?;
        factory(params)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::steps::handler::StepError;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, input: Value, _ctx: &Context) -> Result<Value, StepError> {
            Ok(input)
        }
    }

    #[tokio::test]
    /// A registered parameter-less handler resolves and runs.
    async fn test_register_handler_resolves() {
        let registry = HandlerRegistry::new().with_handler("echo", Echo);
        assert!(registry.contains("echo"));

        let handler = registry.build("echo", &Value::Null).unwrap();
        let out = handler.handle(json!(41), &Context::new()).await.unwrap();
        assert_eq!(out, json!(41));
    }

    #[test]
    /// Unknown names produce RegistryError::Unknown.
    fn test_unknown_name() {
        let registry = HandlerRegistry::new();
        let err = registry.build("nope", &Value::Null).unwrap_err();
        assert!(matches!(err, RegistryError::Unknown { name } if name == "nope"));
    }

    #[test]
    /// Re-registering a name replaces the previous factory.
    fn test_reregister_replaces() {
        let mut registry = HandlerRegistry::new();
        registry.register("h", |_params| {
            Err(RegistryError::Construction {
                name: "h".into(),
                message: "first".into(),
            })
        });
        registry.register_handler("h", Echo);
        assert!(registry.build("h", &Value::Null).is_ok());
    }
}

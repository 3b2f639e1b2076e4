//! Routing-by-key dispatch and ensemble fan-out.
//!
//! A [`Router`] owns an ordered set of named routes, each wrapping a child
//! [`Step`]. In single-dispatch mode the route key is taken from the
//! envelope's `path` (the segment following the router's prefix) and exactly
//! one route runs. In ensemble mode every route receives a copy of the
//! envelope concurrently and the results are aggregated into one object
//! keyed by route name.
//!
//! The router itself is pure configuration; the engines interpret it.
//!
//! # Examples
//!
//! ```
//! use servegraph::router::{RouteStrategy, Router};
//! use servegraph::steps::Step;
//! use servegraph::context::Context;
//! use servegraph::steps::{Handler, StepError};
//! use async_trait::async_trait;
//! use serde_json::Value;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Handler for Echo {
//!     async fn handle(&self, input: Value, _ctx: &Context) -> Result<Value, StepError> {
//!         Ok(input)
//!     }
//! }
//!
//! let router = Router::new()
//!     .with_prefix("api")
//!     .with_route("predict", Step::task("predict", Echo))
//!     .with_route("explain", Step::task("explain", Echo));
//!
//! assert_eq!(router.strategy(), RouteStrategy::Single);
//! assert_eq!(router.route_key("/api/predict/123"), Some("predict"));
//! assert!(router.find_route("explain").is_some());
//! assert!(router.find_route("train").is_none());
//! ```

use crate::steps::Step;

/// How a router treats its routes when an envelope arrives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteStrategy {
    /// Pick exactly one route by key extracted from the envelope path.
    Single,
    /// Fan a copy of the envelope out to every route and aggregate the
    /// results by route name.
    Ensemble,
}

/// A named branch of a router wrapping a child step.
#[derive(Clone, Debug)]
pub struct Route {
    pub(crate) name: String,
    pub(crate) step: Step,
    pub(crate) optional: bool,
}

impl Route {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn step(&self) -> &Step {
        &self.step
    }

    /// In ensemble mode an optional route's failure becomes an error marker
    /// in its aggregate slot instead of failing the whole router.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

/// Ordered route table plus dispatch strategy and path prefix.
#[derive(Clone, Debug)]
pub struct Router {
    strategy: RouteStrategy,
    prefix: String,
    routes: Vec<Route>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Creates a single-dispatch router with the default `api` prefix.
    #[must_use]
    pub fn new() -> Self {
        Self {
            strategy: RouteStrategy::Single,
            prefix: "api".to_string(),
            routes: Vec::new(),
        }
    }

    /// Creates an ensemble router with the default `api` prefix.
    #[must_use]
    pub fn ensemble() -> Self {
        Self {
            strategy: RouteStrategy::Ensemble,
            ..Self::new()
        }
    }

    /// Sets the path prefix route keys are extracted after. Leading and
    /// trailing slashes are insignificant; the prefix may span several
    /// segments (`v2/models`).
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Appends a route. Route order is preserved and determines the
    /// deterministic aggregation order in ensemble mode.
    #[must_use]
    pub fn with_route(mut self, name: impl Into<String>, step: Step) -> Self {
        self.routes.push(Route {
            name: name.into(),
            step,
            optional: false,
        });
        self
    }

    /// Appends a route whose failure is tolerated in ensemble mode.
    #[must_use]
    pub fn with_optional_route(mut self, name: impl Into<String>, step: Step) -> Self {
        self.routes.push(Route {
            name: name.into(),
            step,
            optional: true,
        });
        self
    }

    #[must_use]
    pub fn strategy(&self) -> RouteStrategy {
        self.strategy
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Looks a route up by name.
    #[must_use]
    pub fn find_route(&self, name: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.name == name)
    }

    /// Extracts the route key from an envelope path: the segment that
    /// follows the prefix segments. Returns `None` when the path does not
    /// carry the prefix or ends before the route segment.
    #[must_use]
    pub fn route_key<'a>(&self, path: &'a str) -> Option<&'a str> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        for expected in self.prefix.split('/').filter(|s| !s.is_empty()) {
            if segments.next()? != expected {
                return None;
            }
        }
        segments.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::steps::{Handler, StepError};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Noop;

    #[async_trait]
    impl Handler for Noop {
        async fn handle(&self, input: Value, _ctx: &Context) -> Result<Value, StepError> {
            Ok(input)
        }
    }

    fn child(name: &str) -> Step {
        Step::task(name, Noop)
    }

    #[test]
    /// Key extraction walks prefix segments then yields the next one.
    fn test_route_key_extraction() {
        let router = Router::new().with_prefix("api");
        assert_eq!(router.route_key("/api/predict"), Some("predict"));
        assert_eq!(router.route_key("/api/predict/v1/infer"), Some("predict"));
        assert_eq!(router.route_key("api/predict"), Some("predict"));
        assert_eq!(router.route_key("/api/"), None);
        assert_eq!(router.route_key("/other/predict"), None);
        assert_eq!(router.route_key(""), None);
    }

    #[test]
    /// Multi-segment prefixes match segment by segment.
    fn test_route_key_multi_segment_prefix() {
        let router = Router::new().with_prefix("/v2/models/");
        assert_eq!(router.route_key("/v2/models/iris/infer"), Some("iris"));
        assert_eq!(router.route_key("/v2/iris"), None);
    }

    #[test]
    /// An empty prefix takes the first path segment as the key.
    fn test_route_key_empty_prefix() {
        let router = Router::new().with_prefix("");
        assert_eq!(router.route_key("/predict/x"), Some("predict"));
    }

    #[test]
    /// Routes keep insertion order and expose the optional flag.
    fn test_route_order_and_optional() {
        let router = Router::ensemble()
            .with_route("m1", child("m1"))
            .with_optional_route("m2", child("m2"));

        let names: Vec<&str> = router.routes().iter().map(Route::name).collect();
        assert_eq!(names, ["m1", "m2"]);
        assert!(!router.find_route("m1").unwrap().is_optional());
        assert!(router.find_route("m2").unwrap().is_optional());
        assert_eq!(router.strategy(), RouteStrategy::Ensemble);
    }
}

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use servegraph::context::Context;
use servegraph::steps::{Handler, StepError};
use std::sync::Arc;
use std::time::Duration;

/// Doubles a numeric body.
pub struct Double;

#[async_trait]
impl Handler for Double {
    async fn handle(&self, input: Value, _ctx: &Context) -> Result<Value, StepError> {
        let n = input.as_i64().ok_or(StepError::MissingInput { what: "number" })?;
        Ok(json!(n * 2))
    }
}

/// Returns the same value regardless of input.
pub struct Fixed(pub Value);

#[async_trait]
impl Handler for Fixed {
    async fn handle(&self, _input: Value, _ctx: &Context) -> Result<Value, StepError> {
        Ok(self.0.clone())
    }
}

/// Appends its tag to an array body, wrapping non-array bodies first.
pub struct Tag(pub &'static str);

#[async_trait]
impl Handler for Tag {
    async fn handle(&self, input: Value, _ctx: &Context) -> Result<Value, StepError> {
        let mut seen = match input {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        seen.push(json!(self.0));
        Ok(Value::Array(seen))
    }
}

/// Records every body it observes and passes it through unchanged.
pub struct Recorder(pub Arc<Mutex<Vec<Value>>>);

#[async_trait]
impl Handler for Recorder {
    async fn handle(&self, input: Value, _ctx: &Context) -> Result<Value, StepError> {
        self.0.lock().push(input.clone());
        Ok(input)
    }
}

/// Like [`Recorder`], but holds each envelope for a moment first.
pub struct SlowRecorder(pub Arc<Mutex<Vec<Value>>>, pub Duration);

#[async_trait]
impl Handler for SlowRecorder {
    async fn handle(&self, input: Value, _ctx: &Context) -> Result<Value, StepError> {
        tokio::time::sleep(self.1).await;
        self.0.lock().push(input.clone());
        Ok(input)
    }
}

/// Fails every invocation.
pub struct Explode;

#[async_trait]
impl Handler for Explode {
    async fn handle(&self, _input: Value, _ctx: &Context) -> Result<Value, StepError> {
        Err(StepError::Failed("kaboom".into()))
    }
}

/// Shared log plus a recorder wired to it.
pub fn collector() -> (Arc<Mutex<Vec<Value>>>, Recorder) {
    let log = Arc::new(Mutex::new(Vec::new()));
    (log.clone(), Recorder(log))
}

//! Dotted-path addressing inside envelope bodies.
//!
//! Steps declare where their input comes from (`input_path`) and where their
//! result lands (`result_path`) as dot-separated paths into the envelope's
//! JSON body, e.g. `req.body` or `predictions.0.score`. This module is the
//! small interpreter for those paths: [`extract`] reads a sub-value,
//! [`merge`] places one, and [`get`] is the borrowing lookup both build on.
//!
//! Segments index into objects by key and into arrays by parsed integer
//! position. An empty path addresses the whole body.

use miette::Diagnostic;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised by path resolution.
#[derive(Clone, Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum PathError {
    /// An intermediate or final segment was absent from the body.
    #[error("path '{path}' not found: missing segment '{segment}'")]
    #[diagnostic(
        code(servegraph::paths::not_found),
        help("Check the step's input_path against the shape of the upstream body.")
    )]
    NotFound { path: String, segment: String },
}

/// Borrowing lookup of the value at a dotted path.
///
/// Returns `None` when any segment is absent, indexes a non-container, or
/// fails to parse as an array index.
///
/// # Examples
///
/// ```
/// use servegraph::paths::get;
/// use serde_json::json;
///
/// let body = json!({"req": {"items": [{"sku": "a"}, {"sku": "b"}]}});
/// assert_eq!(get(&body, "req.items.1.sku"), Some(&json!("b")));
/// assert_eq!(get(&body, "req.missing"), None);
/// assert_eq!(get(&body, ""), Some(&body));
/// ```
#[must_use]
pub fn get<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(body);
    }
    let mut current = body;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Extracts an owned copy of the value at a dotted path.
///
/// Fails with [`PathError::NotFound`] naming the first missing segment when
/// the path cannot be resolved.
///
/// # Examples
///
/// ```
/// use servegraph::paths::extract;
/// use serde_json::json;
///
/// let body = json!({"req": {"body": "x"}});
/// assert_eq!(extract(&body, "req.body").unwrap(), json!("x"));
/// assert!(extract(&body, "req.nope").is_err());
/// ```
pub fn extract(body: &Value, path: &str) -> Result<Value, PathError> {
    if path.is_empty() {
        return Ok(body.clone());
    }
    let mut current = body;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => {
                return Err(PathError::NotFound {
                    path: path.to_string(),
                    segment: segment.to_string(),
                });
            }
        }
    }
    Ok(current.clone())
}

/// Returns a new body with `value` placed at the dotted path.
///
/// Intermediate mappings are created as needed; a non-container in the way
/// is replaced by a fresh mapping. A numeric segment whose parent is already
/// an array assigns in place when the index is in bounds. An empty path
/// replaces the entire body with `value`.
///
/// # Examples
///
/// ```
/// use servegraph::paths::merge;
/// use serde_json::json;
///
/// let body = json!({"req": {"body": "x"}});
/// let merged = merge(body, "resp", json!("X"));
/// assert_eq!(merged, json!({"req": {"body": "x"}, "resp": "X"}));
///
/// // Empty path replaces the body wholesale.
/// assert_eq!(merge(json!({"a": 1}), "", json!(42)), json!(42));
/// ```
#[must_use]
pub fn merge(body: Value, path: &str, value: Value) -> Value {
    if path.is_empty() {
        return value;
    }
    let mut body = body;
    let segments: Vec<&str> = path.split('.').collect();
    merge_into(&mut body, &segments, value);
    body
}

fn merge_into(target: &mut Value, segments: &[&str], value: Value) {
    match segments {
        [] => *target = value,
        [last] => {
            if let Value::Array(items) = target {
                if let Ok(index) = last.parse::<usize>() {
                    if index < items.len() {
                        items[index] = value;
                        return;
                    }
                }
            }
            if let Value::Object(map) = target {
                map.insert((*last).to_string(), value);
                return;
            }
            let mut map = Map::new();
            map.insert((*last).to_string(), value);
            *target = Value::Object(map);
        }
        [head, rest @ ..] => {
            if let Value::Array(items) = target {
                if let Ok(index) = head.parse::<usize>() {
                    if index < items.len() {
                        merge_into(&mut items[index], rest, value);
                        return;
                    }
                }
            }
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(map) = target {
                let child = map
                    .entry((*head).to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                merge_into(child, rest, value);
            }
        }
    }
}

// Inline tests live in tests/paths.rs alongside the property suites.

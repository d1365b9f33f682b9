//! Edge predicates evaluated against an upstream task's outputs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::task::Payload;

/// Condition on a dependency edge.
///
/// Encoded as JSON tagged by `op`, for example
/// `{"op": "equals", "key": "status", "value": "ok"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Predicate {
    /// The key is present in the outputs.
    Exists { key: String },
    /// The key is present and equal to `value`.
    Equals { key: String, value: Value },
    /// The key is present and truthy: not null, false, zero, or empty.
    Truthy { key: String },
    Not { predicate: Box<Predicate> },
    All { predicates: Vec<Predicate> },
    Any { predicates: Vec<Predicate> },
}

impl Predicate {
    pub fn exists(key: &str) -> Self {
        Predicate::Exists {
            key: key.to_string(),
        }
    }

    pub fn equals(key: &str, value: Value) -> Self {
        Predicate::Equals {
            key: key.to_string(),
            value,
        }
    }

    pub fn truthy(key: &str) -> Self {
        Predicate::Truthy {
            key: key.to_string(),
        }
    }

    pub fn negate(predicate: Predicate) -> Self {
        Predicate::Not {
            predicate: Box::new(predicate),
        }
    }

    pub fn evaluate(&self, outputs: &Payload) -> bool {
        match self {
            Predicate::Exists { key } => outputs.contains_key(key),
            Predicate::Equals { key, value } => outputs.get(key) == Some(value),
            Predicate::Truthy { key } => outputs.get(key).map(is_truthy).unwrap_or(false),
            Predicate::Not { predicate } => !predicate.evaluate(outputs),
            Predicate::All { predicates } => predicates.iter().all(|p| p.evaluate(outputs)),
            Predicate::Any { predicates } => predicates.iter().any(|p| p.evaluate(outputs)),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

//! Runtime values produced by the evaluator

use crate::error::{CalcError, Result};
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use twinrule_model::PointValue;

/// ISO-8601 layout used when rendering timestamps into text
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Text(String),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
    Duration(Duration),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Text(_) => "text",
            Value::Json(_) => "json",
            Value::Timestamp(_) => "timestamp",
            Value::Duration(_) => "duration",
        }
    }

    /// Numeric view; booleans coerce to `{0, 1}`
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Json(v) => v.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Number(n) if !n.is_nan() => Some(*n != 0.0),
            Value::Json(v) => v.as_bool(),
            _ => None,
        }
    }

    pub fn expect_f64(&self, context: &str) -> Result<f64> {
        self.as_f64().ok_or_else(|| {
            CalcError::type_error(format!("{} expects a number, got {}", context, self.type_name()))
        })
    }

    pub fn expect_bool(&self, context: &str) -> Result<bool> {
        self.as_bool().ok_or_else(|| {
            CalcError::type_error(format!("{} expects a boolean, got {}", context, self.type_name()))
        })
    }

    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Number(n) if n.is_nan())
    }

    /// Convert a JSON member into the closest scalar value
    pub fn from_json(json: &serde_json::Value) -> Option<Self> {
        match json {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number),
            serde_json::Value::String(s) => Some(Value::Text(s.clone())),
            other => Some(Value::Json(other.clone())),
        }
    }

    /// Storable form for a time series buffer
    ///
    /// Timestamps become ISO text and durations become seconds.
    pub fn to_point(&self) -> PointValue {
        match self {
            Value::Number(n) => PointValue::Number(*n),
            Value::Bool(b) => PointValue::Bool(*b),
            Value::Text(s) => PointValue::Text(s.clone()),
            Value::Json(v) => PointValue::Json(v.clone()),
            Value::Timestamp(t) => PointValue::Text(t.format(TIMESTAMP_FORMAT).to_string()),
            Value::Duration(d) => PointValue::Number(d.num_milliseconds() as f64 / 1000.0),
        }
    }

    /// Text used for `{field}` interpolation: numbers to two decimals, ISO timestamps
    pub fn render(&self) -> String {
        match self {
            Value::Number(n) => format!("{:.2}", n),
            Value::Bool(b) => b.to_string(),
            Value::Text(s) => s.clone(),
            Value::Json(v) => v.to_string(),
            Value::Timestamp(t) => t.format(TIMESTAMP_FORMAT).to_string(),
            Value::Duration(d) => format!("{:.2}", d.num_milliseconds() as f64 / 1000.0),
        }
    }
}

impl From<&PointValue> for Value {
    fn from(value: &PointValue) -> Self {
        match value {
            PointValue::Number(n) => Value::Number(*n),
            PointValue::Bool(b) => Value::Bool(*b),
            PointValue::Text(s) => Value::Text(s.clone()),
            PointValue::Json(v) => Value::Json(v.clone()),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Text(s) => write!(f, "{}", s),
            Value::Json(v) => write!(f, "{}", v),
            Value::Timestamp(t) => write!(f, "{}", t.format(TIMESTAMP_FORMAT)),
            Value::Duration(d) => write!(f, "{}s", d.num_milliseconds() as f64 / 1000.0),
        }
    }
}

//! Timed values
//!
//! A [`TimedValue`] is a single UTC-stamped telemetry or evaluation sample.
//! Exactly one value kind is populated, enforced by [`PointValue`] being an enum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a [`PointValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Number,
    Bool,
    Text,
    Json,
}

/// Payload of a timed value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Json(serde_json::Value),
}

impl PointValue {
    /// Interpret a raw telemetry field
    ///
    /// `true`/`false` (any case) become booleans, anything `f64` can parse
    /// becomes a number, `{..}`/`[..]` that parses as JSON becomes a JSON
    /// payload, and everything else is kept as text.
    pub fn parse_raw(raw: &str) -> Self {
        let t = raw.trim();
        if t.eq_ignore_ascii_case("true") {
            return PointValue::Bool(true);
        }
        if t.eq_ignore_ascii_case("false") {
            return PointValue::Bool(false);
        }
        if let Ok(n) = t.parse::<f64>() {
            return PointValue::Number(n);
        }
        if t.starts_with('{') || t.starts_with('[') {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(t) {
                return PointValue::Json(json);
            }
        }
        PointValue::Text(t.to_string())
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            PointValue::Number(_) => ValueKind::Number,
            PointValue::Bool(_) => ValueKind::Bool,
            PointValue::Text(_) => ValueKind::Text,
            PointValue::Json(_) => ValueKind::Json,
        }
    }

    /// Numeric view; booleans coerce to `{0, 1}`
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PointValue::Number(n) => Some(*n),
            PointValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            PointValue::Json(v) => v.as_f64(),
            PointValue::Text(_) => None,
        }
    }

    /// Boolean view; numbers are true when non-zero
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PointValue::Bool(b) => Some(*b),
            PointValue::Number(n) if n.is_finite() => Some(*n != 0.0),
            PointValue::Json(v) => v.as_bool(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PointValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// NaN and infinities are not storable
    pub fn is_valid(&self) -> bool {
        match self {
            PointValue::Number(n) => n.is_finite(),
            _ => true,
        }
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointValue::Number(n) => write!(f, "{}", n),
            PointValue::Bool(b) => write!(f, "{}", b),
            PointValue::Text(s) => write!(f, "{}", s),
            PointValue::Json(v) => write!(f, "{}", v),
        }
    }
}

impl From<f64> for PointValue {
    fn from(value: f64) -> Self {
        PointValue::Number(value)
    }
}

impl From<bool> for PointValue {
    fn from(value: bool) -> Self {
        PointValue::Bool(value)
    }
}

impl From<&str> for PointValue {
    fn from(value: &str) -> Self {
        PointValue::Text(value.to_string())
    }
}

/// A value with its UTC timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedValue {
    pub timestamp: DateTime<Utc>,
    pub value: PointValue,
}

impl TimedValue {
    pub fn new(timestamp: DateTime<Utc>, value: impl Into<PointValue>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }
}

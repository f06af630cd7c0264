//! Output Compression & Versioning
//!
//! Turns parameter buffers into a sparse output stream:
//!
//! - the `result` field is bucketed into `OverHowManyHours` windows; each window
//!   emits exactly one boolean point at its start, decided by the share of the
//!   window's time the raw result was true (with on/off hysteresis)
//! - every other field is change-compressed: a point is emitted when the value
//!   moves by more than the tolerance, and always for the first point of a window
//!
//! Output series are named `{equipment}_{rule}_{field}_V{version}`.

use crate::actor::{BoundParameter, InstanceKey, ParameterUpdate};
use crate::config::OutputConfig;
use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use twinrule_model::{PointValue, Rule, TimedValue, RESULT_FIELD_ID};

/// `{equipment}_{rule}_{field}_V{version}`
pub fn external_id(equipment_id: &str, rule_id: &str, field_id: &str, version: u32) -> String {
    format!("{}_{}_{}_V{}", equipment_id, rule_id, field_id, version)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    Number(f64),
    Text(String),
}

impl OutputValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OutputValue::Number(n) => Some(*n),
            OutputValue::Text(_) => None,
        }
    }
}

impl From<&PointValue> for OutputValue {
    fn from(value: &PointValue) -> Self {
        match value {
            PointValue::Number(n) => OutputValue::Number(*n),
            PointValue::Bool(b) => OutputValue::Number(if *b { 1.0 } else { 0.0 }),
            PointValue::Text(s) => OutputValue::Text(s.clone()),
            PointValue::Json(v) => OutputValue::Text(v.to_string()),
        }
    }
}

impl fmt::Display for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputValue::Number(n) => write!(f, "{}", n),
            OutputValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// One record handed to an [`crate::sink::OutputSink`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPoint {
    pub external_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: OutputValue,
    pub unit: Option<String>,
}

/// Start of the window containing `ts`, windows aligned to the Unix epoch
fn window_start(ts: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let size = window.num_milliseconds().max(1);
    let offset = ts.timestamp_millis().rem_euclid(size);
    ts - Duration::milliseconds(offset)
}

// ============================================================================
// Result bucketing
// ============================================================================

/// Time-weighted fault bucketing with hysteresis
///
/// Each raw value holds until the next one. A window's fraction is the true
/// time over the observed time inside it; windows fully covered by a gap carry
/// the held value.
#[derive(Debug, Clone)]
pub struct ResultBucketer {
    window: Duration,
    on_fraction: f64,
    off_fraction: f64,
    bucket_start: Option<DateTime<Utc>>,
    /// Start of observation inside the open bucket
    observed_from: Option<DateTime<Utc>>,
    held: Option<(DateTime<Utc>, bool)>,
    true_time: Duration,
    faulted: bool,
}

impl ResultBucketer {
    pub fn new(window: Duration, on_fraction: f64, off_fraction: f64) -> Self {
        Self {
            window: if window > Duration::zero() { window } else { Duration::hours(1) },
            on_fraction,
            off_fraction,
            bucket_start: None,
            observed_from: None,
            held: None,
            true_time: Duration::zero(),
            faulted: false,
        }
    }

    pub fn for_rule(rule: &Rule) -> Self {
        let window = Duration::milliseconds((rule.over_how_many_hours() * 3_600_000.0) as i64);
        Self::new(window, rule.percentage_of_time(), rule.percentage_of_time_off())
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Add a raw result; returns the windows this value closed
    pub fn push(&mut self, timestamp: DateTime<Utc>, value: bool) -> Vec<(DateTime<Utc>, bool)> {
        let mut closed = Vec::new();
        match self.held {
            None => {
                self.bucket_start = Some(window_start(timestamp, self.window));
                self.observed_from = Some(timestamp);
            },
            Some((since, held)) if timestamp > since => {
                let mut from = since;
                while let Some(start) = self.bucket_start {
                    let end = start + self.window;
                    if timestamp < end {
                        break;
                    }
                    if held {
                        self.true_time += end - from;
                    }
                    closed.push(self.close(end));
                    self.bucket_start = Some(end);
                    self.observed_from = Some(end);
                    from = end;
                }
                if held {
                    self.true_time += timestamp - from;
                }
            },
            Some(_) => return closed,
        }
        self.held = Some((timestamp, value));
        closed
    }

    /// Close the open window at the last observed timestamp
    pub fn flush(&mut self) -> Option<(DateTime<Utc>, bool)> {
        let (last, _) = self.held?;
        let window = self.close(last);
        self.bucket_start = None;
        self.observed_from = None;
        self.held = None;
        Some(window)
    }

    fn close(&mut self, until: DateTime<Utc>) -> (DateTime<Utc>, bool) {
        let start = self.bucket_start.unwrap_or(until);
        let observed = until - self.observed_from.unwrap_or(start);
        let fraction = if observed > Duration::zero() {
            self.true_time.num_milliseconds() as f64 / observed.num_milliseconds() as f64
        } else if self.held.is_some_and(|(_, v)| v) {
            1.0
        } else {
            0.0
        };

        let threshold = if self.faulted { self.off_fraction } else { self.on_fraction };
        self.faulted = if threshold <= 0.0 { fraction > 0.0 } else { fraction >= threshold };
        self.true_time = Duration::zero();
        (start, self.faulted)
    }
}

// ============================================================================
// Change compression
// ============================================================================

#[derive(Debug, Clone)]
pub struct ChangeCompressor {
    window: Duration,
    tolerance: f64,
    last: Option<(DateTime<Utc>, OutputValue)>,
}

impl ChangeCompressor {
    pub fn new(window: Duration, tolerance: f64) -> Self {
        Self {
            window: if window > Duration::zero() { window } else { Duration::hours(1) },
            tolerance: tolerance.max(0.0),
            last: None,
        }
    }

    /// Returns the value when it should be emitted
    pub fn push(&mut self, timestamp: DateTime<Utc>, value: OutputValue) -> Option<OutputValue> {
        let window = window_start(timestamp, self.window);
        let emit = match &self.last {
            None => true,
            Some((last_window, _)) if *last_window != window => true,
            Some((_, OutputValue::Number(a))) => match &value {
                OutputValue::Number(b) => (a - b).abs() > self.tolerance,
                OutputValue::Text(_) => true,
            },
            Some((_, previous)) => *previous != value,
        };
        if emit {
            self.last = Some((window, value.clone()));
            Some(value)
        } else {
            None
        }
    }
}

// ============================================================================
// Per-instance output
// ============================================================================

#[derive(Debug, Clone)]
enum Compression {
    Result(ResultBucketer),
    Changes(ChangeCompressor),
}

#[derive(Debug, Clone)]
struct FieldOutput {
    external_id: String,
    unit: Option<String>,
    compression: Compression,
}

/// Output pipelines for every parameter of one rule instance
#[derive(Debug, Clone)]
pub struct RuleOutputs {
    fields: FxHashMap<String, FieldOutput>,
}

impl RuleOutputs {
    pub fn new(
        key: &InstanceKey,
        rule: &Rule,
        version: u32,
        parameters: &[BoundParameter],
        config: &OutputConfig,
    ) -> Self {
        let window = Duration::seconds(config.window_secs);
        let fields = parameters
            .iter()
            .filter(|p| p.disabled.is_none())
            .map(|p| {
                let field_id = p.field_id();
                let compression = if field_id == RESULT_FIELD_ID {
                    Compression::Result(ResultBucketer::for_rule(rule))
                } else {
                    Compression::Changes(ChangeCompressor::new(window, config.tolerance))
                };
                let unit = match (&p.parameter.unit, p.impact) {
                    (Some(unit), _) => Some(unit.clone()),
                    (None, true) => Some(String::new()),
                    (None, false) => None,
                };
                let output = FieldOutput {
                    external_id: external_id(&key.equipment_id, &key.rule_id, field_id, version),
                    unit,
                    compression,
                };
                (field_id.to_string(), output)
            })
            .collect();
        Self { fields }
    }

    pub fn external_id(&self, field_id: &str) -> Option<&str> {
        self.fields.get(field_id).map(|f| f.external_id.as_str())
    }

    /// Feed freshly appended parameter values
    pub fn record(&mut self, updates: &[ParameterUpdate]) -> Vec<OutputPoint> {
        let mut points = Vec::new();
        for update in updates {
            let Some(field) = self.fields.get_mut(&update.field_id) else {
                continue;
            };
            let TimedValue { timestamp, value } = &update.value;
            match &mut field.compression {
                Compression::Result(bucketer) => {
                    let Some(faulted) = value.as_bool() else {
                        continue;
                    };
                    for (start, faulted) in bucketer.push(*timestamp, faulted) {
                        points.push(field.point(start, OutputValue::Number(f64::from(u8::from(faulted)))));
                    }
                },
                Compression::Changes(compressor) => {
                    if let Some(value) = compressor.push(*timestamp, OutputValue::from(value)) {
                        points.push(field.point(*timestamp, value));
                    }
                },
            }
        }
        points
    }

    /// Close open result windows
    pub fn flush(&mut self) -> Vec<OutputPoint> {
        let mut points = Vec::new();
        for field in self.fields.values_mut() {
            if let Compression::Result(bucketer) = &mut field.compression {
                if let Some((start, faulted)) = bucketer.flush() {
                    points.push(field.point(start, OutputValue::Number(f64::from(u8::from(faulted)))));
                }
            }
        }
        points.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        points
    }
}

impl FieldOutput {
    fn point(&self, timestamp: DateTime<Utc>, value: OutputValue) -> OutputPoint {
        OutputPoint {
            external_id: self.external_id.clone(),
            timestamp,
            value,
            unit: self.unit.clone(),
        }
    }
}

//! Time Series Buffer
//!
//! Ordered window of [`TimedValue`]s owned by a single actor parameter.
//!
//! Invariants:
//! - timestamps strictly increase; a value not after the last timestamp is dropped
//! - NaN / infinite numbers are never stored
//! - after [`TimeSeriesBuffer::push`] the retention policy holds, except that
//!   pruning never drops the last point at or before a cutoff, nor points a
//!   window of [`horizon`](TimeSeriesBuffer::horizon) still reads

use crate::value::TimedValue;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Hard cap on retained history
pub const MAX_BUFFER_DAYS: i64 = 365;

/// Retention policy for a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Maximum number of points kept
    pub max_count: Option<usize>,
    /// Maximum age of the oldest point relative to the newest one
    pub max_age: Option<Duration>,
}

impl RetentionPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_count: None,
            max_age: None,
        }
    }

    pub fn count(max_count: usize) -> Self {
        Self {
            max_count: Some(max_count),
            max_age: None,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_count: Some(10_000),
            max_age: Some(Duration::days(MAX_BUFFER_DAYS)),
        }
    }
}

/// Result of pushing a value into a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Appended,
    /// Timestamp not after the last stored timestamp
    Stale,
    /// NaN or infinite numeric value
    Invalid,
}

/// A buffered window of time series values
#[derive(Debug, Clone)]
pub struct TimeSeriesBuffer {
    points: VecDeque<TimedValue>,
    retention: RetentionPolicy,
    last_gap: Duration,
    /// Longest window read from this buffer
    horizon: Duration,
    unit: Option<String>,
}

impl TimeSeriesBuffer {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            points: VecDeque::new(),
            retention,
            last_gap: Duration::zero(),
            horizon: Duration::zero(),
            unit: None,
        }
    }

    pub fn with_horizon(mut self, horizon: Duration) -> Self {
        self.set_horizon(horizon);
        self
    }

    /// Keep enough history for a window of `horizon` ending at the last point
    pub fn set_horizon(&mut self, horizon: Duration) {
        self.horizon = horizon.max(Duration::zero());
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    pub fn with_unit(mut self, unit: Option<String>) -> Self {
        self.unit = unit;
        self
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Append a value, enforcing ordering and retention
    pub fn push(&mut self, value: TimedValue) -> PushOutcome {
        if !value.value.is_valid() {
            return PushOutcome::Invalid;
        }

        if let Some(last) = self.points.back() {
            if value.timestamp <= last.timestamp {
                return PushOutcome::Stale;
            }
            self.last_gap = value.timestamp - last.timestamp;
        }

        self.points.push_back(value);
        self.trim();
        PushOutcome::Appended
    }

    /// Enforce the retention policy
    ///
    /// The front point goes only while the one after it is already at or
    /// before the cutoff, so the start of a window can still be interpolated.
    /// The count limit never cuts into the horizon, and two points always stay.
    pub fn trim(&mut self) -> usize {
        let Some(last) = self.last_seen() else {
            return 0;
        };
        let mut removed = 0;

        if let Some(max_age) = self.retention.max_age {
            let cutoff = last - max_age;
            while self.points.len() > 2 && self.points[1].timestamp <= cutoff {
                self.points.pop_front();
                removed += 1;
            }
        }

        if let Some(max_count) = self.retention.max_count {
            let needed_from = last - self.horizon;
            while self.points.len() > max_count.max(2) && self.points[1].timestamp <= needed_from {
                self.points.pop_front();
                removed += 1;
            }
        }

        removed
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &TimedValue> + '_ {
        self.points.iter()
    }

    pub fn first(&self) -> Option<&TimedValue> {
        self.points.front()
    }

    pub fn last(&self) -> Option<&TimedValue> {
        self.points.back()
    }

    pub fn first_seen(&self) -> Option<DateTime<Utc>> {
        self.first().map(|p| p.timestamp)
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last().map(|p| p.timestamp)
    }

    /// Gap between the last value and the one before it
    pub fn last_gap(&self) -> Duration {
        self.last_gap
    }

    pub fn last_and_previous(&self) -> Option<(&TimedValue, &TimedValue)> {
        let n = self.points.len();
        if n < 2 {
            return None;
        }
        Some((&self.points[n - 1], &self.points[n - 2]))
    }

    /// Numeric difference between the last two points, 0 when unavailable
    pub fn last_delta(&self) -> f64 {
        self.last_and_previous()
            .and_then(|(last, previous)| Some(last.as_f64()? - previous.as_f64()?))
            .unwrap_or(0.0)
    }

    /// Points with `start <= timestamp <= end`
    pub fn range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Iterator<Item = &TimedValue> + '_ {
        let from = self.points.partition_point(|p| p.timestamp < start);
        let to = self.points.partition_point(|p| p.timestamp <= end);
        self.points.range(from..to.max(from))
    }

    /// Linearly interpolated numeric value at `at`
    ///
    /// Clamps to the first/last point outside the buffered range.
    pub fn value_at(&self, at: DateTime<Utc>) -> Option<f64> {
        let idx = self.points.partition_point(|p| p.timestamp <= at);
        if idx == 0 {
            return self.first().and_then(TimedValue::as_f64);
        }
        let before = &self.points[idx - 1];
        let Some(after) = self.points.get(idx) else {
            return before.as_f64();
        };

        let (v0, v1) = (before.as_f64()?, after.as_f64()?);
        let span = (after.timestamp - before.timestamp).num_milliseconds() as f64;
        if span <= 0.0 {
            return Some(v1);
        }
        let offset = (at - before.timestamp).num_milliseconds() as f64;
        Some(v0 + (v1 - v0) * offset / span)
    }

    /// Debug check that timestamps are in order
    pub fn is_in_order(&self) -> bool {
        self.points
            .iter()
            .zip(self.points.iter().skip(1))
            .all(|(a, b)| a.timestamp < b.timestamp)
    }
}

impl Default for TimeSeriesBuffer {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

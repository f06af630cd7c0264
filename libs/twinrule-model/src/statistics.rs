//! Sequence statistics
//!
//! Numeric reductions used by windowed formula functions. Empty input yields
//! NaN (or 0 for `Count`) so callers can propagate "undefined" without errors.

/// Numeric reduction over a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregation {
    Sum,
    Average,
    Min,
    Max,
    Count,
    /// Earliest element by time; callers pass values in time order
    First,
    /// Population standard deviation
    StandardDeviation,
}

impl Aggregation {
    /// Reduce `values`
    pub fn apply(self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return match self {
                Aggregation::Count => 0.0,
                _ => f64::NAN,
            };
        }

        match self {
            Aggregation::Sum => values.iter().sum(),

            Aggregation::Average => values.iter().sum::<f64>() / values.len() as f64,

            Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),

            Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),

            Aggregation::Count => values.len() as f64,

            Aggregation::First => values[0],

            Aggregation::StandardDeviation => {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                let variance =
                    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
                variance.sqrt()
            },
        }
    }
}

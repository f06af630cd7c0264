//! twinrule-model - Data model for the twinrule engine
//!
//! - **Timed values**: UTC-stamped number / boolean / text / JSON samples
//! - **Time series buffers**: ordered, retention-bounded windows per parameter
//! - **Statistics**: numeric reductions for windowed functions
//! - **Rules / calculated points / insights**: the engine's inputs and outputs

pub mod error;
pub mod insight;
pub mod rule;
pub mod statistics;
pub mod timeseries;
pub mod value;

pub use error::{ModelError, Result};
pub use insight::{ImpactScore, Insight, InsightStatus};
pub use rule::{
    CalculatedPoint, CumulativeSetting, Rule, RuleParameter, RuleUIElement, UIElementKind,
    RESULT_FIELD_ID,
};
pub use statistics::Aggregation;
pub use timeseries::{PushOutcome, RetentionPolicy, TimeSeriesBuffer, MAX_BUFFER_DAYS};
pub use value::{PointValue, TimedValue, ValueKind};

//! Rule definitions
//!
//! Rules arrive already authored and validated by the surrounding system. They are
//! immutable once bound into an actor generation; edits produce a new generation.

use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

/// Field id of the parameter that drives the fault state
pub const RESULT_FIELD_ID: &str = "result";

fn bool_true() -> bool {
    true
}

// ============================================================================
// Cumulative Setting
// ============================================================================

/// How a parameter's computed value is folded into its buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CumulativeSetting {
    /// Store the instantaneous value
    #[default]
    Simple,
    /// Add the value to the running total
    Accumulate,
    /// Add `value * gap` with the gap in seconds
    AccumulateTimeSeconds,
    /// Add `value * gap` with the gap in minutes
    AccumulateTimeMinutes,
    /// Add `value * gap` with the gap in hours
    AccumulateTimeHours,
}

impl CumulativeSetting {
    pub fn is_cumulative(self) -> bool {
        self != CumulativeSetting::Simple
    }

    /// Seconds per gap unit for time-integrating variants
    pub fn seconds_per_unit(self) -> Option<f64> {
        match self {
            CumulativeSetting::AccumulateTimeSeconds => Some(1.0),
            CumulativeSetting::AccumulateTimeMinutes => Some(60.0),
            CumulativeSetting::AccumulateTimeHours => Some(3600.0),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            CumulativeSetting::Simple => "simple",
            CumulativeSetting::Accumulate => "accumulate",
            CumulativeSetting::AccumulateTimeSeconds => "accumulate_time_seconds",
            CumulativeSetting::AccumulateTimeMinutes => "accumulate_time_minutes",
            CumulativeSetting::AccumulateTimeHours => "accumulate_time_hours",
        }
    }
}

impl From<String> for CumulativeSetting {
    fn from(raw: String) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "" | "simple" => CumulativeSetting::Simple,
            "accumulate" => CumulativeSetting::Accumulate,
            "accumulatetimeseconds" => CumulativeSetting::AccumulateTimeSeconds,
            "accumulatetimeminutes" => CumulativeSetting::AccumulateTimeMinutes,
            "accumulatetimehours" => CumulativeSetting::AccumulateTimeHours,
            _ => {
                warn!("Unknown cumulative setting '{}', using simple", raw);
                CumulativeSetting::Simple
            },
        }
    }
}

impl From<CumulativeSetting> for String {
    fn from(value: CumulativeSetting) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for CumulativeSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// A named formula inside a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleParameter {
    /// Identifier other formulas use to reference this parameter
    pub field_id: String,
    #[serde(default)]
    pub name: String,
    pub formula: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub cumulative: CumulativeSetting,
}

impl RuleParameter {
    pub fn new(field_id: impl Into<String>, formula: impl Into<String>) -> Self {
        let field_id = field_id.into();
        Self {
            name: field_id.clone(),
            field_id,
            formula: formula.into(),
            unit: None,
            cumulative: CumulativeSetting::Simple,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_cumulative(mut self, cumulative: CumulativeSetting) -> Self {
        self.cumulative = cumulative;
        self
    }
}

// ============================================================================
// UI Elements
// ============================================================================

/// Threshold configuration attached to a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UIElementKind {
    OverHowManyHours,
    PercentageOfTime,
    PercentageOfTimeOff,
    MinTrigger,
    MaxTrigger,
    /// Any other numeric setting, exposed to formulas by field id only
    #[default]
    Double,
}

impl UIElementKind {
    fn as_str(self) -> &'static str {
        match self {
            UIElementKind::OverHowManyHours => "over_how_many_hours",
            UIElementKind::PercentageOfTime => "percentage_of_time",
            UIElementKind::PercentageOfTimeOff => "percentage_of_time_off",
            UIElementKind::MinTrigger => "min_trigger",
            UIElementKind::MaxTrigger => "max_trigger",
            UIElementKind::Double => "double",
        }
    }
}

impl From<String> for UIElementKind {
    fn from(raw: String) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "overhowmanyhours" => UIElementKind::OverHowManyHours,
            "percentageoftime" => UIElementKind::PercentageOfTime,
            "percentageoftimeoff" => UIElementKind::PercentageOfTimeOff,
            "mintrigger" => UIElementKind::MinTrigger,
            "maxtrigger" => UIElementKind::MaxTrigger,
            "double" => UIElementKind::Double,
            _ => {
                warn!("Unknown rule element kind '{}', treating as double", raw);
                UIElementKind::Double
            },
        }
    }
}

impl From<UIElementKind> for String {
    fn from(value: UIElementKind) -> Self {
        value.as_str().to_string()
    }
}

/// A numeric threshold authored alongside a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleUIElement {
    /// Field id formulas use; defaults to the kind's snake-case name
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub kind: UIElementKind,
    pub value: f64,
}

impl RuleUIElement {
    pub fn new(kind: UIElementKind, value: f64) -> Self {
        Self {
            id: None,
            kind,
            value,
        }
    }

    pub fn field_id(&self) -> &str {
        self.id.as_deref().unwrap_or(self.kind.as_str())
    }
}

// ============================================================================
// Rule
// ============================================================================

/// A rule definition bound to every twin of its primary model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Model id of qualifying equipment
    pub primary_model_id: String,
    #[serde(default)]
    pub parameters: Vec<RuleParameter>,
    #[serde(default)]
    pub impact_scores: Vec<RuleParameter>,
    #[serde(default)]
    pub elements: Vec<RuleUIElement>,
    /// Insight text with `{field_id}` placeholders
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub recommendations: String,
    #[serde(default = "bool_true")]
    pub command_enabled: bool,
}

impl Rule {
    pub fn new(id: impl Into<String>, primary_model_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            primary_model_id: primary_model_id.into(),
            parameters: Vec::new(),
            impact_scores: Vec::new(),
            elements: Vec::new(),
            description: String::new(),
            recommendations: String::new(),
            command_enabled: true,
        }
    }

    /// Parameters followed by impact scores
    pub fn all_parameters(&self) -> impl Iterator<Item = &RuleParameter> + '_ {
        self.parameters.iter().chain(self.impact_scores.iter())
    }

    pub fn is_impact_score(&self, field_id: &str) -> bool {
        self.impact_scores.iter().any(|p| p.field_id == field_id)
    }

    pub fn element(&self, kind: UIElementKind) -> Option<f64> {
        self.elements.iter().find(|e| e.kind == kind).map(|e| e.value)
    }

    /// Output bucket length for the fault result, hours
    pub fn over_how_many_hours(&self) -> f64 {
        self.element(UIElementKind::OverHowManyHours)
            .filter(|h| *h > 0.0)
            .unwrap_or(1.0)
    }

    /// Fraction of a bucket the result must be true to fault
    pub fn percentage_of_time(&self) -> f64 {
        self.element(UIElementKind::PercentageOfTime)
            .map(normalize_fraction)
            .unwrap_or(0.0)
    }

    /// Fraction below which a faulted bucket clears
    pub fn percentage_of_time_off(&self) -> f64 {
        self.element(UIElementKind::PercentageOfTimeOff)
            .map(normalize_fraction)
            .unwrap_or_else(|| self.percentage_of_time())
    }

    /// Check identifiers before the rule is bound
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ModelError::invalid_rule("rule id is empty"));
        }
        if self.primary_model_id.trim().is_empty() {
            return Err(ModelError::invalid_rule(format!(
                "rule '{}' has no primary model id",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for param in self.all_parameters() {
            if param.field_id.trim().is_empty() {
                return Err(ModelError::invalid_rule(format!(
                    "rule '{}' has a parameter without field id",
                    self.id
                )));
            }
            if !seen.insert(param.field_id.as_str()) {
                return Err(ModelError::invalid_rule(format!(
                    "rule '{}' declares field '{}' twice",
                    self.id, param.field_id
                )));
            }
        }
        Ok(())
    }
}

/// Accept `50` as well as `0.5`
fn normalize_fraction(value: f64) -> f64 {
    if value > 1.0 {
        (value / 100.0).min(1.0)
    } else {
        value.max(0.0)
    }
}

// ============================================================================
// Calculated Point
// ============================================================================

/// A virtual sensor derived from other points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedPoint {
    /// External id the derived values are published under
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub formula: String,
    #[serde(default)]
    pub unit: Option<String>,
    /// Twin `this` refers to when binding the formula
    #[serde(default)]
    pub context_twin_id: Option<String>,
    #[serde(default)]
    pub cumulative: CumulativeSetting,
}

impl CalculatedPoint {
    pub fn new(id: impl Into<String>, formula: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            formula: formula.into(),
            unit: None,
            context_twin_id: None,
            cumulative: CumulativeSetting::Simple,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_cumulative_setting_parsing() {
        assert_eq!(
            CumulativeSetting::from("Accumulate".to_string()),
            CumulativeSetting::Accumulate
        );
        assert_eq!(
            CumulativeSetting::from("ACCUMULATE_TIME_HOURS".to_string()),
            CumulativeSetting::AccumulateTimeHours
        );
    }

    #[test]
    #[traced_test]
    fn test_unknown_cumulative_setting_falls_back() {
        assert_eq!(
            CumulativeSetting::from("sometimes".to_string()),
            CumulativeSetting::Simple
        );
        assert!(logs_contain("Unknown cumulative setting"));
    }

    #[test]
    fn test_rule_from_yaml() {
        let yaml = r#"
id: ahu-sat-high
primary_model_id: "dtmi:com:example:AirHandlingUnit;1"
parameters:
  - field_id: result
    formula: "[dtmi:com:example:SupplyAirTemperatureSensor;1] > max_trigger"
  - field_id: energy
    formula: "fan_power"
    cumulative: AccumulateTimeHours
impact_scores:
  - field_id: cost_impact
    formula: "energy * 0.2"
    unit: USD
elements:
  - kind: MaxTrigger
    value: 18
  - kind: PercentageOfTime
    value: 50
  - kind: Sparkle
    value: 1
"#;
        let rule: Rule = serde_yaml::from_str(yaml).unwrap();
        rule.validate().unwrap();

        assert!(rule.command_enabled);
        assert_eq!(rule.parameters[1].cumulative, CumulativeSetting::AccumulateTimeHours);
        assert!(rule.is_impact_score("cost_impact"));
        assert_eq!(rule.element(UIElementKind::MaxTrigger), Some(18.0));
        assert_eq!(rule.percentage_of_time(), 0.5);
        assert_eq!(rule.percentage_of_time_off(), 0.5);
        assert_eq!(rule.over_how_many_hours(), 1.0);
        assert_eq!(rule.elements[2].kind, UIElementKind::Double);
        assert_eq!(rule.elements[0].field_id(), "max_trigger");
    }

    #[test]
    fn test_duplicate_field_id_rejected() {
        let mut rule = Rule::new("r1", "dtmi:com:example:Fan;1");
        rule.parameters.push(RuleParameter::new("a", "1"));
        rule.impact_scores.push(RuleParameter::new("a", "2"));
        assert!(rule.validate().is_err());
    }
}

//! Insight records
//!
//! Persisted summary of a rule instance's fault status and impact scores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Lifecycle status of an insight in the surrounding workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InsightStatus {
    #[default]
    Open,
    Ignored,
    InProgress,
    Resolved,
    New,
    Deleted,
}

impl InsightStatus {
    fn as_str(self) -> &'static str {
        match self {
            InsightStatus::Open => "open",
            InsightStatus::Ignored => "ignored",
            InsightStatus::InProgress => "in_progress",
            InsightStatus::Resolved => "resolved",
            InsightStatus::New => "new",
            InsightStatus::Deleted => "deleted",
        }
    }
}

impl From<String> for InsightStatus {
    fn from(raw: String) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "open" => InsightStatus::Open,
            "ignored" => InsightStatus::Ignored,
            "inprogress" => InsightStatus::InProgress,
            "resolved" => InsightStatus::Resolved,
            "new" => InsightStatus::New,
            "deleted" => InsightStatus::Deleted,
            _ => {
                warn!("Unknown insight status '{}', using open", raw);
                InsightStatus::Open
            },
        }
    }
}

impl From<InsightStatus> for String {
    fn from(value: InsightStatus) -> Self {
        value.as_str().to_string()
    }
}

/// A unit-bearing secondary value attached to an insight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactScore {
    pub field_id: String,
    pub name: String,
    /// Output series the score is published under
    pub external_id: String,
    pub value: f64,
    pub unit: Option<String>,
}

/// Fault status of one (equipment, rule) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    /// `{equipment_id}_{rule_id}`
    pub id: String,
    pub rule_id: String,
    pub equipment_id: String,
    pub status: InsightStatus,
    pub is_faulty: bool,
    pub is_valid: bool,
    pub command_enabled: bool,
    pub faulted_count: u64,
    /// Number of evaluations that produced a result
    pub occurrence_count: u64,
    pub impact_scores: Vec<ImpactScore>,
    pub text: String,
    pub recommendations: String,
    pub earliest_faulted_date: Option<DateTime<Utc>>,
    pub last_faulted_date: Option<DateTime<Utc>>,
    /// Event time of the evaluation behind this record
    pub last_updated: DateTime<Utc>,
    /// Wall-clock time the record was last handed to the store
    pub last_sync_date_utc: DateTime<Utc>,
    pub version: u32,
}

impl Insight {
    pub fn instance_id(equipment_id: &str, rule_id: &str) -> String {
        format!("{}_{}", equipment_id, rule_id)
    }

    pub fn impact_score(&self, field_id: &str) -> Option<&ImpactScore> {
        self.impact_scores.iter().find(|s| s.field_id == field_id)
    }
}

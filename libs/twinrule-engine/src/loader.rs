//! Rule set files (`rules.yaml` / `rules.json`)

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};
use twinrule_model::{CalculatedPoint, Rule};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub calculated_points: Vec<CalculatedPoint>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>, calculated_points: Vec<CalculatedPoint>) -> Self {
        Self {
            rules,
            calculated_points,
        }
    }

    /// Parse YAML or JSON based on the file extension
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let set: RuleSet = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(content)?,
            other => {
                return Err(EngineError::config(format!(
                    "unsupported rule file extension {:?} for {}",
                    other,
                    path.display()
                )))
            },
        };
        set.validate()?;
        Ok(set)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let set = Self::parse(path, &content)?;
        info!(
            "Loaded {} rules and {} calculated points from {}",
            set.rules.len(),
            set.calculated_points.len(),
            path.display()
        );
        Ok(set)
    }

    /// Reject duplicate ids and malformed rules
    pub fn validate(&self) -> Result<()> {
        let mut rule_ids = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !rule_ids.insert(rule.id.as_str()) {
                return Err(EngineError::config(format!("duplicate rule id '{}'", rule.id)));
            }
        }

        let mut point_ids = HashSet::new();
        for point in &self.calculated_points {
            if point.id.trim().is_empty() {
                return Err(EngineError::config("calculated point without id"));
            }
            if !point_ids.insert(point.id.as_str()) {
                return Err(EngineError::config(format!(
                    "duplicate calculated point id '{}'",
                    point.id
                )));
            }
            if point.context_twin_id.is_none() {
                warn!("Calculated point {} has no context twin", point.id);
            }
        }
        Ok(())
    }
}

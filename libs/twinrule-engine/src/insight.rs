//! Insight Synchronizer
//!
//! Decides when a rule instance's state is handed to the insight store and
//! builds the record: fault flag, counts, impact scores and the interpolated
//! description / recommendations.
//!
//! Sync policy, first match wins:
//!
//! | condition                                   | sync |
//! |---------------------------------------------|------|
//! | command disabled, or no valid result yet    | no   |
//! | never synced                                | yes  |
//! | current result invalid                      | no   |
//! | faulted                                     | yes  |
//! | realtime run                                | no   |
//! | `force_sync_hours` of event time since sync | yes  |
//! | share of time since sync > `sync_fraction`  | yes  |

use crate::actor::{OutputState, RuleInstanceActor};
use crate::clock::Clock;
use crate::config::InsightConfig;
use crate::error::Result;
use crate::output::RuleOutputs;
use chrono::{DateTime, Duration, Utc};
use regex::{Captures, Regex};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use twinrule_calc::Value;
use twinrule_model::{ImpactScore, Insight, InsightStatus, Rule, TimedValue};

/// Whether a run replays history or follows live telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Batch,
    Realtime,
}

/// Renders `{field_id}` placeholders
#[derive(Debug, Clone)]
pub struct Interpolator {
    pattern: Regex,
}

impl Interpolator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(r"\{([A-Za-z0-9_]+)\}")?,
        })
    }

    /// Unknown placeholders are left as written
    pub fn render(&self, template: &str, values: &FxHashMap<String, Value>) -> String {
        self.pattern
            .replace_all(template, |caps: &Captures<'_>| match values.get(&caps[1]) {
                Some(value) => value.render(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

/// Per-instance sync state, owned by the rule actor's task
pub struct InsightTracker {
    rule: Arc<Rule>,
    version: u32,
    mode: RunMode,
    config: InsightConfig,
    clock: Arc<dyn Clock>,
    interpolator: Interpolator,
    /// (field id, output external id) per impact score
    impact_ids: Vec<(String, String)>,
    last_sync: Option<DateTime<Utc>>,
    latest: Option<Insight>,
}

impl InsightTracker {
    pub fn new(
        rule: Arc<Rule>,
        version: u32,
        mode: RunMode,
        config: InsightConfig,
        clock: Arc<dyn Clock>,
        interpolator: Interpolator,
        outputs: &RuleOutputs,
    ) -> Self {
        let impact_ids = rule
            .impact_scores
            .iter()
            .filter_map(|p| {
                let external_id = outputs.external_id(&p.field_id)?;
                Some((p.field_id.clone(), external_id.to_string()))
            })
            .collect();
        Self {
            rule,
            version,
            mode,
            config,
            clock,
            interpolator,
            impact_ids,
            last_sync: None,
            latest: None,
        }
    }

    /// Last record handed out
    pub fn latest(&self) -> Option<&Insight> {
        self.latest.as_ref()
    }

    pub fn should_sync(&self, actor: &RuleInstanceActor, timestamp: DateTime<Utc>) -> bool {
        let stats = actor.stats();
        if !self.rule.command_enabled || stats.occurrence_count == 0 {
            return false;
        }
        let Some(last_sync) = self.last_sync else {
            return true;
        };
        if !actor.state().is_valid() {
            return false;
        }
        if stats.is_faulty {
            return true;
        }
        if self.mode == RunMode::Realtime {
            return false;
        }

        let since_sync = timestamp - last_sync;
        let force_after = Duration::milliseconds((self.config.force_sync_hours * 3_600_000.0) as i64);
        if since_sync >= force_after {
            return true;
        }
        let since_first = stats
            .first_occurrence
            .map(|first| timestamp - first)
            .unwrap_or_else(Duration::zero);
        since_first > Duration::zero()
            && since_sync.num_milliseconds() as f64 / since_first.num_milliseconds() as f64
                > self.config.sync_fraction
    }

    /// Called after an evaluation that touched the result field
    pub fn observe(&mut self, actor: &RuleInstanceActor, timestamp: DateTime<Utc>) -> Option<Insight> {
        if !self.should_sync(actor, timestamp) {
            return None;
        }
        Some(self.sync(actor, timestamp))
    }

    /// Final sync when a batch run flushes
    pub fn finish(&mut self, actor: &RuleInstanceActor) -> Option<Insight> {
        let timestamp = actor.stats().last_evaluated?;
        let allowed = self.mode == RunMode::Batch
            && self.rule.command_enabled
            && actor.stats().occurrence_count > 0
            && self.last_sync != Some(timestamp);
        allowed.then(|| self.sync(actor, timestamp))
    }

    fn sync(&mut self, actor: &RuleInstanceActor, timestamp: DateTime<Utc>) -> Insight {
        let insight = self.build(actor, timestamp);
        debug!(rule_instance = %actor.key(), faulty = insight.is_faulty, "Insight sync at {}", timestamp);
        self.last_sync = Some(timestamp);
        self.latest = Some(insight.clone());
        insight
    }

    pub fn build(&self, actor: &RuleInstanceActor, timestamp: DateTime<Utc>) -> Insight {
        let key = actor.key();
        let stats = actor.stats();
        let values = actor.latest_values();

        let impact_scores = self
            .rule
            .impact_scores
            .iter()
            .map(|p| ImpactScore {
                field_id: p.field_id.clone(),
                name: p.name.clone(),
                external_id: self
                    .impact_ids
                    .iter()
                    .find(|(field_id, _)| *field_id == p.field_id)
                    .map(|(_, id)| id.clone())
                    .unwrap_or_default(),
                value: actor
                    .buffer(&p.field_id)
                    .and_then(|b| b.last())
                    .and_then(TimedValue::as_f64)
                    .unwrap_or(0.0),
                unit: Some(p.unit.clone().unwrap_or_default()),
            })
            .collect();

        let status = if stats.is_faulty {
            InsightStatus::Open
        } else if stats.faulted_count > 0 {
            InsightStatus::Resolved
        } else {
            InsightStatus::New
        };

        Insight {
            id: Insight::instance_id(&key.equipment_id, &key.rule_id),
            rule_id: key.rule_id.clone(),
            equipment_id: key.equipment_id.clone(),
            status,
            is_faulty: stats.is_faulty,
            is_valid: matches!(actor.state(), OutputState::Valid),
            command_enabled: self.rule.command_enabled,
            faulted_count: stats.faulted_count,
            occurrence_count: stats.occurrence_count,
            impact_scores,
            text: self.interpolator.render(&self.rule.description, &values),
            recommendations: self.interpolator.render(&self.rule.recommendations, &values),
            earliest_faulted_date: stats.first_faulted,
            last_faulted_date: stats.last_faulted,
            last_updated: timestamp,
            last_sync_date_utc: self.clock.now(),
            version: self.version,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::actor::{BoundParameter, InstanceKey};
    use crate::clock::ManualClock;
    use crate::config::OutputConfig;
    use chrono::TimeZone;
    use twinrule_calc::{parse, EvalPolicy, Expr};
    use twinrule_model::{RetentionPolicy, RuleParameter};

    fn t(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    fn bound(parameter: RuleParameter) -> BoundParameter {
        let expr = parse(&parameter.formula).unwrap().transform(&mut |e| match e {
            Expr::Reference(r) => Some(Expr::Point(r.text().to_string())),
            _ => None,
        });
        BoundParameter {
            points: expr.points().into_iter().collect(),
            fields: expr.variables().into_iter().collect(),
            expr: Some(expr),
            disabled: None,
            impact: false,
            parameter,
        }
    }

    fn setup(mode: RunMode, rule: Rule) -> (RuleInstanceActor, InsightTracker, Arc<ManualClock>) {
        let rule = Arc::new(rule);
        let key = InstanceKey::new("ahu-1", rule.id.clone());
        let mut params: Vec<BoundParameter> = rule.all_parameters().cloned().map(bound).collect();
        for p in &mut params {
            p.impact = rule.is_impact_score(p.field_id());
        }
        let outputs = RuleOutputs::new(&key, &rule, 1, &params, &OutputConfig::default());
        let mut actor = RuleInstanceActor::new(key, rule.clone(), 1, RetentionPolicy::unbounded(), EvalPolicy::default());
        actor.bind(params, None);
        let clock = Arc::new(ManualClock::new(t(1000)));
        let tracker = InsightTracker::new(
            rule,
            1,
            mode,
            InsightConfig::default(),
            clock.clone(),
            Interpolator::new().unwrap(),
            &outputs,
        );
        (actor, tracker, clock)
    }

    fn feed(actor: &mut RuleInstanceActor, tracker: &mut InsightTracker, hour: i64, sat: f64) -> Option<Insight> {
        actor.apply(t(hour), &[(Arc::from("sat"), TimedValue::new(t(hour), sat))]);
        tracker.observe(actor, t(hour))
    }

    fn healthy_rule() -> Rule {
        let mut rule = Rule::new("sat-high", "dtmi:ahu;1");
        rule.parameters.push(RuleParameter::new("result", "[sat] > 30"));
        rule
    }

    #[test]
    fn test_interpolation_formats_values() {
        let interpolator = Interpolator::new().unwrap();
        let mut values = FxHashMap::default();
        values.insert("my_value1".to_string(), Value::Number(3.0));
        values.insert(
            "date2".to_string(),
            Value::Timestamp(Utc.with_ymd_and_hms(2023, 4, 19, 19, 30, 15).unwrap()),
        );
        values.insert("text1".to_string(), Value::Text("xyz".into()));

        assert_eq!(
            interpolator.render("My Value is {my_value1}. My date is {date2}. My text is {text1}", &values),
            "My Value is 3.00. My date is 2023-04-19T19:30:15. My text is xyz"
        );
        assert_eq!(interpolator.render("{unknown} stays", &values), "{unknown} stays");
    }

    #[test]
    fn test_batch_forces_periodic_sync_when_healthy() {
        let (mut actor, mut tracker, _) = setup(RunMode::Batch, healthy_rule());

        assert!(feed(&mut actor, &mut tracker, 0, 20.0).is_some());
        // ratio of time since sync to time since first occurrence exceeds 0.25
        assert!(feed(&mut actor, &mut tracker, 1, 20.0).is_some());
        let synced: usize = (2..40)
            .filter(|h| feed(&mut actor, &mut tracker, *h, 20.0).is_some())
            .count();
        assert!(synced > 0);
        assert!(synced < 38);
    }

    #[test]
    fn test_realtime_only_syncs_first_and_faults() {
        let (mut actor, mut tracker, _) = setup(RunMode::Realtime, healthy_rule());

        assert!(feed(&mut actor, &mut tracker, 0, 20.0).is_some());
        assert!(feed(&mut actor, &mut tracker, 12, 20.0).is_none());
        let faulted = feed(&mut actor, &mut tracker, 13, 35.0).unwrap();
        assert!(faulted.is_faulty);
        assert_eq!(faulted.status, InsightStatus::Open);
        assert!(tracker.finish(&actor).is_none());
    }

    #[test]
    fn test_command_disabled_never_syncs() {
        let mut rule = healthy_rule();
        rule.command_enabled = false;
        let (mut actor, mut tracker, _) = setup(RunMode::Batch, rule);
        assert!(feed(&mut actor, &mut tracker, 0, 35.0).is_none());
        assert!(tracker.finish(&actor).is_none());
    }

    #[test]
    fn test_sync_date_comes_from_clock() {
        let (mut actor, mut tracker, clock) = setup(RunMode::Batch, healthy_rule());
        let first = feed(&mut actor, &mut tracker, 0, 35.0).unwrap();
        clock.advance(Duration::minutes(5));
        let second = feed(&mut actor, &mut tracker, 1, 35.0).unwrap();

        assert_eq!(first.last_updated, t(0));
        assert_eq!(first.last_sync_date_utc, t(1000));
        assert_eq!(second.last_sync_date_utc, t(1000) + Duration::minutes(5));
        assert_eq!(second.faulted_count, 2);
    }

    #[test]
    fn test_impact_scores_listed_with_units() {
        let mut rule = healthy_rule();
        rule.impact_scores.push(RuleParameter::new("cost_impact", "[sat] * 2").with_unit("USD"));
        rule.impact_scores.push(RuleParameter::new("comfort_impact", "cost_impact + 2"));
        let (mut actor, mut tracker, _) = setup(RunMode::Batch, rule);

        let insight = feed(&mut actor, &mut tracker, 0, 35.0).unwrap();
        let cost = insight.impact_score("cost_impact").unwrap();
        assert_eq!(cost.value, 70.0);
        assert_eq!(cost.unit.as_deref(), Some("USD"));
        assert_eq!(cost.external_id, "ahu-1_sat-high_cost_impact_V1");
        let comfort = insight.impact_score("comfort_impact").unwrap();
        assert_eq!(comfort.value, 72.0);
        assert_eq!(comfort.unit.as_deref(), Some(""));
    }
}

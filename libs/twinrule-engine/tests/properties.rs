//! End-to-end behaviour of the engine over a small twin graph
//!
//! Every test drives a full generation (lanes, actors, dispatcher) through
//! `Engine::run_batch` or `Engine::run_realtime` and inspects the in-memory
//! sinks and the returned snapshots.

// Allow unwrap() in tests for cleaner test code
#![allow(clippy::disallowed_methods)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use twinrule_engine::{
    ActorPhase, Clock, Engine, EngineConfig, EngineError, ManualClock, MemoryInsightStore, MemoryOutputSink,
    OutputValue, RuleSet, RunSummary, Sinks, TelemetryRecord,
};
use twinrule_graph::{GraphError, RelationshipRecord, StaticTwinSource, TwinNode, TwinSnapshot, TwinSource};
use twinrule_model::{CalculatedPoint, CumulativeSetting, InsightStatus, Rule, RuleParameter, RuleUIElement, UIElementKind};

const AHU: &str = "dtmi:com:willowinc:AirHandlingUnit;1";
const SAT: &str = "dtmi:com:willowinc:SupplyAirTemperatureSensor;1";
const ZONE: &str = "dtmi:com:willowinc:Zone;1";
const ZONE_TEMP: &str = "dtmi:com:willowinc:ZoneAirTemperatureSensor;1";
const ZONE_SP: &str = "dtmi:com:willowinc:ZoneAirTemperatureSetpoint;1";
const SENSOR: &str = "dtmi:com:willowinc:Sensor;1";

fn snapshot() -> TwinSnapshot {
    TwinSnapshot {
        twins: vec![
            TwinNode::new("ahu-1", AHU),
            TwinNode::new("sat-1", SAT).with_external_id("AHU1_SAT"),
            TwinNode::new("zone-1", ZONE),
            TwinNode::new("zt-1", ZONE_TEMP).with_external_id("ZONE1_T"),
            TwinNode::new("zsp-1", ZONE_SP).with_external_id("ZONE1_SP"),
            TwinNode::new("s-b", SENSOR).with_external_id("S_B"),
            TwinNode::new("s-c", SENSOR).with_external_id("S_C"),
            TwinNode::new("s-d", SENSOR).with_external_id("S_D"),
        ],
        relationships: vec![
            RelationshipRecord::new("sat-1", "isCapabilityOf", "ahu-1"),
            RelationshipRecord::new("zt-1", "isCapabilityOf", "zone-1"),
            RelationshipRecord::new("zsp-1", "isCapabilityOf", "zone-1"),
        ],
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
}

fn at(minutes: i64) -> DateTime<Utc> {
    start() + Duration::minutes(minutes)
}

fn engine(rules: Vec<Rule>, calculated: Vec<CalculatedPoint>) -> Engine {
    engine_with(EngineConfig::default(), rules, calculated)
}

fn engine_with(config: EngineConfig, rules: Vec<Rule>, calculated: Vec<CalculatedPoint>) -> Engine {
    let source = Arc::new(StaticTwinSource::new(snapshot()));
    Engine::new(config, RuleSet::new(rules, calculated), source).unwrap()
}

struct Captured {
    outputs: Arc<MemoryOutputSink>,
    insights: Arc<MemoryInsightStore>,
}

impl Captured {
    fn new() -> Self {
        Self {
            outputs: Arc::new(MemoryOutputSink::new()),
            insights: Arc::new(MemoryInsightStore::new()),
        }
    }

    fn sinks(&self) -> Sinks {
        Sinks {
            outputs: self.outputs.clone(),
            insights: self.insights.clone(),
        }
    }
}

async fn batch(engine: &Engine, records: Vec<TelemetryRecord>) -> (RunSummary, Captured) {
    let captured = Captured::new();
    let summary = engine
        .run_batch(records, captured.sinks(), &CancellationToken::new())
        .await
        .unwrap();
    (summary, captured)
}

// ============================================================================
// Buffers and cumulative evaluation
// ============================================================================

fn accumulate_rule() -> Rule {
    let mut rule = Rule::new("zone-sum", ZONE);
    rule.parameters.push(RuleParameter::new("zone_temp", format!("[{}]", ZONE_TEMP)));
    rule.parameters.push(RuleParameter::new("zone_temp_sp", format!("[{}]", ZONE_SP)));
    rule.parameters.push(
        RuleParameter::new("result", "zone_temp + zone_temp_sp").with_cumulative(CumulativeSetting::Accumulate),
    );
    rule
}

#[tokio::test]
async fn test_accumulate_running_totals() {
    let engine = engine(vec![accumulate_rule()], vec![]);
    let mut records = Vec::new();
    for i in 0..6 {
        records.push(TelemetryRecord::new("ZONE1_T", at(i * 5), 3.0 + i as f64));
        records.push(TelemetryRecord::new("ZONE1_SP", at(i * 5), 4.0 + i as f64));
    }

    let (summary, _) = batch(&engine, records).await;
    let instance = summary.instance("zone-1", "zone-sum").unwrap();
    assert_eq!(instance.values("result"), vec![7.0, 16.0, 27.0, 40.0, 55.0, 72.0]);
    assert_eq!(instance.stats.trigger_count, 6);
}

#[tokio::test]
async fn test_buffers_drop_late_and_duplicate_timestamps() {
    let engine = engine(vec![accumulate_rule()], vec![]);
    let records = vec![
        TelemetryRecord::new("ZONE1_T", at(10), 20.0),
        TelemetryRecord::new("ZONE1_SP", at(10), 21.0),
        TelemetryRecord::new("ZONE1_T", at(10), 99.0),
        TelemetryRecord::new("ZONE1_T", at(20), 22.0),
    ];

    let (summary, _) = batch(&engine, records).await;
    assert_eq!(summary.dropped, 1);
    let instance = summary.instance("zone-1", "zone-sum").unwrap();
    let zone_temp = &instance.parameter("zone_temp").unwrap().buffer;
    assert!(zone_temp.is_in_order());
    assert_eq!(instance.values("zone_temp"), vec![20.0, 22.0]);
}

// ============================================================================
// Cross-lane routing
// ============================================================================

/// A calculated point over the supply sensor feeds a rule that also reads the
/// raw sensor and three unrelated ones
fn race_rules() -> (Vec<Rule>, Vec<CalculatedPoint>) {
    let mut point = CalculatedPoint::new("AHU1_SAT_F", format!("[{}] * 1.8 + 32", SAT));
    point.context_twin_id = Some("ahu-1".into());

    let mut rule = Rule::new("race", AHU);
    rule.parameters.push(RuleParameter::new("sat_f", "[AHU1_SAT_F]"));
    rule.parameters.push(RuleParameter::new("sat", format!("[{}]", SAT)));
    rule.parameters.push(RuleParameter::new("b", "[S_B]"));
    rule.parameters.push(RuleParameter::new("c", "[S_C]"));
    rule.parameters.push(RuleParameter::new("d", "[S_D]"));
    rule.parameters.push(RuleParameter::new("total", "sat_f + b + c + d"));
    rule.parameters.push(RuleParameter::new("result", "total > 150"));
    (vec![rule], vec![point])
}

const RACE_STEPS: i64 = 50;

fn race_series(point: &str) -> Vec<TelemetryRecord> {
    (0..RACE_STEPS)
        .map(|i| {
            let value = match point {
                "AHU1_SAT" => 20.0 + (i % 5) as f64,
                "S_B" => i as f64,
                "S_C" => 2.0 * i as f64,
                _ => 3.0 * i as f64,
            };
            TelemetryRecord::new(point, at(i), value)
        })
        .collect()
}

const RACE_POINTS: [&str; 4] = ["AHU1_SAT", "S_B", "S_C", "S_D"];

fn assert_race_invariants(summary: &RunSummary) {
    let instance = summary.instance("ahu-1", "race").unwrap();
    for parameter in &instance.parameters {
        assert!(parameter.buffer.is_in_order(), "{} out of order", parameter.field_id);
        assert!(parameter.buffer.iter().all(|v| v.timestamp >= start()));
    }
    let total = instance.values("total");
    assert_eq!(total.len(), RACE_STEPS as usize);
    // sat 24 at the last step: 24 * 1.8 + 32 + 49 + 98 + 147
    assert!((total[total.len() - 1] - 369.2).abs() < 1e-9);
    assert_eq!(instance.stats.trigger_count, RACE_STEPS as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_result_independent_of_interleaving() {
    let (rules, points) = race_rules();
    let mut baseline: Option<Vec<f64>> = None;

    for seed in 0..5u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut records: Vec<TelemetryRecord> = RACE_POINTS.iter().flat_map(|p| race_series(p)).collect();
        records.shuffle(&mut rng);

        let engine = engine(rules.clone(), points.clone());
        let (summary, _) = batch(&engine, records).await;
        assert_race_invariants(&summary);

        let total = summary.instance("ahu-1", "race").unwrap().values("total");
        match &baseline {
            Some(expected) => assert_eq!(&total, expected, "seed {}", seed),
            None => baseline = Some(total),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_feeds_do_not_corrupt_rule_buffers() {
    let (rules, points) = race_rules();
    let mut config = EngineConfig::default();
    config.scheduler.tick_ms = 3_600_000;
    let engine = engine_with(config, rules.clone(), points.clone());

    let captured = Captured::new();
    let (tx, rx) = mpsc::channel(8);
    let producers: Vec<_> = RACE_POINTS
        .iter()
        .enumerate()
        .map(|(i, point)| {
            let tx = tx.clone();
            let series = race_series(point);
            tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(i as u64);
                for record in series {
                    if rng.gen_bool(0.5) {
                        tokio::task::yield_now().await;
                    }
                    tx.send(record).await.unwrap();
                }
            })
        })
        .collect();
    drop(tx);

    let cancel = CancellationToken::new();
    let (summary, _) = tokio::join!(engine.run_realtime(rx, captured.sinks(), &cancel), async {
        for producer in producers {
            producer.await.unwrap();
        }
    });
    let summary = summary.unwrap();

    assert_eq!(summary.records, 4 * RACE_STEPS as u64);
    assert_eq!(summary.dropped, 0);
    assert_race_invariants(&summary);

    let (expected, _) = batch(
        &engine_with(EngineConfig::default(), rules, points),
        RACE_POINTS.iter().flat_map(|p| race_series(p)).collect(),
    )
    .await;
    assert_eq!(
        summary.instance("ahu-1", "race").unwrap().values("total"),
        expected.instance("ahu-1", "race").unwrap().values("total")
    );
}

#[tokio::test]
async fn test_calculated_point_recomputes_only_from_its_sensor() {
    let (rules, points) = race_rules();
    let engine = engine(rules, points);
    let mut records = race_series("AHU1_SAT");
    records.truncate(3);
    // the rule reads these, the calculated point must not
    records.extend(race_series("S_B").into_iter().take(10));

    let (summary, _) = batch(&engine, records).await;
    let calculated = summary.calculated("AHU1_SAT_F").unwrap();
    assert_eq!(calculated.buffer.len(), 3);
    assert_eq!(calculated.phase, ActorPhase::Idle);
}

// ============================================================================
// Outputs
// ============================================================================

fn impact_rule() -> Rule {
    let mut rule = Rule::new("impact", AHU);
    rule.parameters.push(RuleParameter::new("sat", format!("[{}]", SAT)));
    rule.parameters.push(RuleParameter::new("result", "sat > 25"));
    rule.impact_scores.push(RuleParameter::new("cost_impact", "sat * 10").with_unit("USD"));
    rule.impact_scores.push(RuleParameter::new("comfort_impact", "cost_impact + 2"));
    rule
}

#[tokio::test]
async fn test_impact_score_dependency_and_units() {
    let engine = engine(vec![impact_rule()], vec![]);
    let records = (0..8).map(|i| TelemetryRecord::new("AHU1_SAT", at(i * 15), 22.0 + i as f64)).collect();

    let (summary, captured) = batch(&engine, records).await;
    let instance = summary.instance("ahu-1", "impact").unwrap();
    let cost = &instance.parameter("cost_impact").unwrap().buffer;
    let comfort = &instance.parameter("comfort_impact").unwrap().buffer;
    assert_eq!(cost.len(), 8);
    for (c, f) in cost.iter().zip(comfort.iter()) {
        assert_eq!(c.timestamp, f.timestamp);
        assert_eq!(f.as_f64().unwrap(), c.as_f64().unwrap() + 2.0);
    }

    let insight = captured.insights.get("ahu-1", "impact").unwrap();
    assert!(insight.is_faulty);
    assert_eq!(insight.status, InsightStatus::Open);
    let cost = insight.impact_score("cost_impact").unwrap();
    assert_eq!(cost.unit.as_deref(), Some("USD"));
    assert_eq!(cost.value, 290.0);
    assert_eq!(insight.impact_score("comfort_impact").unwrap().value, 292.0);

    let cost_series = captured.outputs.series("ahu-1_impact_cost_impact_V1");
    assert!(!cost_series.is_empty());
    assert!(cost_series.iter().all(|p| p.unit.as_deref() == Some("USD")));
}

#[tokio::test]
async fn test_half_hour_faults_give_one_point_per_hour() {
    let mut rule = Rule::new("pct", AHU);
    rule.parameters.push(RuleParameter::new("sat", format!("[{}]", SAT)));
    rule.parameters.push(RuleParameter::new("result", "sat > 25"));
    rule.elements.push(RuleUIElement::new(UIElementKind::OverHowManyHours, 1.0));
    rule.elements.push(RuleUIElement::new(UIElementKind::PercentageOfTime, 50.0));
    let engine = engine(vec![rule], vec![]);

    // true for the first half of every hour, six hours
    let records = (0..36)
        .map(|i| {
            let minute = i * 10;
            let value = if minute % 60 < 30 { 30.0 } else { 20.0 };
            TelemetryRecord::new("AHU1_SAT", at(minute), value)
        })
        .collect();

    let (_, captured) = batch(&engine, records).await;
    let series = captured.outputs.series("ahu-1_pct_result_V1");
    let hours: Vec<DateTime<Utc>> = series.iter().map(|p| p.timestamp).collect();
    assert_eq!(hours, (0..6).map(|h| at(h * 60)).collect::<Vec<_>>());
    assert!(series.iter().all(|p| p.value == OutputValue::Number(1.0)));

    // the raw sensor only changes twice an hour
    let sat = captured.outputs.series("ahu-1_pct_sat_V1");
    assert_eq!(sat.len(), 12);
}

// ============================================================================
// Windowed aggregates
// ============================================================================

fn windowed_rule() -> Rule {
    let mut rule = Rule::new("windowed", ZONE);
    rule.parameters.push(RuleParameter::new("zone_temp", format!("[{}]", ZONE_TEMP)));
    rule.parameters.push(RuleParameter::new("warm", "ANY(zone_temp > 25, 1h)"));
    rule.parameters.push(RuleParameter::new("fallback", "MAX(1, 1d)"));
    rule.parameters.push(RuleParameter::new("result", "warm"));
    rule
}

#[tokio::test]
async fn test_windows_over_constants_and_expressions() {
    let engine = engine(vec![windowed_rule()], vec![]);
    // one warm reading at minute 30
    let records = (0..=12)
        .map(|i| TelemetryRecord::new("ZONE1_T", at(i * 10), if i == 3 { 27.0 } else { 20.0 }))
        .collect();

    let (summary, _) = batch(&engine, records).await;
    let instance = summary.instance("zone-1", "windowed").unwrap();
    let fallback = instance.values("fallback");
    assert_eq!(fallback.len(), 13);
    assert!(fallback.iter().all(|v| *v != 0.0));
    assert_eq!(
        instance.values("warm"),
        vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0]
    );
    assert!(instance.state.is_valid());
}

#[tokio::test]
async fn test_window_longer_than_count_limit() {
    let mut rule = Rule::new("hourly", ZONE);
    rule.parameters.push(RuleParameter::new("zone_temp", format!("[{}]", ZONE_TEMP)));
    rule.parameters.push(RuleParameter::new("hourly", "AVERAGE(zone_temp, 1h)"));
    rule.parameters.push(RuleParameter::new("result", "hourly > 100"));
    let mut config = EngineConfig::default();
    config.retention.max_count = 10;
    let engine = engine_with(config, vec![rule], vec![]);

    let records = (0..200).map(|i| TelemetryRecord::new("ZONE1_T", at(i), i as f64)).collect();
    let (summary, _) = batch(&engine, records).await;
    let instance = summary.instance("zone-1", "hourly").unwrap();
    let hourly = instance.parameter("hourly").unwrap();
    assert!(hourly.state.is_valid());
    assert_eq!(hourly.buffer.len(), 10);
    // mean of 139..=199
    assert_eq!(instance.values("hourly").last(), Some(&169.0));
    assert_eq!(instance.parameter("zone_temp").unwrap().buffer.len(), 61);
}

// ============================================================================
// Versions and insight sync
// ============================================================================

fn healthy_rule() -> Rule {
    let mut rule = Rule::new("healthy", AHU);
    rule.parameters.push(RuleParameter::new("sat", format!("[{}]", SAT)));
    rule.parameters.push(RuleParameter::new("result", "sat > 100"));
    rule.description = "Supply air at {sat}".into();
    rule
}

fn healthy_records() -> Vec<TelemetryRecord> {
    (0..24).map(|i| TelemetryRecord::new("AHU1_SAT", at(i * 30), 18.0 + (i % 3) as f64)).collect()
}

#[tokio::test]
async fn test_batch_reruns_bump_version_and_realtime_keeps_it() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap()));
    let engine = engine(vec![healthy_rule()], vec![]).with_clock(clock.clone());

    let mut synced = Vec::new();
    for version in 1..=3u32 {
        clock.advance(Duration::hours(1));
        let (summary, captured) = batch(&engine, healthy_records()).await;
        assert_eq!(summary.instance("ahu-1", "healthy").unwrap().version, version);
        let series = captured.outputs.series(&format!("ahu-1_healthy_sat_V{}", version));
        assert!(!series.is_empty());

        let insight = captured.insights.get("ahu-1", "healthy").unwrap();
        assert!(!insight.is_faulty);
        assert_eq!(insight.status, InsightStatus::New);
        assert_eq!(insight.version, version);
        assert_eq!(insight.last_sync_date_utc, clock.now());
        // healthy equipment still syncs more than once over half a day
        assert!(captured.insights.upsert_count() > 1);
        synced.push(insight.last_sync_date_utc);
    }
    assert!(synced.windows(2).all(|w| w[0] < w[1]));

    let captured = Captured::new();
    let (tx, rx) = mpsc::channel(64);
    for record in healthy_records() {
        tx.send(record).await.unwrap();
    }
    drop(tx);
    let summary = engine
        .run_realtime(rx, captured.sinks(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.instance("ahu-1", "healthy").unwrap().version, 3);
    assert!(!captured.outputs.is_empty());
    assert!(captured
        .outputs
        .points()
        .iter()
        .all(|p| p.external_id.ends_with("_V3")));
    assert_eq!(engine.versions().current("ahu-1", "healthy"), Some(3));
}

#[tokio::test]
async fn test_description_renders_latest_values() {
    let engine = engine(vec![healthy_rule()], vec![]);
    let (_, captured) = batch(&engine, healthy_records()).await;
    let insight = captured.insights.get("ahu-1", "healthy").unwrap();
    // last record: 18 + 23 % 3
    assert_eq!(insight.text, "Supply air at 20.00");
}

#[tokio::test]
async fn test_disabled_commands_never_sync() {
    let mut rule = impact_rule();
    rule.command_enabled = false;
    let engine = engine(vec![rule], vec![]);
    let records = (0..4).map(|i| TelemetryRecord::new("AHU1_SAT", at(i), 30.0)).collect();

    let (summary, captured) = batch(&engine, records).await;
    assert!(captured.insights.all().is_empty());
    assert!(summary.instance("ahu-1", "impact").unwrap().stats.is_faulty);
    assert!(!captured.outputs.is_empty());
}

// ============================================================================
// Cancellation and generations
// ============================================================================

#[tokio::test]
async fn test_cancelled_batch_publishes_nothing() {
    let engine = engine(vec![healthy_rule()], vec![]);
    let captured = Captured::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = engine
        .run_batch(healthy_records(), captured.sinks(), &cancel)
        .await
        .unwrap();
    assert!(summary.cancelled);
    assert!(captured.outputs.is_empty());
    assert!(captured.insights.all().is_empty());
}

/// Twin directory that can go offline
struct FlakySource {
    snapshot: Mutex<Option<TwinSnapshot>>,
}

impl FlakySource {
    fn new(snapshot: Option<TwinSnapshot>) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    fn set(&self, snapshot: Option<TwinSnapshot>) {
        *self.snapshot.lock() = snapshot;
    }
}

#[async_trait]
impl TwinSource for FlakySource {
    async fn fetch(&self) -> twinrule_graph::Result<TwinSnapshot> {
        self.snapshot
            .lock()
            .clone()
            .ok_or_else(|| GraphError::Source("directory offline".into()))
    }
}

#[tokio::test]
async fn test_failed_fetch_keeps_last_generation() {
    let source = Arc::new(FlakySource::new(Some(snapshot())));
    let engine = Engine::new(
        EngineConfig::default(),
        RuleSet::new(vec![healthy_rule()], vec![]),
        source.clone(),
    )
    .unwrap();

    let first = engine.rebind().await.unwrap();
    source.set(None);
    let kept = engine.rebind().await.unwrap();
    assert!(Arc::ptr_eq(&first, &kept));
    assert_eq!(engine.generation(), 1);

    // runs keep working on the last good binding
    let (summary, _) = batch(&engine, healthy_records()).await;
    assert!(summary.instance("ahu-1", "healthy").is_some());
}

#[tokio::test]
async fn test_set_rules_rebinds_and_rejects_invalid_sets() {
    let engine = engine(vec![healthy_rule()], vec![]);
    engine.rebind().await.unwrap();

    let topology = engine
        .set_rules(RuleSet::new(vec![healthy_rule(), windowed_rule()], vec![]))
        .await
        .unwrap();
    assert_eq!(engine.generation(), 2);
    assert!(topology.instance("zone-1", "windowed").is_some());

    let duplicate = RuleSet::new(vec![healthy_rule(), healthy_rule()], vec![]);
    assert!(matches!(engine.set_rules(duplicate).await, Err(EngineError::Config(_))));
    assert_eq!(engine.generation(), 2);

    let (summary, _) = batch(&engine, healthy_records()).await;
    assert!(summary.instance("ahu-1", "healthy").is_some());
    assert!(summary.instance("zone-1", "windowed").is_some());
}

#[tokio::test]
async fn test_unbound_engine_reports_fetch_failure() {
    let source = Arc::new(FlakySource::new(None));
    let engine = Engine::new(EngineConfig::default(), RuleSet::new(vec![], vec![]), source).unwrap();
    assert!(matches!(engine.rebind().await, Err(EngineError::NotBound(_))));
}

#[tokio::test]
async fn test_rebind_supersedes_running_generation() {
    let engine = engine(vec![healthy_rule()], vec![]);
    let captured = Captured::new();
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(64);
    let records = healthy_records();
    let (early, late) = records.split_at(12);

    let (summary, _) = tokio::join!(engine.run_realtime(rx, captured.sinks(), &cancel), async {
        for record in early {
            tx.send(record.clone()).await.unwrap();
        }
        engine.rebind().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        for record in late {
            tx.send(record.clone()).await.unwrap();
        }
        drop(tx);
    });
    let summary = summary.unwrap();

    assert_eq!(summary.generations, 2);
    assert_eq!(summary.superseded, 1);
    assert_eq!(summary.records, 24);
    assert_eq!(summary.instances.len(), 2);
    assert_eq!(summary.instances[0].phase, ActorPhase::Superseded);
    assert_ne!(summary.instances[1].phase, ActorPhase::Superseded);
    // same binding, so the new generation writes the same version
    assert!(captured.outputs.points().iter().all(|p| p.external_id.ends_with("_V1")));
}

#[tokio::test]
async fn test_cancel_stops_realtime_run() {
    let engine = engine(vec![healthy_rule()], vec![]);
    let captured = Captured::new();
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(64);

    let (summary, _) = tokio::join!(engine.run_realtime(rx, captured.sinks(), &cancel), async {
        tx.send(TelemetryRecord::new("AHU1_SAT", at(0), 18.0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
    });
    let summary = summary.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.generations, 1);
    drop(tx);
}

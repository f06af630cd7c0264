//! Subcommand implementations

use crate::feed;
use crate::Inputs;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{info, warn};
use twinrule_calc::{evaluate, parse, EvalPolicy, SimpleScope, Value};
use twinrule_engine::{
    read_csv_file, CsvOutputSink, Engine, EngineConfig, JsonInsightStore, RuleSet, RunSummary, Sinks,
    ValidationReport,
};
use twinrule_graph::FileTwinSource;
use twinrule_model::PointValue;

const OUT_DIR_ENV: &str = "TWINRULE_OUT_DIR";

async fn build_engine(config: Option<&Path>, inputs: &Inputs) -> Result<Engine> {
    let config = EngineConfig::load(config).context("loading engine configuration")?;
    let rules = RuleSet::load(&inputs.rules)
        .await
        .with_context(|| format!("loading rules from {}", inputs.rules.display()))?;
    let source = Arc::new(FileTwinSource::new(&inputs.twins));
    Ok(Engine::new(config, rules, source)?)
}

struct FileSinks {
    outputs: Arc<CsvOutputSink>,
    insights: Arc<JsonInsightStore>,
}

impl FileSinks {
    fn create(out_dir: Option<String>) -> Result<Self> {
        let dir = PathBuf::from(common::get_string_config(out_dir, OUT_DIR_ENV, "out"));
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self {
            outputs: Arc::new(CsvOutputSink::create(dir.join("outputs.csv"))?),
            insights: Arc::new(JsonInsightStore::new(dir.join("insights.json"))),
        })
    }

    fn sinks(&self) -> Sinks {
        Sinks {
            outputs: self.outputs.clone(),
            insights: self.insights.clone(),
        }
    }
}

// ============================================================================
// validate
// ============================================================================

pub async fn validate(config: Option<&Path>, inputs: &Inputs, json: bool) -> Result<()> {
    let engine = build_engine(config, inputs).await?;
    let report = engine.validate().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &ValidationReport) {
    println!(
        "{} {} rule instances, {} calculated points, {} telemetry lanes",
        "Bound".bright_cyan(),
        report.instances.len(),
        report.calculated.len(),
        report.lanes
    );

    for point in &report.calculated {
        match &point.disabled {
            None => println!("  {} {}", "OK".green(), point.point_id),
            Some(reason) => println!("  {} {}: {}", "FAIL".red(), point.point_id, reason),
        }
    }
    for instance in &report.instances {
        if instance.disabled.is_empty() {
            println!(
                "  {} {}_{} ({} parameters)",
                "OK".green(),
                instance.equipment_id,
                instance.rule_id,
                instance.parameters
            );
            continue;
        }
        println!(
            "  {} {}_{} ({} of {} parameters disabled)",
            "WARNING".yellow(),
            instance.equipment_id,
            instance.rule_id,
            instance.disabled.len(),
            instance.parameters
        );
        for (field_id, reason) in &instance.disabled {
            println!("     {} {}", field_id.yellow(), reason);
        }
    }
    for rule_id in &report.unmatched_rules {
        println!("  {} {} matches no twin", "WARNING".yellow(), rule_id);
    }

    let disabled = report.disabled_count();
    if disabled == 0 {
        println!("{} Valid", "OK".green());
    } else {
        println!("{} {} disabled", "WARNING".yellow(), disabled);
    }
}

// ============================================================================
// replay / watch
// ============================================================================

pub async fn replay(
    config: Option<&Path>,
    inputs: &Inputs,
    telemetry: &Path,
    out_dir: Option<String>,
    reruns: u32,
) -> Result<()> {
    let engine = build_engine(config, inputs).await?;
    let batch = read_csv_file(telemetry)
        .await
        .with_context(|| format!("reading telemetry from {}", telemetry.display()))?;
    if batch.skipped > 0 {
        warn!("{} malformed telemetry rows skipped", batch.skipped);
    }

    let sinks = FileSinks::create(out_dir)?;
    let cancel = common::cancel_on_shutdown();
    for run in 1..=reruns.max(1) {
        let summary = engine.run_batch(batch.records.clone(), sinks.sinks(), &cancel).await?;
        print_summary(&format!("Run {}", run), &summary);
        if summary.cancelled {
            break;
        }
    }

    println!(
        "{} {} and {}",
        "Wrote".bright_cyan(),
        sinks.outputs.path().display(),
        sinks.insights.path().display()
    );
    Ok(())
}

pub async fn watch(config: Option<&Path>, inputs: &Inputs, out_dir: Option<String>) -> Result<()> {
    let engine = build_engine(config, inputs).await?;
    let lane_capacity = engine.config().scheduler.lane_capacity;
    let sinks = FileSinks::create(out_dir)?;
    let cancel = common::cancel_on_shutdown();

    let (tx, rx) = mpsc::channel(lane_capacity.max(1));
    let reader = tokio::spawn(feed::forward(BufReader::new(tokio::io::stdin()), tx));
    info!("Reading telemetry from stdin");

    let summary = engine.run_realtime(rx, sinks.sinks(), &cancel).await?;
    cancel.cancel();
    if reader.is_finished() {
        match reader.await {
            Ok(Ok(skipped)) if skipped > 0 => warn!("{} malformed input rows skipped", skipped),
            Ok(Err(e)) => warn!("Reading stdin failed: {}", e),
            _ => {},
        }
    } else {
        reader.abort();
    }

    print_summary("Realtime", &summary);
    Ok(())
}

fn print_summary(label: &str, summary: &RunSummary) {
    let status = if summary.cancelled {
        "CANCELLED".yellow()
    } else if summary.sink_errors > 0 {
        "FAIL".red()
    } else {
        "OK".green()
    };
    println!(
        "{} {}: {} records ({} unrouted, {} late), {} outputs, {} insights",
        status,
        label,
        summary.records,
        summary.unrouted,
        summary.dropped,
        summary.outputs,
        summary.insights
    );
    if summary.superseded > 0 {
        println!("   {} generations, {} superseded", summary.generations, summary.superseded);
    }

    let mut faulted: Vec<_> = summary
        .instances
        .iter()
        .filter(|i| i.stats.is_faulty)
        .map(|i| format!("{}_{}", i.equipment_id, i.rule_id))
        .collect();
    faulted.dedup();
    for id in faulted {
        println!("   {} {}", "FAULT".red(), id);
    }
}

// ============================================================================
// eval
// ============================================================================

fn parse_var(binding: &str) -> Result<(String, Value)> {
    let Some((name, raw)) = binding.split_once('=') else {
        bail!("expected NAME=VALUE, got '{}'", binding);
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("empty variable name in '{}'", binding);
    }
    Ok((name.to_string(), Value::from(&PointValue::parse_raw(raw))))
}

pub fn eval(formula: &str, vars: &[String], at: Option<&str>) -> Result<()> {
    let now = match at {
        Some(at) => DateTime::parse_from_rfc3339(at)
            .with_context(|| format!("bad --at timestamp '{}'", at))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let expr = parse(formula).with_context(|| format!("parsing '{}'", formula))?;
    let mut scope = SimpleScope::new(now);
    for binding in vars {
        let (name, value) = parse_var(binding)?;
        scope = scope.with_field(name, value);
    }

    let value = evaluate(&expr, &scope, &EvalPolicy::default())?;
    println!("{} = {} ({})", expr, value.render(), value.type_name());
    Ok(())
}

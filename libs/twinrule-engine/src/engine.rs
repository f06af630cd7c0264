//! Rule Engine
//!
//! Owns the long-lived pieces (rule set, twin source, relation registry,
//! version counters, clock) and runs generations of actors over them.
//!
//! - `run_batch`: replay a sorted telemetry batch; every instance moves to a
//!   new output version first
//! - `run_realtime`: follow a live feed; a rebind supersedes the running
//!   generation, which flushes and hands over to a fresh one

use crate::actor::{CalculatedPointActor, CalculatedSnapshot, InstanceSnapshot, RuleInstanceActor};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::generation::{Topology, ValidationReport};
use crate::insight::{InsightTracker, Interpolator, RunMode};
use crate::loader::RuleSet;
use crate::output::RuleOutputs;
use crate::scheduler::{ActorSet, FollowEnd, GenerationOutcome, InstanceParts, RunningGeneration, Sinks};
use crate::telemetry::{sort_records, TelemetryRecord};
use crate::version::VersionRegistry;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use twinrule_graph::{RelationRegistry, TwinGraph, TwinSource};

/// What a run did
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: RunMode,
    pub records: u64,
    /// Records for points no actor reads
    pub unrouted: u64,
    pub accepted: u64,
    /// Late or duplicate-timestamp records
    pub dropped: u64,
    pub outputs: u64,
    pub insights: u64,
    pub sink_errors: u64,
    pub generations: u32,
    pub superseded: u32,
    pub cancelled: bool,
    pub instances: Vec<InstanceSnapshot>,
    pub calculated: Vec<CalculatedSnapshot>,
}

impl RunSummary {
    fn new(mode: RunMode) -> Self {
        Self {
            mode,
            records: 0,
            unrouted: 0,
            accepted: 0,
            dropped: 0,
            outputs: 0,
            insights: 0,
            sink_errors: 0,
            generations: 0,
            superseded: 0,
            cancelled: false,
            instances: Vec::new(),
            calculated: Vec::new(),
        }
    }

    fn absorb(&mut self, outcome: GenerationOutcome) {
        self.generations += 1;
        self.records += outcome.records;
        self.unrouted += outcome.unrouted;
        self.accepted += outcome.lanes.accepted;
        self.dropped += outcome.lanes.dropped;
        self.outputs += outcome.dispatch.outputs;
        self.insights += outcome.dispatch.insights;
        self.sink_errors += outcome.dispatch.errors;
        self.instances.extend(outcome.instances);
        self.calculated.extend(outcome.calculated);
    }

    /// Latest snapshot of an instance
    pub fn instance(&self, equipment_id: &str, rule_id: &str) -> Option<&InstanceSnapshot> {
        self.instances
            .iter()
            .rev()
            .find(|i| i.equipment_id == equipment_id && i.rule_id == rule_id)
    }

    pub fn calculated(&self, point_id: &str) -> Option<&CalculatedSnapshot> {
        self.calculated.iter().rev().find(|c| c.point_id == point_id)
    }
}

pub struct Engine {
    config: EngineConfig,
    rules: RwLock<Arc<RuleSet>>,
    source: Arc<dyn TwinSource>,
    registry: Arc<RelationRegistry>,
    versions: Arc<VersionRegistry>,
    clock: Arc<dyn Clock>,
    interpolator: Interpolator,
    /// Last good generation
    topology: RwLock<Option<Arc<Topology>>>,
    generation: watch::Sender<u64>,
}

impl Engine {
    pub fn new(config: EngineConfig, rules: RuleSet, source: Arc<dyn TwinSource>) -> Result<Self> {
        rules.validate()?;
        let (generation, _) = watch::channel(0);
        Ok(Self {
            config,
            rules: RwLock::new(Arc::new(rules)),
            source,
            registry: Arc::new(RelationRegistry::new()),
            versions: Arc::new(VersionRegistry::new()),
            clock: Arc::new(SystemClock),
            interpolator: Interpolator::new()?,
            topology: RwLock::new(None),
            generation,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn versions(&self) -> &VersionRegistry {
        &self.versions
    }

    pub fn relations(&self) -> &RelationRegistry {
        &self.registry
    }

    pub fn topology(&self) -> Option<Arc<Topology>> {
        self.topology.read().clone()
    }

    /// Number of generations bound so far
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Fetch the twin graph and build a new generation
    ///
    /// If the fetch fails the last good generation stays in place.
    pub async fn rebind(&self) -> Result<Arc<Topology>> {
        let graph = self
            .source
            .fetch()
            .await
            .and_then(|snapshot| TwinGraph::build(snapshot, &self.registry));
        let graph = match graph {
            Ok(graph) => graph,
            Err(e) => {
                warn!("Twin graph unavailable, keeping last generation: {}", e);
                return self.topology().ok_or_else(|| EngineError::NotBound(e.to_string()));
            },
        };

        let rules = self.rules.read().clone();
        let topology = Arc::new(Topology::build(&rules, &graph, &self.registry, &self.config.binder)?);
        *self.topology.write() = Some(topology.clone());
        self.generation.send_modify(|g| *g += 1);
        info!(
            "Generation {} bound over {} twins and {} relationships",
            self.generation(),
            graph.len(),
            graph.edge_count()
        );
        Ok(topology)
    }

    /// Replace the rule set and rebind
    pub async fn set_rules(&self, rules: RuleSet) -> Result<Arc<Topology>> {
        rules.validate()?;
        *self.rules.write() = Arc::new(rules);
        self.rebind().await
    }

    async fn bound(&self) -> Result<Arc<Topology>> {
        match self.topology() {
            Some(topology) => Ok(topology),
            None => self.rebind().await,
        }
    }

    pub async fn validate(&self) -> Result<ValidationReport> {
        Ok(self.bound().await?.report())
    }

    fn instantiate(&self, topology: &Topology, mode: RunMode) -> ActorSet {
        let retention = self.config.retention.policy();
        let policy = self.config.aggregate;

        let calculated = topology
            .calculated
            .iter()
            .map(|spec| {
                let mut actor = CalculatedPointActor::new(spec.point.clone(), retention, policy);
                actor.bind(spec.expr.clone(), spec.this.clone());
                actor
            })
            .collect();

        let instances = topology
            .instances
            .iter()
            .map(|spec| {
                let (equipment_id, rule_id) = (&spec.key.equipment_id, &spec.key.rule_id);
                let version = match mode {
                    RunMode::Batch => self.versions.bump(equipment_id, rule_id, spec.fingerprint),
                    RunMode::Realtime => self.versions.realtime(equipment_id, rule_id, spec.fingerprint),
                };
                let mut actor =
                    RuleInstanceActor::new(spec.key.clone(), spec.rule.clone(), version, retention, policy);
                actor.bind(spec.parameters.clone(), spec.this.clone());
                let outputs = RuleOutputs::new(&spec.key, &spec.rule, version, &spec.parameters, &self.config.output);
                let tracker = InsightTracker::new(
                    spec.rule.clone(),
                    version,
                    mode,
                    self.config.insight.clone(),
                    self.clock.clone(),
                    self.interpolator.clone(),
                    &outputs,
                );
                InstanceParts {
                    actor,
                    outputs,
                    tracker,
                }
            })
            .collect();

        ActorSet {
            calculated,
            instances,
        }
    }

    /// Re-run every instance over a batch of records
    pub async fn run_batch(
        &self,
        mut records: Vec<TelemetryRecord>,
        sinks: Sinks,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let topology = self.bound().await?;
        sort_records(&mut records);
        info!("Batch run over {} records", records.len());

        let actors = self.instantiate(&topology, RunMode::Batch);
        let mut running = RunningGeneration::spawn(&topology, actors, &self.config.scheduler, sinks, cancel);
        let replayed = running
            .replay(records, self.config.scheduler.progress_interval)
            .await;
        let outcome = running.finish().await?;
        replayed?;

        let mut summary = RunSummary::new(RunMode::Batch);
        summary.absorb(outcome);
        summary.cancelled = cancel.is_cancelled();
        info!(
            "Batch run done: {} records, {} outputs, {} insights{}",
            summary.records,
            summary.outputs,
            summary.insights,
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        Ok(summary)
    }

    /// Follow `rx` until it closes or `cancel` fires
    pub async fn run_realtime(
        &self,
        mut rx: mpsc::Receiver<TelemetryRecord>,
        sinks: Sinks,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let mut generations = self.generation.subscribe();
        let mut summary = RunSummary::new(RunMode::Realtime);

        loop {
            let topology = self.bound().await?;
            generations.borrow_and_update();

            let actors = self.instantiate(&topology, RunMode::Realtime);
            let mut running =
                RunningGeneration::spawn(&topology, actors, &self.config.scheduler, sinks.clone(), cancel);
            let end = running
                .follow(&mut rx, &mut generations, &self.config.scheduler)
                .await;
            let outcome = running.finish().await?;
            summary.absorb(outcome);

            match end? {
                FollowEnd::Superseded => summary.superseded += 1,
                FollowEnd::Eof | FollowEnd::Cancelled => break,
            }
        }

        summary.cancelled = cancel.is_cancelled();
        info!(
            "Realtime run done: {} records over {} generations",
            summary.records, summary.generations
        );
        Ok(summary)
    }
}

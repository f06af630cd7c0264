//! Ownership-Routed Scheduler
//!
//! One task per telemetry lane, one task per actor, one dispatcher:
//!
//! ```text
//!   records ─► lane[AHU1_SAT] ──Value/Progress/Closed──► calc[AHU1_DT] ──► rule[ahu-1_dt-low]
//!          └─► lane[AHU1_RAT] ─────────────────────────┘                └─► rule[ahu-2_dt-low]
//!                                                                                │
//!                                                           Dispatch ◄───────────┘
//!                                                              │
//!                                                   OutputSink / InsightStore
//! ```
//!
//! - an actor's state is owned by its task; the only way in is its mailbox
//! - every value carries the lanes it originated from; an actor rejects a
//!   value from a lane outside its permitted set
//! - lanes forward watermark ticks as progress so actors release values in
//!   timestamp order regardless of interleaving
//! - dropping the lane senders closes every edge, which flushes each actor
//! - cancellation abandons pending work; nothing is flushed

use crate::actor::{CalculatedPointActor, CalculatedSnapshot, InstanceSnapshot, RuleInstanceActor};
use crate::config::SchedulerConfig;
use crate::error::{EngineError, Result};
use crate::generation::{ActorRef, LaneId, Topology};
use crate::insight::InsightTracker;
use crate::output::{OutputPoint, RuleOutputs};
use crate::sink::{InsightStore, OutputSink};
use crate::telemetry::TelemetryRecord;
use crate::watermark::Inbox;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use twinrule_model::{Insight, TimedValue};

// ============================================================================
// Messages
// ============================================================================

/// Lane a value descends from
///
/// Only lanes mint origins; actors can merely copy the ones they received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Origin(LaneId);

impl Origin {
    pub fn lane(self) -> LaneId {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn for_test(lane: LaneId) -> Self {
        Origin(lane)
    }
}

#[derive(Debug)]
pub enum ActorMsg {
    Value {
        point_id: Arc<str>,
        origins: Vec<Origin>,
        value: TimedValue,
    },
    /// No more values at or before `watermark` on this edge
    Progress {
        point_id: Arc<str>,
        watermark: DateTime<Utc>,
    },
    Closed {
        point_id: Arc<str>,
    },
}

#[derive(Debug)]
enum LaneMsg {
    Record(TimedValue),
    Tick(DateTime<Utc>),
}

#[derive(Debug)]
pub enum Dispatch {
    Outputs(Vec<OutputPoint>),
    Insight(Box<Insight>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub accepted: u64,
    /// Values not after the lane's newest timestamp or tick
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub outputs: u64,
    pub insights: u64,
    pub errors: u64,
}

/// Sinks for one run
#[derive(Clone)]
pub struct Sinks {
    pub outputs: Arc<dyn OutputSink>,
    pub insights: Arc<dyn InsightStore>,
}

/// A rule instance actor with the state its task owns alongside it
pub struct InstanceParts {
    pub actor: RuleInstanceActor,
    pub outputs: RuleOutputs,
    pub tracker: InsightTracker,
}

/// Actors for one generation, in topology order
pub struct ActorSet {
    pub calculated: Vec<CalculatedPointActor>,
    pub instances: Vec<InstanceParts>,
}

/// Why a realtime follow loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowEnd {
    Eof,
    Superseded,
    Cancelled,
}

/// Final state of one generation
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub records: u64,
    pub unrouted: u64,
    pub lanes: LaneStats,
    pub dispatch: DispatchStats,
    pub calculated: Vec<CalculatedSnapshot>,
    pub instances: Vec<InstanceSnapshot>,
}

async fn broadcast(
    targets: &[mpsc::Sender<ActorMsg>],
    make: impl Fn() -> ActorMsg,
    cancel: &CancellationToken,
) -> Result<()> {
    for target in targets {
        if target.send(make()).await.is_err() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            return Err(EngineError::channel("actor mailbox closed"));
        }
    }
    Ok(())
}

// ============================================================================
// Lane
// ============================================================================

async fn run_lane(
    lane: LaneId,
    point_id: Arc<str>,
    mut rx: mpsc::Receiver<LaneMsg>,
    subscribers: Vec<mpsc::Sender<ActorMsg>>,
    cancel: CancellationToken,
) -> Result<LaneStats> {
    let mut stats = LaneStats::default();
    let mut high: Option<DateTime<Utc>> = None;

    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(stats),
            msg = rx.recv() => msg,
        };

        match msg {
            Some(LaneMsg::Record(value)) => {
                if high.is_some_and(|h| value.timestamp <= h) {
                    stats.dropped += 1;
                    trace!("{} dropped late value at {}", point_id, value.timestamp);
                    continue;
                }
                high = Some(value.timestamp);
                stats.accepted += 1;
                let make = || ActorMsg::Value {
                    point_id: point_id.clone(),
                    origins: vec![Origin(lane)],
                    value: value.clone(),
                };
                broadcast(&subscribers, make, &cancel).await?;
            },
            Some(LaneMsg::Tick(at)) => {
                if high.map_or(true, |h| at > h) {
                    high = Some(at);
                    let make = || ActorMsg::Progress {
                        point_id: point_id.clone(),
                        watermark: at,
                    };
                    broadcast(&subscribers, make, &cancel).await?;
                }
            },
            None => {
                let make = || ActorMsg::Closed {
                    point_id: point_id.clone(),
                };
                broadcast(&subscribers, make, &cancel).await?;
                return Ok(stats);
            },
        }
    }
}

// ============================================================================
// Actor tasks
// ============================================================================

struct CalculatedTask {
    actor: CalculatedPointActor,
    inbox: Inbox,
    point_id: Arc<str>,
    downstream: Vec<mpsc::Sender<ActorMsg>>,
    cancel: CancellationToken,
    superseded: Arc<AtomicBool>,
}

impl CalculatedTask {
    async fn run(mut self, mut rx: mpsc::Receiver<ActorMsg>) -> Result<CalculatedSnapshot> {
        if let Err(e) = self.drain(&mut rx).await {
            error!("Calculated point {} failed: {}", self.point_id, e);
            self.cancel.cancel();
            return Err(e);
        }
        if self.superseded.load(Ordering::Acquire) {
            self.actor.supersede();
        }
        Ok(self.actor.snapshot())
    }

    async fn drain(&mut self, rx: &mut mpsc::Receiver<ActorMsg>) -> Result<()> {
        while !self.inbox.is_closed() {
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                msg = rx.recv() => msg,
            };
            let Some(msg) = msg else {
                return Ok(());
            };
            self.inbox.accept(msg)?;

            for (timestamp, group) in self.inbox.release() {
                let Some(value) = self.actor.apply(timestamp, &group.values) else {
                    continue;
                };
                let origins: Vec<Origin> = group.origins.into_iter().collect();
                let make = || ActorMsg::Value {
                    point_id: self.point_id.clone(),
                    origins: origins.clone(),
                    value: value.clone(),
                };
                broadcast(&self.downstream, make, &self.cancel).await?;
            }

            if let Some(watermark) = self.inbox.advance() {
                let make = || ActorMsg::Progress {
                    point_id: self.point_id.clone(),
                    watermark,
                };
                broadcast(&self.downstream, make, &self.cancel).await?;
            }
        }

        let make = || ActorMsg::Closed {
            point_id: self.point_id.clone(),
        };
        broadcast(&self.downstream, make, &self.cancel).await
    }
}

struct InstanceTask {
    parts: InstanceParts,
    inbox: Inbox,
    dispatch: mpsc::Sender<Dispatch>,
    cancel: CancellationToken,
    superseded: Arc<AtomicBool>,
}

impl InstanceTask {
    async fn run(mut self, mut rx: mpsc::Receiver<ActorMsg>) -> Result<InstanceSnapshot> {
        let closed = match self.drain(&mut rx).await {
            Ok(closed) => closed,
            Err(e) => {
                error!(rule_instance = %self.parts.actor.key(), "Actor failed: {}", e);
                self.cancel.cancel();
                return Err(e);
            },
        };

        if closed && !self.cancel.is_cancelled() {
            let points = self.parts.outputs.flush();
            if !points.is_empty() {
                self.send(Dispatch::Outputs(points)).await?;
            }
            if let Some(insight) = self.parts.tracker.finish(&self.parts.actor) {
                self.send(Dispatch::Insight(Box::new(insight))).await?;
            }
        }
        if self.superseded.load(Ordering::Acquire) {
            self.parts.actor.supersede();
        }

        let mut snapshot = self.parts.actor.snapshot();
        snapshot.insight = self.parts.tracker.latest().cloned();
        Ok(snapshot)
    }

    /// `Ok(true)` once every edge closed
    async fn drain(&mut self, rx: &mut mpsc::Receiver<ActorMsg>) -> Result<bool> {
        while !self.inbox.is_closed() {
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(false),
                msg = rx.recv() => msg,
            };
            let Some(msg) = msg else {
                return Ok(false);
            };
            self.inbox.accept(msg)?;

            for (timestamp, group) in self.inbox.release() {
                let evaluation = self.parts.actor.apply(timestamp, &group.values);
                let points = self.parts.outputs.record(&evaluation.updates);
                if !points.is_empty() {
                    self.send(Dispatch::Outputs(points)).await?;
                }
                if evaluation.result_evaluated {
                    if let Some(insight) = self.parts.tracker.observe(&self.parts.actor, timestamp) {
                        self.send(Dispatch::Insight(Box::new(insight))).await?;
                    }
                }
            }
        }
        Ok(true)
    }

    async fn send(&self, item: Dispatch) -> Result<()> {
        if self.dispatch.send(item).await.is_err() && !self.cancel.is_cancelled() {
            return Err(EngineError::channel("dispatcher stopped"));
        }
        Ok(())
    }
}

async fn run_dispatcher(
    mut rx: mpsc::Receiver<Dispatch>,
    sinks: Sinks,
    cancel: CancellationToken,
) -> DispatchStats {
    let mut stats = DispatchStats::default();
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Dispatcher cancelled, skipping flush");
                return stats;
            },
            item = rx.recv() => item,
        };

        match item {
            Some(Dispatch::Outputs(points)) => match sinks.outputs.write(&points).await {
                Ok(()) => stats.outputs += points.len() as u64,
                Err(e) => {
                    error!("Output sink write failed: {}", e);
                    stats.errors += 1;
                },
            },
            Some(Dispatch::Insight(insight)) => match sinks.insights.upsert(&insight).await {
                Ok(()) => stats.insights += 1,
                Err(e) => {
                    error!("Insight upsert for {} failed: {}", insight.id, e);
                    stats.errors += 1;
                },
            },
            None => break,
        }
    }

    if let Err(e) = sinks.outputs.flush().await {
        error!("Output sink flush failed: {}", e);
        stats.errors += 1;
    }
    if let Err(e) = sinks.insights.flush().await {
        error!("Insight store flush failed: {}", e);
        stats.errors += 1;
    }
    stats
}

// ============================================================================
// Running generation
// ============================================================================

/// The task graph of one generation
pub struct RunningGeneration {
    lanes: Vec<mpsc::Sender<LaneMsg>>,
    lane_index: FxHashMap<Arc<str>, usize>,
    lane_tasks: Vec<JoinHandle<Result<LaneStats>>>,
    calculated_tasks: Vec<JoinHandle<Result<CalculatedSnapshot>>>,
    instance_tasks: Vec<JoinHandle<Result<InstanceSnapshot>>>,
    dispatcher: JoinHandle<DispatchStats>,
    run: CancellationToken,
    superseded: Arc<AtomicBool>,
    records: u64,
    unrouted: u64,
    latest: Option<DateTime<Utc>>,
}

impl RunningGeneration {
    /// Spawn every task; `actors` must be in topology order
    pub fn spawn(
        topology: &Topology,
        actors: ActorSet,
        config: &SchedulerConfig,
        sinks: Sinks,
        cancel: &CancellationToken,
    ) -> Self {
        let run = cancel.child_token();
        let superseded = Arc::new(AtomicBool::new(false));
        let mailbox = config.mailbox_capacity.max(1);

        let (dispatch_tx, dispatch_rx) = mpsc::channel(mailbox);
        let dispatcher = tokio::spawn(run_dispatcher(dispatch_rx, sinks, run.clone()));

        let (calculated_tx, calculated_rx): (Vec<_>, Vec<_>) =
            topology.calculated.iter().map(|_| mpsc::channel(mailbox)).unzip();
        let (instance_tx, instance_rx): (Vec<_>, Vec<_>) =
            topology.instances.iter().map(|_| mpsc::channel(mailbox)).unzip();
        let targets = |point_id: &str| -> Vec<mpsc::Sender<ActorMsg>> {
            topology
                .subscribers(point_id)
                .iter()
                .map(|actor| match actor {
                    ActorRef::Calculated(i) => calculated_tx[*i].clone(),
                    ActorRef::Instance(i) => instance_tx[*i].clone(),
                })
                .collect()
        };

        let mut calculated_tasks = Vec::with_capacity(topology.calculated.len());
        for ((spec, actor), rx) in topology.calculated.iter().zip(actors.calculated).zip(calculated_rx) {
            let task = CalculatedTask {
                actor,
                inbox: Inbox::new(spec.point.id.clone(), &spec.inputs, spec.origins.clone()),
                point_id: Arc::from(spec.point.id.as_str()),
                downstream: targets(&spec.point.id),
                cancel: run.clone(),
                superseded: superseded.clone(),
            };
            calculated_tasks.push(tokio::spawn(task.run(rx)));
        }

        let mut instance_tasks = Vec::with_capacity(topology.instances.len());
        for ((spec, parts), rx) in topology.instances.iter().zip(actors.instances).zip(instance_rx) {
            let task = InstanceTask {
                inbox: Inbox::new(spec.key.to_string(), &spec.inputs, spec.origins.clone()),
                parts,
                dispatch: dispatch_tx.clone(),
                cancel: run.clone(),
                superseded: superseded.clone(),
            };
            instance_tasks.push(tokio::spawn(task.run(rx)));
        }
        drop(dispatch_tx);

        let mut lanes = Vec::with_capacity(topology.lanes.len());
        let mut lane_tasks = Vec::with_capacity(topology.lanes.len());
        for (index, point_id) in topology.lanes.iter().enumerate() {
            let (tx, rx) = mpsc::channel(config.lane_capacity.max(1));
            let lane = LaneId(index as u32);
            lane_tasks.push(tokio::spawn(run_lane(lane, point_id.clone(), rx, targets(point_id), run.clone())));
            lanes.push(tx);
        }
        // mailboxes now close with their last upstream task
        drop(calculated_tx);
        drop(instance_tx);

        debug!(
            "Spawned {} lanes, {} calculated and {} rule actors",
            lanes.len(),
            calculated_tasks.len(),
            instance_tasks.len()
        );
        Self {
            lanes,
            lane_index: topology
                .lanes
                .iter()
                .enumerate()
                .map(|(i, p)| (p.clone(), i))
                .collect(),
            lane_tasks,
            calculated_tasks,
            instance_tasks,
            dispatcher,
            run,
            superseded,
            records: 0,
            unrouted: 0,
            latest: None,
        }
    }

    async fn send_lane(&self, lane: usize, msg: LaneMsg) -> Result<()> {
        if self.lanes[lane].send(msg).await.is_err() && !self.run.is_cancelled() {
            return Err(EngineError::channel("telemetry lane stopped"));
        }
        Ok(())
    }

    /// Route one record to its lane; `false` if no actor reads the point
    pub async fn ingest(&mut self, record: TelemetryRecord) -> Result<bool> {
        self.records += 1;
        let Some(lane) = self.lane_index.get(&record.point_id).copied() else {
            self.unrouted += 1;
            trace!("No reader for {}", record.point_id);
            return Ok(false);
        };
        let timestamp = record.timestamp();
        self.latest = Some(self.latest.map_or(timestamp, |l| l.max(timestamp)));
        self.send_lane(lane, LaneMsg::Record(record.value)).await?;
        Ok(true)
    }

    /// Promise every lane that nothing at or before `at` is still coming
    pub async fn tick(&self, at: DateTime<Utc>) -> Result<()> {
        for lane in 0..self.lanes.len() {
            self.send_lane(lane, LaneMsg::Tick(at)).await?;
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.run.is_cancelled()
    }

    /// Mark the generation superseded; actors end in that phase after the flush
    pub fn supersede(&self) {
        self.superseded.store(true, Ordering::Release);
    }

    /// Feed records already sorted by timestamp
    ///
    /// A tick goes out every `progress_interval` records, at a timestamp
    /// boundary so no later record can be at or before it.
    pub async fn replay(&mut self, records: Vec<TelemetryRecord>, progress_interval: usize) -> Result<()> {
        let every = progress_interval.max(1);
        let mut since_tick = 0;
        let mut previous: Option<DateTime<Utc>> = None;

        for record in records {
            if self.run.is_cancelled() {
                info!("Replay cancelled after {} records", self.records);
                break;
            }
            let timestamp = record.timestamp();
            if since_tick >= every {
                if let Some(boundary) = previous.filter(|p| timestamp > *p) {
                    self.tick(boundary).await?;
                    since_tick = 0;
                }
            }
            self.ingest(record).await?;
            since_tick += 1;
            previous = Some(timestamp);
        }
        Ok(())
    }

    /// Follow a live feed until EOF, cancellation or a new generation
    pub async fn follow(
        &mut self,
        rx: &mut mpsc::Receiver<TelemetryRecord>,
        generations: &mut watch::Receiver<u64>,
        config: &SchedulerConfig,
    ) -> Result<FollowEnd> {
        let period = Duration::from_millis(config.tick_ms.max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let lateness = chrono::Duration::seconds(config.max_lateness_secs as i64);
        let mut ticked: Option<DateTime<Utc>> = None;
        let mut watching = true;
        let run = self.run.clone();

        loop {
            tokio::select! {
                _ = run.cancelled() => return Ok(FollowEnd::Cancelled),
                changed = generations.changed(), if watching => {
                    if changed.is_ok() {
                        info!("New generation available, superseding");
                        self.supersede();
                        return Ok(FollowEnd::Superseded);
                    }
                    warn!("Generation notifier dropped");
                    watching = false;
                },
                _ = ticker.tick() => {
                    if let Some(latest) = self.latest {
                        let at = latest - lateness;
                        if ticked.map_or(true, |t| at > t) {
                            self.tick(at).await?;
                            ticked = Some(at);
                        }
                    }
                },
                record = rx.recv() => match record {
                    Some(record) => {
                        self.ingest(record).await?;
                    },
                    None => return Ok(FollowEnd::Eof),
                },
            }
        }
    }

    /// Close every lane and wait for the task graph to wind down
    pub async fn finish(self) -> Result<GenerationOutcome> {
        let RunningGeneration {
            lanes,
            lane_tasks,
            calculated_tasks,
            instance_tasks,
            dispatcher,
            records,
            unrouted,
            ..
        } = self;
        drop(lanes);

        let lane_results = try_join_all(lane_tasks).await?;
        let calculated_results = try_join_all(calculated_tasks).await?;
        let instance_results = try_join_all(instance_tasks).await?;
        let dispatch = dispatcher.await?;

        let calculated = calculated_results.into_iter().collect::<Result<Vec<_>>>()?;
        let instances = instance_results.into_iter().collect::<Result<Vec<_>>>()?;
        let mut lane_stats = LaneStats::default();
        for stats in lane_results {
            let stats = stats?;
            lane_stats.accepted += stats.accepted;
            lane_stats.dropped += stats.dropped;
        }

        Ok(GenerationOutcome {
            records,
            unrouted,
            lanes: lane_stats,
            dispatch,
            calculated,
            instances,
        })
    }
}

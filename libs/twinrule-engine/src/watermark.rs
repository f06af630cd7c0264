//! Per-actor input edges and watermarks
//!
//! An actor hears from one upstream per input point (a lane or a calculated
//! point actor). Values are held until every open edge has progressed past
//! their timestamp, then released one timestamp group at a time, so the
//! evaluation sequence does not depend on how the upstream tasks interleave.

use crate::error::{EngineError, Result};
use crate::generation::LaneId;
use crate::scheduler::{ActorMsg, Origin};
use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use twinrule_model::TimedValue;

#[derive(Debug, Clone, Copy, Default)]
struct Edge {
    progress: Option<DateTime<Utc>>,
    closed: bool,
}

/// Values sharing one timestamp
#[derive(Debug, Default)]
pub struct Group {
    pub values: Vec<(Arc<str>, TimedValue)>,
    pub origins: BTreeSet<Origin>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    /// Nothing at or before this time is still to come
    At(DateTime<Utc>),
    /// Every edge is closed
    Closed,
}

#[derive(Debug)]
pub struct Inbox {
    owner: String,
    permitted: BTreeSet<LaneId>,
    edges: FxHashMap<Arc<str>, Edge>,
    pending: BTreeMap<DateTime<Utc>, Group>,
    forwarded: Option<DateTime<Utc>>,
}

impl Inbox {
    pub fn new(owner: impl Into<String>, inputs: &BTreeSet<String>, permitted: BTreeSet<LaneId>) -> Self {
        Self {
            owner: owner.into(),
            permitted,
            edges: inputs
                .iter()
                .map(|id| (Arc::from(id.as_str()), Edge::default()))
                .collect(),
            pending: BTreeMap::new(),
            forwarded: None,
        }
    }

    fn edge(&mut self, point_id: &str) -> Result<&mut Edge> {
        let owner = &self.owner;
        self.edges
            .get_mut(point_id)
            .ok_or_else(|| EngineError::routing(format!("{} does not read {}", owner, point_id)))
    }

    pub fn accept(&mut self, msg: ActorMsg) -> Result<()> {
        match msg {
            ActorMsg::Value {
                point_id,
                origins,
                value,
            } => {
                if let Some(origin) = origins.iter().find(|o| !self.permitted.contains(&o.lane())) {
                    return Err(EngineError::routing(format!(
                        "{} received {} from lane {}",
                        self.owner,
                        point_id,
                        origin.lane().index()
                    )));
                }
                let timestamp = value.timestamp;
                let edge = self.edge(&point_id)?;
                if edge.closed {
                    return Err(EngineError::routing(format!(
                        "{} received {} after close",
                        self.owner, point_id
                    )));
                }
                edge.progress = Some(edge.progress.map_or(timestamp, |p| p.max(timestamp)));

                let group = self.pending.entry(timestamp).or_default();
                group.values.push((point_id, value));
                group.origins.extend(origins);
            },
            ActorMsg::Progress {
                point_id,
                watermark,
            } => {
                let edge = self.edge(&point_id)?;
                edge.progress = Some(edge.progress.map_or(watermark, |p| p.max(watermark)));
            },
            ActorMsg::Closed { point_id } => {
                self.edge(&point_id)?.closed = true;
            },
        }
        Ok(())
    }

    /// `None` while some open edge has not reported any progress
    pub fn watermark(&self) -> Option<Watermark> {
        let mut low: Option<DateTime<Utc>> = None;
        for edge in self.edges.values().filter(|e| !e.closed) {
            let progress = edge.progress?;
            low = Some(low.map_or(progress, |l| l.min(progress)));
        }
        Some(low.map_or(Watermark::Closed, Watermark::At))
    }

    pub fn is_closed(&self) -> bool {
        self.edges.values().all(|e| e.closed)
    }

    /// Groups at or before the watermark, oldest first
    pub fn release(&mut self) -> Vec<(DateTime<Utc>, Group)> {
        let ready = match self.watermark() {
            None => return Vec::new(),
            Some(Watermark::Closed) => std::mem::take(&mut self.pending),
            Some(Watermark::At(at)) => {
                let later = self.pending.split_off(&(at + Duration::nanoseconds(1)));
                std::mem::replace(&mut self.pending, later)
            },
        };
        ready.into_iter().collect()
    }

    /// Watermark to pass downstream, once per advance
    pub fn advance(&mut self) -> Option<DateTime<Utc>> {
        match self.watermark()? {
            Watermark::At(at) if self.forwarded.map_or(true, |f| at > f) => {
                self.forwarded = Some(at);
                Some(at)
            },
            _ => None,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.values().map(|g| g.values.len()).sum()
    }
}

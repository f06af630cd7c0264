//! Output and insight sinks
//!
//! The engine hands finished points and insight records to these traits from a
//! single dispatcher task; implementations never run on an actor's path.

use crate::error::{EngineError, Result};
use crate::output::{OutputPoint, OutputValue};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use twinrule_model::Insight;

#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn write(&self, points: &[OutputPoint]) -> Result<()>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Create-or-update store keyed by `(equipment, rule)`
#[async_trait]
pub trait InsightStore: Send + Sync {
    async fn upsert(&self, insight: &Insight) -> Result<()>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryOutputSink {
    points: Mutex<Vec<OutputPoint>>,
}

impl MemoryOutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<OutputPoint> {
        self.points.lock().clone()
    }

    /// Points of one output series in arrival order
    pub fn series(&self, external_id: &str) -> Vec<OutputPoint> {
        self.points
            .lock()
            .iter()
            .filter(|p| p.external_id == external_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.lock().is_empty()
    }
}

#[async_trait]
impl OutputSink for MemoryOutputSink {
    async fn write(&self, points: &[OutputPoint]) -> Result<()> {
        self.points.lock().extend_from_slice(points);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryInsightStore {
    insights: Mutex<BTreeMap<String, Insight>>,
    upserts: Mutex<u64>,
}

impl MemoryInsightStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, equipment_id: &str, rule_id: &str) -> Option<Insight> {
        self.insights
            .lock()
            .get(&Insight::instance_id(equipment_id, rule_id))
            .cloned()
    }

    pub fn all(&self) -> Vec<Insight> {
        self.insights.lock().values().cloned().collect()
    }

    /// Number of upserts received, including updates
    pub fn upsert_count(&self) -> u64 {
        *self.upserts.lock()
    }
}

#[async_trait]
impl InsightStore for MemoryInsightStore {
    async fn upsert(&self, insight: &Insight) -> Result<()> {
        self.insights.lock().insert(insight.id.clone(), insight.clone());
        *self.upserts.lock() += 1;
        Ok(())
    }
}

// ============================================================================
// Files
// ============================================================================

/// Appends `external_id,timestamp,value,unit` rows
pub struct CsvOutputSink {
    path: PathBuf,
    writer: Mutex<csv::Writer<std::fs::File>>,
}

impl CsvOutputSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["external_id", "timestamp", "value", "unit"])?;
        info!("Writing outputs to {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn format_value(value: &OutputValue) -> String {
    match value {
        OutputValue::Number(n) => ryu::Buffer::new().format(*n).to_string(),
        OutputValue::Text(s) => s.clone(),
    }
}

#[async_trait]
impl OutputSink for CsvOutputSink {
    async fn write(&self, points: &[OutputPoint]) -> Result<()> {
        let mut writer = self.writer.lock();
        for point in points {
            writer.write_record([
                point.external_id.as_str(),
                &point.timestamp.to_rfc3339(),
                &format_value(&point.value),
                point.unit.as_deref().unwrap_or(""),
            ])?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

/// Keeps the latest insight per instance and writes them as a JSON map on flush
pub struct JsonInsightStore {
    path: PathBuf,
    insights: Mutex<BTreeMap<String, Insight>>,
}

impl JsonInsightStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            insights: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl InsightStore for JsonInsightStore {
    async fn upsert(&self, insight: &Insight) -> Result<()> {
        self.insights.lock().insert(insight.id.clone(), insight.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let content = {
            let insights = self.insights.lock();
            serde_json::to_string_pretty(&*insights)?
        };
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| EngineError::sink(format!("{}: {}", self.path.display(), e)))?;
        debug!("Wrote insights to {}", self.path.display());
        Ok(())
    }
}

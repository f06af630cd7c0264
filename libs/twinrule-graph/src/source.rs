//! Twin directory access

use crate::error::{GraphError, Result};
use crate::graph::TwinSnapshot;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// Read-only source of twin graph snapshots
#[async_trait]
pub trait TwinSource: Send + Sync {
    async fn fetch(&self) -> Result<TwinSnapshot>;
}

/// Parse a snapshot from YAML or JSON text based on the file extension
pub fn parse_snapshot(path: &Path, content: &str) -> Result<TwinSnapshot> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(serde_json::from_str(content)?),
        Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(content)?),
        other => Err(GraphError::source(format!(
            "unsupported twin file extension {:?} for {}",
            other,
            path.display()
        ))),
    }
}

/// `twins.yaml` / `twins.json` on disk, re-read on every fetch
#[derive(Debug, Clone)]
pub struct FileTwinSource {
    path: PathBuf,
}

impl FileTwinSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TwinSource for FileTwinSource {
    async fn fetch(&self) -> Result<TwinSnapshot> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| GraphError::source(format!("{}: {}", self.path.display(), e)))?;
        let snapshot = parse_snapshot(&self.path, &content)?;
        info!(
            "Loaded {} twins and {} relationships from {}",
            snapshot.twins.len(),
            snapshot.relationships.len(),
            self.path.display()
        );
        Ok(snapshot)
    }
}

/// Fixed in-memory snapshot
#[derive(Debug, Clone, Default)]
pub struct StaticTwinSource {
    snapshot: TwinSnapshot,
}

impl StaticTwinSource {
    pub fn new(snapshot: TwinSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl TwinSource for StaticTwinSource {
    async fn fetch(&self) -> Result<TwinSnapshot> {
        Ok(self.snapshot.clone())
    }
}

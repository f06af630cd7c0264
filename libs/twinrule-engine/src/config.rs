//! Engine configuration
//!
//! Loaded with figment, later sources overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. a YAML file (optional)
//! 3. `TWINRULE_` environment variables, nested with `__`
//!    (`TWINRULE_SCHEDULER__LANE_CAPACITY=4096`)

use crate::error::Result;
use chrono::Duration;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};
use twinrule_calc::EvalPolicy;
use twinrule_graph::BinderConfig;
use twinrule_model::{RetentionPolicy, MAX_BUFFER_DAYS};

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "TWINRULE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Bounded queue length per telemetry point
    pub lane_capacity: usize,
    /// Bounded mailbox length per actor
    pub mailbox_capacity: usize,
    /// Records between watermark ticks in batch runs
    pub progress_interval: usize,
    /// Realtime watermark lag behind the newest ingested timestamp
    pub max_lateness_secs: u64,
    /// Realtime tick period, milliseconds
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lane_capacity: 1024,
            mailbox_capacity: 1024,
            progress_interval: 64,
            max_lateness_secs: 0,
            tick_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_count: usize,
    pub max_age_hours: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_count: 10_000,
            max_age_hours: MAX_BUFFER_DAYS * 24,
        }
    }
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_count: Some(self.max_count.max(2)),
            max_age: Some(Duration::hours(self.max_age_hours.clamp(1, MAX_BUFFER_DAYS * 24))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Compression window for non-result fields, seconds
    pub window_secs: i64,
    /// Numeric change below which a point is suppressed
    pub tolerance: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            window_secs: 3600,
            tolerance: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightConfig {
    /// Event-time hours after which a batch run syncs a healthy insight
    pub force_sync_hours: f64,
    /// Share of the observed period since the last sync that forces one
    pub sync_fraction: f64,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            force_sync_hours: 6.0,
            sync_fraction: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub retention: RetentionConfig,
    pub output: OutputConfig,
    pub insight: InsightConfig,
    pub binder: BinderConfig,
    pub aggregate: EvalPolicy,
}

impl EngineConfig {
    /// Defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = path {
            info!("Loading engine configuration from {}", path.display());
            figment = figment.merge(Yaml::file(path));
        }
        let config: EngineConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        debug!("Engine configuration: {:?}", config);
        Ok(config)
    }
}

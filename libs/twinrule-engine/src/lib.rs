//! Twinrule Engine - streaming rule evaluation
//!
//! Binds rules to equipment in a twin graph, evaluates them over telemetry and
//! publishes compressed, versioned outputs and insights:
//! - one task per telemetry lane, per calculated point and per rule instance
//! - values carry the lanes they came from; actors only accept their own
//! - watermarks release values in timestamp order, so results do not depend
//!   on task interleaving
//! - batch reruns bump the output version, realtime runs keep it
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐    ┌────────────┐    ┌─────────────┐    ┌──────────────┐
//! │ Telemetry │───▶│   Lanes    │───▶│ Calculated  │───▶│ Rule         │
//! │ CSV / feed│    │ (per point)│    │ point actors│    │ instances    │
//! └───────────┘    └────────────┘    └─────────────┘    └──────┬───────┘
//!                        │                                     │
//!                        └─────────────────────────────────────┤
//!                                                              ▼
//! ┌───────────┐    ┌────────────┐                       ┌──────────────┐
//! │ TwinSource│───▶│ Topology   │                       │  Dispatcher  │
//! │ + RuleSet │    │ (binding)  │                       │ sinks/stores │
//! └───────────┘    └────────────┘                       └──────────────┘
//! ```

pub mod actor;
pub mod clock;
pub mod config;
pub mod engine;
mod error;
pub mod generation;
pub mod insight;
pub mod loader;
pub mod output;
pub mod scheduler;
pub mod sink;
pub mod telemetry;
pub mod version;
pub mod watermark;

// Re-export public API
pub use actor::{
    ActorPhase, ActorStats, BoundParameter, CalculatedPointActor, CalculatedSnapshot, InstanceKey,
    InstanceSnapshot, OutputState, ParameterSnapshot, RuleInstanceActor, DELTA_TIME_S, IS_FAULTY,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    EngineConfig, InsightConfig, OutputConfig, RetentionConfig, SchedulerConfig, ENV_PREFIX,
};
pub use engine::{Engine, RunSummary};
pub use error::{EngineError, Result};
pub use generation::{Topology, ValidationReport};
pub use insight::{InsightTracker, Interpolator, RunMode};
pub use loader::RuleSet;
pub use output::{external_id, ChangeCompressor, OutputPoint, OutputValue, ResultBucketer};
pub use scheduler::{Sinks, FollowEnd};
pub use sink::{
    CsvOutputSink, InsightStore, JsonInsightStore, MemoryInsightStore, MemoryOutputSink,
    OutputSink,
};
pub use telemetry::{parse_row, read_csv, read_csv_file, sort_records, TelemetryBatch, TelemetryRecord};
pub use version::VersionRegistry;

//! Engine Error Types

use thiserror::Error;
use twinrule_calc::CalcError;
use twinrule_graph::GraphError;
use twinrule_model::ModelError;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Formula error outside of evaluation (parse at generation time)
    #[error("Formula error: {0}")]
    Calc(#[from] CalcError),

    /// Twin graph error
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Rule or value model error
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Calculated points depend on each other in a loop
    #[error("Calculated point cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    /// No topology has been bound yet
    #[error("Engine has no bound generation: {0}")]
    NotBound(String),

    /// A message reached an actor from a queue it does not own
    #[error("Routing violation: {0}")]
    Routing(String),

    /// Telemetry input could not be read
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// Output or insight store failure
    #[error("Sink error: {0}")]
    Sink(String),

    /// Internal channel closed unexpectedly
    #[error("Channel closed: {0}")]
    Channel(String),

    /// Actor task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for EngineError {
    fn from(err: csv::Error) -> Self {
        EngineError::Telemetry(err.to_string())
    }
}

impl From<figment::Error> for EngineError {
    fn from(err: figment::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<regex::Error> for EngineError {
    fn from(err: regex::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Task(err.to_string())
    }
}

// Helper methods
impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }

    pub fn routing(msg: impl Into<String>) -> Self {
        EngineError::Routing(msg.into())
    }

    pub fn telemetry(msg: impl Into<String>) -> Self {
        EngineError::Telemetry(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        EngineError::Sink(msg.into())
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        EngineError::Channel(msg.into())
    }
}

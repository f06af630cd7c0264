//! Graph Layer Error Types

use thiserror::Error;

/// Result type for twinrule-graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Error, Clone)]
pub enum GraphError {
    /// Twin id not present in the graph
    #[error("Twin not found: {0}")]
    TwinNotFound(String),

    /// Two twins share an id
    #[error("Duplicate twin id: {0}")]
    DuplicateTwin(String),

    /// Relationship endpoint does not exist
    #[error("Dangling relationship {name}: {source_id} -> {target_id}")]
    DanglingRelationship {
        name: String,
        source_id: String,
        target_id: String,
    },

    /// Twin directory could not be read
    #[error("Twin source unavailable: {0}")]
    Source(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for GraphError {
    fn from(err: serde_yaml::Error) -> Self {
        GraphError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for GraphError {
    fn from(err: std::io::Error) -> Self {
        GraphError::Source(err.to_string())
    }
}

impl GraphError {
    pub fn twin_not_found(id: impl Into<String>) -> Self {
        GraphError::TwinNotFound(id.into())
    }

    pub fn source(msg: impl Into<String>) -> Self {
        GraphError::Source(msg.into())
    }
}

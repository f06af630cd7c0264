//! Model Layer Error Types

use thiserror::Error;

/// Result type for twinrule-model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Model layer errors
#[derive(Debug, Error, Clone)]
pub enum ModelError {
    /// Value could not be interpreted as a telemetry value
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Time series processing error
    #[error("Time series error: {0}")]
    TimeSeries(String),

    /// Rule definition error
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Serialization(err.to_string())
    }
}

// Helper methods
impl ModelError {
    pub fn invalid_value(msg: impl Into<String>) -> Self {
        ModelError::InvalidValue(msg.into())
    }

    pub fn time_series(msg: impl Into<String>) -> Self {
        ModelError::TimeSeries(msg.into())
    }

    pub fn invalid_rule(msg: impl Into<String>) -> Self {
        ModelError::InvalidRule(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ModelError::Validation(msg.into())
    }
}

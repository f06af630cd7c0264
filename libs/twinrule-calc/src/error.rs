//! Error types for twinrule-calc

use thiserror::Error;

/// Parse and evaluation errors
///
/// Evaluation errors are ordinary values for callers: an actor turns them into
/// an invalid / missing / insufficient-data state for one parameter.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalcError {
    #[error("Parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Invalid expression: {0}")]
    Type(String),

    #[error("Function error: {0}")]
    Function(String),

    #[error("Missing value: {0}")]
    MissingValue(String),

    #[error("Unbound reference: {0}")]
    Unbound(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),
}

impl CalcError {
    pub fn parse(position: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            position,
            message: message.into(),
        }
    }

    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::Type(msg.into())
    }

    pub fn function(msg: impl Into<String>) -> Self {
        Self::Function(msg.into())
    }

    pub fn missing(name: impl Into<String>) -> Self {
        Self::MissingValue(name.into())
    }

    pub fn unbound(name: impl Into<String>) -> Self {
        Self::Unbound(name.into())
    }

    pub fn insufficient(msg: impl Into<String>) -> Self {
        Self::InsufficientData(msg.into())
    }

    /// The value simply is not there (yet); `OPTION`/`IFNAN`/`EXISTS` may recover
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::MissingValue(_) | Self::Unbound(_))
    }
}

pub type Result<T> = std::result::Result<T, CalcError>;

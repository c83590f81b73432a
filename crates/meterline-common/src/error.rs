//! Error types for the Meterline engine
//!
//! Provides a unified error type and domain-specific error variants

use thiserror::Error;

/// Result type alias using MeteringError
pub type Result<T> = std::result::Result<T, MeteringError>;

/// Unified error type for metering operations
#[derive(Debug, Error)]
pub enum MeteringError {
    // Input errors, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    // Formula errors
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    // Store errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    // Non-numeric aggregation target
    #[error("Cast error: {0}")]
    Cast(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Transport errors
    #[error("Network error: {0}")]
    Network(String),

    // Deadline exceeded
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeteringError {
    /// Whether the caller may reasonably retry the operation.
    ///
    /// The engine itself never retries; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeteringError::Database(_) | MeteringError::Network(_) | MeteringError::Timeout(_)
        )
    }

    /// Whether the error stems from bad input rather than the environment.
    pub fn is_validation(&self) -> bool {
        match self {
            MeteringError::Validation(_) => true,
            MeteringError::Expression(e) => e.is_validation(),
            _ => false,
        }
    }
}

/// Store failures, split by the phase in which they happened
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("{hint}: {message}")]
    Query { hint: String, message: String },

    /// The result stream ended early after rows had been received
    #[error("{hint} (row iteration): {message}")]
    RowIteration { hint: String, message: String },

    #[error("{hint} (insert): {message}")]
    Insert { hint: String, message: String },
}

impl DatabaseError {
    pub fn query(hint: impl Into<String>, err: impl std::fmt::Display) -> Self {
        DatabaseError::Query {
            hint: hint.into(),
            message: err.to_string(),
        }
    }

    pub fn row_iteration(hint: impl Into<String>, err: impl std::fmt::Display) -> Self {
        DatabaseError::RowIteration {
            hint: hint.into(),
            message: err.to_string(),
        }
    }

    pub fn insert(hint: impl Into<String>, err: impl std::fmt::Display) -> Self {
        DatabaseError::Insert {
            hint: hint.into(),
            message: err.to_string(),
        }
    }
}

/// Formula compilation and evaluation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    #[error("expression is empty")]
    Empty,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("expression has no variable identifiers")]
    NoIdentifiers,

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("expression must evaluate to a number, got {0}")]
    NonNumeric(String),
}

impl ExpressionError {
    /// Compile-time problems with the formula text itself
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ExpressionError::Empty | ExpressionError::Parse(_) | ExpressionError::NoIdentifiers
        )
    }
}

// Implement From for common external error types
impl From<serde_json::Error> for MeteringError {
    fn from(err: serde_json::Error) -> Self {
        MeteringError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for MeteringError {
    fn from(err: anyhow::Error) -> Self {
        MeteringError::Internal(err.to_string())
    }
}

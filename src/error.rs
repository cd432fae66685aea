//! # Batch Coordination Errors
//!
//! Structured error taxonomy for the batch completion coordinator using thiserror.
//!
//! Errors fall into three families:
//!
//! - **Caller errors** (`Validation`, `UnknownBatch`, `InvalidTransition`): not retryable
//!   without a change on the caller's side.
//! - **Transient errors** (`Persistence`, `Notification`): retried locally with bounded
//!   backoff. Every mutating store operation is idempotent so this is always safe.
//! - **Data-integrity errors** (`NoStagedData`, `MergeVerification`, `InvalidStagedData`):
//!   terminal. The batch is moved to `FAILED`, staged units are preserved, and the error
//!   is never retried automatically.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown batch: {batch_id}")]
    UnknownBatch { batch_id: String },

    #[error("Persistence error during {operation}: {message}")]
    Persistence { operation: String, message: String },

    #[error("No staged data for batch {batch_id}: {detail}")]
    NoStagedData { batch_id: String, detail: String },

    #[error(
        "Merge verification failed for batch {batch_id}: expected at least {expected} rows, observed {observed} ({detail})"
    )]
    MergeVerification {
        batch_id: String,
        expected: u64,
        observed: u64,
        detail: String,
    },

    #[error("Invalid staged data for batch {batch_id}: {message}")]
    InvalidStagedData { batch_id: String, message: String },

    #[error("Invalid state transition for batch {batch_id}: {from} -> {to}")]
    InvalidTransition {
        batch_id: String,
        from: String,
        to: String,
    },

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BatchError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unknown_batch(batch_id: impl Into<String>) -> Self {
        Self::UnknownBatch {
            batch_id: batch_id.into(),
        }
    }

    pub fn persistence(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persistence {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Build a `map_err` adapter that tags a sqlx failure with the store operation name
    pub fn from_sqlx(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |e| Self::persistence(operation, e.to_string())
    }

    /// Transient failures that callers may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence { .. } | Self::Notification(_))
    }

    /// Failures that move a batch to `FAILED` and must never be retried automatically
    pub fn is_data_integrity(&self) -> bool {
        matches!(
            self,
            Self::NoStagedData { .. }
                | Self::MergeVerification { .. }
                | Self::InvalidStagedData { .. }
        )
    }

    /// Stable short code used in logs and batch failure reasons
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::UnknownBatch { .. } => "unknown_batch",
            Self::Persistence { .. } => "persistence",
            Self::NoStagedData { .. } => "no_staged_data",
            Self::MergeVerification { .. } => "merge_verification",
            Self::InvalidStagedData { .. } => "invalid_staged_data",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Notification(_) => "notification",
            Self::Dispatch(_) => "dispatch",
            Self::Configuration(_) => "configuration",
        }
    }
}

impl From<config::ConfigError> for BatchError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::persistence("serialize", err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;

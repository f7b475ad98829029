//! Error types for the suitability analysis services.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using SuitError.
pub type SuitResult<T> = Result<T, SuitError>;

/// Classification persisted on a failed job.
///
/// This is the user-facing error taxonomy: it decides retry eligibility
/// and is what the status endpoint reports alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input, rejected before a job exists.
    Validation,
    /// Source raster could not be fetched.
    DataUnavailable,
    /// AOI does not overlap a required layer.
    AlignmentFailure,
    /// Numeric/pipeline failure or wall-clock timeout.
    ComputeFailure,
    /// Result could not be persisted.
    StorageFailure,
    /// Job was cancelled by its owner.
    Cancelled,
}

impl ErrorKind {
    /// Whether a failure of this kind may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::DataUnavailable | ErrorKind::StorageFailure | ErrorKind::ComputeFailure
        )
    }

    /// Number of retries allowed for this kind, given the policy bound for transient I/O.
    pub fn max_retries(&self, io_retry_bound: u32) -> u32 {
        match self {
            ErrorKind::DataUnavailable | ErrorKind::StorageFailure => io_retry_bound,
            ErrorKind::ComputeFailure => 1,
            ErrorKind::Validation | ErrorKind::AlignmentFailure | ErrorKind::Cancelled => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::DataUnavailable => "data_unavailable",
            ErrorKind::AlignmentFailure => "alignment_failure",
            ErrorKind::ComputeFailure => "compute_failure",
            ErrorKind::StorageFailure => "storage_failure",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(ErrorKind::Validation),
            "data_unavailable" => Some(ErrorKind::DataUnavailable),
            "alignment_failure" => Some(ErrorKind::AlignmentFailure),
            "compute_failure" => Some(ErrorKind::ComputeFailure),
            "storage_failure" => Some(ErrorKind::StorageFailure),
            "cancelled" => Some(ErrorKind::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Primary error type for analysis operations.
#[derive(Debug, Error)]
pub enum SuitError {
    // === Pipeline taxonomy ===
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    #[error("AOI does not overlap required layer: {0}")]
    AlignmentFailure(String),

    #[error("Computation failed: {0}")]
    ComputeFailure(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Job cancelled")]
    Cancelled,

    // === Infrastructure Errors ===
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl SuitError {
    /// Classify this error for persistence on a failed job.
    ///
    /// Infrastructure failures surfacing inside a pipeline stage are
    /// treated as storage failures, since they come from the persistence layer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SuitError::Validation(_) | SuitError::LayerNotFound(_) => ErrorKind::Validation,
            SuitError::DataUnavailable(_) => ErrorKind::DataUnavailable,
            SuitError::AlignmentFailure(_) => ErrorKind::AlignmentFailure,
            SuitError::ComputeFailure(_) | SuitError::InternalError(_) => ErrorKind::ComputeFailure,
            SuitError::StorageFailure(_)
            | SuitError::DatabaseError(_)
            | SuitError::QueueError(_) => ErrorKind::StorageFailure,
            SuitError::Cancelled => ErrorKind::Cancelled,
            SuitError::JobNotFound(_) | SuitError::InvalidTransition(_) => {
                ErrorKind::ComputeFailure
            }
        }
    }

    /// Build an error of the given kind with a message.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Validation => SuitError::Validation(message),
            ErrorKind::DataUnavailable => SuitError::DataUnavailable(message),
            ErrorKind::AlignmentFailure => SuitError::AlignmentFailure(message),
            ErrorKind::ComputeFailure => SuitError::ComputeFailure(message),
            ErrorKind::StorageFailure => SuitError::StorageFailure(message),
            ErrorKind::Cancelled => SuitError::Cancelled,
        }
    }
}

impl From<serde_json::Error> for SuitError {
    fn from(err: serde_json::Error) -> Self {
        SuitError::InternalError(format!("JSON error: {}", err))
    }
}

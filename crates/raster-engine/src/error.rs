//! Error types for the raster engine.

use thiserror::Error;

use suit_common::{ErrorKind, SuitError};

/// Errors that can occur while reading, aligning or writing rasters.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The layer has no array in the backing store.
    #[error("layer '{0}' not found in raster store")]
    LayerMissing(String),

    /// The requested window lies outside the layer's extent.
    #[error("requested window does not intersect layer '{0}'")]
    NoIntersection(String),

    /// The backing store failed to serve a read.
    #[error("failed to read layer '{layer}': {message}")]
    ReadFailed { layer: String, message: String },

    /// Layer array attributes are missing or malformed.
    #[error("invalid layer metadata: {0}")]
    InvalidMetadata(String),

    /// The AOI extent needs a larger analysis grid than allowed.
    #[error("AOI extent needs a {cells}-cell analysis grid, limit is {limit}")]
    GridTooLarge { cells: u64, limit: u64 },

    /// A source window has no spatial overlap with the target grid.
    #[error("AOI does not overlap required layer: {0}")]
    NoOverlap(String),

    /// Windows handed to a per-cell kernel are not on one grid.
    #[error("grid mismatch: {0}")]
    GridMismatch(String),

    /// Normalization domain with min >= max.
    #[error("invalid normalization domain [{min}, {max}]")]
    InvalidDomain { min: f64, max: f64 },

    /// Numeric or pipeline failure.
    #[error("compute error: {0}")]
    Compute(String),

    /// Result persistence failure.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl EngineError {
    pub fn read_failed(layer: impl Into<String>, message: impl ToString) -> Self {
        Self::ReadFailed {
            layer: layer.into(),
            message: message.to_string(),
        }
    }

    pub fn storage(message: impl ToString) -> Self {
        Self::StorageError(message.to_string())
    }

    pub fn invalid_metadata(message: impl Into<String>) -> Self {
        Self::InvalidMetadata(message.into())
    }

    /// Classification persisted on a failed job.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LayerMissing(_)
            | Self::NoIntersection(_)
            | Self::ReadFailed { .. }
            | Self::InvalidMetadata(_) => ErrorKind::DataUnavailable,
            Self::GridTooLarge { .. } => ErrorKind::Validation,
            Self::NoOverlap(_) => ErrorKind::AlignmentFailure,
            Self::GridMismatch(_)
            | Self::InvalidDomain { .. }
            | Self::Compute(_)
            | Self::ConfigError(_) => ErrorKind::ComputeFailure,
            Self::StorageError(_) => ErrorKind::StorageFailure,
        }
    }

    /// Whether the raster store itself may succeed on a later attempt.
    pub fn is_retryable_read(&self) -> bool {
        matches!(self, Self::ReadFailed { .. })
    }
}

impl From<EngineError> for SuitError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NoOverlap(layer) => SuitError::AlignmentFailure(layer),
            other => SuitError::from_kind(other.kind(), other.to_string()),
        }
    }
}

/// Result type alias for raster engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

//! Common types and utilities shared across the site suitability services.

pub mod analysis;
pub mod aoi;
pub mod bbox;
pub mod crs;
pub mod error;
pub mod grid;
pub mod job;
pub mod layer;
pub mod retry;

pub use analysis::{Comparison, ConstraintSpec, Direction, FactorSpec, JobRequest};
pub use aoi::AreaOfInterest;
pub use bbox::BoundingBox;
pub use crs::CrsCode;
pub use error::{ErrorKind, SuitError, SuitResult};
pub use grid::GridSpec;
pub use job::{
    AnalysisJob, JobError, JobStatus, JobStatusView, PipelineStage, ResultArtifact,
    ResultStatistics, StatusEvent,
};
pub use layer::{Derivation, LayerDescriptor, LayerId, LayerKind};
pub use retry::RetryPolicy;

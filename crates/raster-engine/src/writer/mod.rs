//! Result persistence: tiled Zarr pyramids keyed by job id.

mod memory;
mod zarr_writer;

use async_trait::async_trait;
use uuid::Uuid;

use suit_common::{ResultArtifact, ResultStatistics};

use crate::error::Result;
use crate::types::RasterWindow;

pub use memory::{MemoryArtifactStore, StoredResult};
pub use zarr_writer::ZarrArtifactStore;

/// Store for finished suitability rasters.
///
/// An artifact is visible to `exists` only once every level has been
/// written, so a reader never observes a partial result.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `result` with its overview levels and statistics.
    async fn write(
        &self,
        job_id: Uuid,
        result: &RasterWindow,
        statistics: &ResultStatistics,
    ) -> Result<ResultArtifact>;

    /// Remove every object of a job's artifact. Missing artifacts are not an error.
    async fn delete(&self, job_id: Uuid) -> Result<()>;

    async fn exists(&self, job_id: Uuid) -> Result<bool>;
}

//! Raster engine for weighted-overlay suitability analysis.
//!
//! Layers are stored as chunked Zarr V3 arrays. A job reads only the
//! chunks under its AOI, moves every layer onto one analysis grid, scores
//! and combines the factors, and writes the result as a tiled pyramid.
//!
//! # Architecture
//!
//! ```text
//! AOI + factors + constraints
//!      │
//!      ▼
//! RasterSource::fetch_window(layer, bbox)   (chunk cache, read retries)
//!      │
//!      ▼
//! align_window ──► target grid, per-layer resampling
//!      │
//!      ├─► normalize  (factors, 0-100)
//!      ├─► build_mask (constraints, OR)
//!      │
//!      ▼
//! combine ──► compute_statistics
//!      │
//!      ▼
//! ArtifactStore::write ──► /results/{job_id}/{level}
//! ```
//!
//! All per-cell kernels are synchronous and CPU-bound; callers on an async
//! runtime should run them on a blocking thread.

pub mod align;
pub mod cache;
pub mod config;
pub mod downsample;
pub mod error;
pub mod mask;
pub mod minio_storage;
pub mod normalize;
pub mod overlay;
pub mod resample;
pub mod source;
pub mod stats;
pub mod terrain;
pub mod types;
pub mod writer;

// Re-export commonly used types at crate root
pub use align::{align_all, align_window, aoi_mask, clip_to_aoi, fetch_bbox, target_grid};
pub use cache::{ChunkCache, ChunkKey};
pub use config::{EngineConfig, ZarrCompression};
pub use downsample::{generate_overviews, DownsampleMethod};
pub use error::{EngineError, Result};
pub use mask::{build_mask, ExclusionMask};
pub use minio_storage::{create_filesystem_storage, create_minio_storage, MinioStorage};
pub use normalize::normalize;
pub use overlay::combine;
pub use source::{LayerMetadata, MemoryRasterSource, RasterSource, ZarrRasterSource};
pub use stats::compute_statistics;
pub use terrain::slope_degrees;
pub use types::{CacheStats, RasterWindow, ResamplingMethod, RESULT_NODATA};
pub use writer::{ArtifactStore, MemoryArtifactStore, ZarrArtifactStore};

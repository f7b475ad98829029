//! Zarr V3 writer for suitability result pyramids.
//!
//! An artifact is a group at `/results/{job_id}` holding one array per
//! resolution level (`/results/{job_id}/0` is full resolution). The group
//! metadata is written last and doubles as the completion marker.
//!
//! A write whose caller stops waiting (a job timeout dropping the future)
//! keeps running on its blocking thread. It erases whatever it wrote at its
//! next checkpoint instead of leaving a result behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zarrs::array::codec::bytes_to_bytes::blosc::{
    BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode,
};
use zarrs::array::codec::BytesToBytesCodecTraits;
use zarrs::array::{ArrayBuilder, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::group::GroupBuilder;
use zarrs::storage::{ReadableStorageTraits, StoreKey, StorePrefix, WritableStorageTraits};

use storage::StoragePath;
use suit_common::{ResultArtifact, ResultStatistics};

use super::ArtifactStore;
use crate::config::{EngineConfig, ZarrCompression};
use crate::downsample::generate_overviews;
use crate::error::{EngineError, Result};
use crate::types::{RasterWindow, RESULT_NODATA};

/// Artifact store writing result pyramids into a Zarr store.
pub struct ZarrArtifactStore<S: ?Sized> {
    storage: Arc<S>,
    config: EngineConfig,
}

impl<S> ZarrArtifactStore<S>
where
    S: ReadableStorageTraits + WritableStorageTraits + ?Sized + Send + Sync + 'static,
{
    pub fn new(storage: Arc<S>, config: EngineConfig) -> Self {
        Self { storage, config }
    }
}

#[async_trait]
impl<S> ArtifactStore for ZarrArtifactStore<S>
where
    S: ReadableStorageTraits + WritableStorageTraits + Send + Sync + 'static,
{
    #[instrument(skip(self, result, statistics), fields(width = result.width(), height = result.height()))]
    async fn write(
        &self,
        job_id: Uuid,
        result: &RasterWindow,
        statistics: &ResultStatistics,
    ) -> Result<ResultArtifact> {
        let start = Instant::now();

        let mut levels = vec![result.clone()];
        levels.extend(generate_overviews(
            result,
            self.config.overview_min_dimension,
            self.config.overview_method,
        ));

        let artifact = describe_artifact(job_id, result, levels.len());

        let storage = self.storage.clone();
        let config = self.config.clone();
        let statistics = statistics.clone();
        let written = artifact.clone();
        let guard = AbandonGuard::new();
        let abandoned = guard.flag();
        tokio::task::spawn_blocking(move || {
            write_pyramid(storage, &config, &written, &levels, &statistics, &abandoned)
        })
        .await
        .map_err(|e| EngineError::storage(format!("result write task failed: {}", e)))??;
        guard.disarm();

        info!(
            job_id = %job_id,
            levels = artifact.levels,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Wrote result artifact"
        );
        Ok(artifact)
    }

    async fn delete(&self, job_id: Uuid) -> Result<()> {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || erase_result(&*storage, &job_id))
        .await
        .map_err(|e| EngineError::storage(format!("result delete task failed: {}", e)))??;

        debug!(job_id = %job_id, "Deleted result artifact");
        Ok(())
    }

    async fn exists(&self, job_id: Uuid) -> Result<bool> {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || {
            let key = StoreKey::new(format!("{}/zarr.json", StoragePath::result_prefix(&job_id)))
                .map_err(EngineError::storage)?;
            storage
                .get(&key)
                .map(|bytes| bytes.is_some())
                .map_err(EngineError::storage)
        })
        .await
        .map_err(|e| EngineError::storage(format!("result lookup task failed: {}", e)))?
    }
}

fn describe_artifact(job_id: Uuid, result: &RasterWindow, levels: usize) -> ResultArtifact {
    ResultArtifact {
        job_id,
        location: StoragePath::result_prefix(&job_id),
        crs: result.grid.crs,
        resolution: result.grid.res_x,
        bbox: result.bbox(),
        width: result.width(),
        height: result.height(),
        value_range: result
            .value_range()
            .map(|(lo, hi)| (lo as f64, hi as f64))
            .unwrap_or((0.0, 0.0)),
        nodata: RESULT_NODATA,
        levels,
        created_at: Utc::now(),
    }
}

/// Sets the shared flag when dropped before `disarm`.
struct AbandonGuard {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl AbandonGuard {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            armed: true,
        }
    }

    fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

fn erase_result<S>(storage: &S, job_id: &Uuid) -> Result<()>
where
    S: WritableStorageTraits + ?Sized,
{
    let prefix = StorePrefix::new(format!("{}/", StoragePath::result_prefix(job_id)))
        .map_err(EngineError::storage)?;
    storage.erase_prefix(&prefix).map_err(EngineError::storage)
}

/// Erase the partial result if the writer was abandoned.
///
/// Runs after every store write, so anything written after the flag was
/// raised is removed here; anything before it is removed by the caller's
/// own cleanup.
fn checkpoint<S>(storage: &S, job_id: &Uuid, abandoned: &AtomicBool) -> Result<()>
where
    S: WritableStorageTraits + ?Sized,
{
    if !abandoned.load(Ordering::SeqCst) {
        return Ok(());
    }
    erase_result(storage, job_id)?;
    warn!(job_id = %job_id, "Result write abandoned, partial artifact erased");
    Err(EngineError::storage("result write abandoned"))
}

/// Write every level array, then the group metadata.
fn write_pyramid<S>(
    storage: Arc<S>,
    config: &EngineConfig,
    artifact: &ResultArtifact,
    levels: &[RasterWindow],
    statistics: &ResultStatistics,
    abandoned: &AtomicBool,
) -> Result<()>
where
    S: ReadableStorageTraits + WritableStorageTraits + 'static,
{
    let root = format!("/{}", artifact.location);

    for (level, window) in levels.iter().enumerate() {
        checkpoint(&*storage, &artifact.job_id, abandoned)?;
        let path = format!("/{}", StoragePath::result_level(&artifact.job_id, level));
        write_level(storage.clone(), config, &path, level, window)?;
    }
    checkpoint(&*storage, &artifact.job_id, abandoned)?;

    let mut attrs = serde_json::Map::new();
    attrs.insert(
        "artifact".to_string(),
        serde_json::to_value(artifact).map_err(EngineError::storage)?,
    );
    attrs.insert(
        "statistics".to_string(),
        serde_json::to_value(statistics).map_err(EngineError::storage)?,
    );
    attrs.insert(
        "multiscales".to_string(),
        json!(levels
            .iter()
            .enumerate()
            .map(|(level, w)| json!({
                "path": level.to_string(),
                "resolution": w.grid.res_x,
                "width": w.width(),
                "height": w.height(),
            }))
            .collect::<Vec<_>>()),
    );

    let mut binding = GroupBuilder::new();
    let group = binding
        .attributes(attrs)
        .build(storage.clone(), &root)
        .map_err(EngineError::storage)?;
    group.store_metadata().map_err(EngineError::storage)?;
    checkpoint(&*storage, &artifact.job_id, abandoned)
}

fn write_level<S>(
    storage: Arc<S>,
    config: &EngineConfig,
    path: &str,
    level: usize,
    window: &RasterWindow,
) -> Result<()>
where
    S: ReadableStorageTraits + WritableStorageTraits + 'static,
{
    let (width, height) = (window.width(), window.height());
    let chunk_size = config.zarr_chunk_size.max(1) as u64;
    let bbox = window.bbox();

    let mut attrs = serde_json::Map::new();
    attrs.insert("crs".to_string(), json!(window.grid.crs.to_string()));
    attrs.insert(
        "bbox".to_string(),
        json!([bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y]),
    );
    attrs.insert("resolution".to_string(), json!([window.grid.res_x, window.grid.res_y]));
    attrs.insert("nodata".to_string(), json!(RESULT_NODATA));
    attrs.insert("level".to_string(), json!(level));
    attrs.insert("units".to_string(), json!("score"));

    let chunk_grid: zarrs::array::ChunkGrid = vec![chunk_size, chunk_size]
        .try_into()
        .map_err(|e| EngineError::ConfigError(format!("{:?}", e)))?;

    let mut binding = ArrayBuilder::new(
        vec![height as u64, width as u64],
        DataType::Float32,
        chunk_grid,
        FillValue::from(RESULT_NODATA),
    );
    let mut builder = binding.attributes(attrs);
    if let Some(codec) = compression_codec(config)? {
        builder = builder.bytes_to_bytes_codecs(vec![codec]);
    }

    let array = builder.build(storage, path).map_err(EngineError::storage)?;
    array.store_metadata().map_err(EngineError::storage)?;

    let subset =
        ArraySubset::new_with_start_shape(vec![0, 0], vec![height as u64, width as u64])
            .map_err(EngineError::storage)?;
    array
        .store_array_subset_elements(&subset, &window.to_sentinel(RESULT_NODATA))
        .map_err(EngineError::storage)?;

    debug!(path, level, width, height, "Wrote result level");
    Ok(())
}

/// Blosc codec for the configured compression, if any.
fn compression_codec(config: &EngineConfig) -> Result<Option<Arc<dyn BytesToBytesCodecTraits>>> {
    let compressor = match config.zarr_compression {
        ZarrCompression::None => return Ok(None),
        ZarrCompression::BloscLz4 => BloscCompressor::LZ4,
        ZarrCompression::BloscZstd => BloscCompressor::Zstd,
    };

    let level = BloscCompressionLevel::try_from(config.zarr_compression_level)
        .map_err(|_| EngineError::ConfigError("invalid compression level".to_string()))?;

    // typesize is required when shuffling f32 values
    let (shuffle, typesize) = if config.zarr_shuffle {
        (BloscShuffleMode::Shuffle, Some(4))
    } else {
        (BloscShuffleMode::NoShuffle, None)
    };

    let codec = BloscCodec::new(compressor, level, None, shuffle, typesize)
        .map_err(|e| EngineError::ConfigError(e.to_string()))?;
    Ok(Some(Arc::new(codec)))
}

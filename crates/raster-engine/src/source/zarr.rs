//! Zarr V3 layer source with chunked partial reads.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use zarrs::array::{Array, DataType};
use zarrs::array_subset::ArraySubset;
use zarrs::storage::{ReadableStorageTraits, StoreKey};

use storage::StoragePath;
use suit_common::{BoundingBox, CrsCode, GridSpec, LayerDescriptor, RetryPolicy};

use super::{mask_sentinels, not_stored, window_for_bbox, with_read_retries, PixelWindow};
use super::{RasterSource, WINDOW_MARGIN};
use crate::cache::{hash_path, ChunkCache};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::types::{CacheStats, RasterWindow};

/// Georeferencing and chunk layout of a stored layer array.
///
/// Read from the array's `zarr.json`: the shape and chunk grid, the fill
/// value, and the attributes `bbox` (`[min_x, min_y, max_x, max_y]`, outer
/// cell edges), `crs` (default `EPSG:4326`) and optional `nodata`.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerMetadata {
    pub grid: GridSpec,
    /// Chunk dimensions `(width, height)`.
    pub chunk_shape: (usize, usize),
    pub fill_value: f32,
    pub nodata: Option<f32>,
    pub units: Option<String>,
}

impl LayerMetadata {
    /// Extract metadata from Zarr array attributes.
    pub fn from_array<S: ?Sized>(array: &Array<S>) -> Result<Self> {
        let attrs = array.attributes();
        let shape = array.shape();

        if shape.len() != 2 {
            return Err(EngineError::invalid_metadata(format!(
                "layer arrays must be 2-dimensional, found {} dimensions",
                shape.len()
            )));
        }
        if array.data_type() != &DataType::Float32 {
            return Err(EngineError::invalid_metadata(format!(
                "layer arrays must be float32, found {:?}",
                array.data_type()
            )));
        }

        let origin = vec![0u64; shape.len()];
        let chunk_shape = array
            .chunk_grid()
            .chunk_shape(&origin, shape)
            .map_err(|e| EngineError::invalid_metadata(e.to_string()))?
            .ok_or_else(|| EngineError::invalid_metadata("missing chunk shape"))?;
        let chunk_shape = (chunk_shape[1].get() as usize, chunk_shape[0].get() as usize);

        let bbox = attrs
            .get("bbox")
            .and_then(|v| v.as_array())
            .and_then(|arr| match arr.as_slice() {
                [a, b, c, d] => Some(BoundingBox::new(
                    a.as_f64()?,
                    b.as_f64()?,
                    c.as_f64()?,
                    d.as_f64()?,
                )),
                _ => None,
            })
            .filter(BoundingBox::is_valid)
            .ok_or_else(|| EngineError::invalid_metadata("missing or invalid 'bbox' attribute"))?;

        let crs = match attrs.get("crs").and_then(|v| v.as_str()) {
            Some(code) => {
                CrsCode::parse(code).map_err(|e| EngineError::invalid_metadata(e.to_string()))?
            }
            None => CrsCode::Epsg4326,
        };

        let nodata = attrs
            .get("nodata")
            .and_then(|v| v.as_f64())
            .map(|v| v as f32);

        let units = attrs
            .get("units")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let fill_value = array
            .fill_value()
            .as_ne_bytes()
            .try_into()
            .map(f32::from_ne_bytes)
            .unwrap_or(f32::NAN);

        // Zarr is [rows, cols]
        let (width, height) = (shape[1] as usize, shape[0] as usize);
        let grid = GridSpec::new(
            crs,
            bbox.min_x,
            bbox.max_y,
            bbox.width() / width as f64,
            bbox.height() / height as f64,
            width,
            height,
        );

        Ok(Self {
            grid,
            chunk_shape,
            fill_value,
            nodata,
            units,
        })
    }

    /// Chunks intersecting a pixel window, as `(chunk_x, chunk_y)`.
    pub fn chunks_for_window(&self, window: &PixelWindow) -> Vec<(usize, usize)> {
        let (chunk_w, chunk_h) = self.chunk_shape;
        let min_cx = window.min_col / chunk_w;
        let max_cx = (window.max_col - 1) / chunk_w;
        let min_cy = window.min_row / chunk_h;
        let max_cy = (window.max_row - 1) / chunk_h;

        (min_cy..=max_cy)
            .flat_map(|cy| (min_cx..=max_cx).map(move |cx| (cx, cy)))
            .collect()
    }

    /// Actual extent of a chunk as `(start_col, start_row, width, height)`.
    fn chunk_extent(&self, cx: usize, cy: usize) -> (usize, usize, usize, usize) {
        let (chunk_w, chunk_h) = self.chunk_shape;
        let start_col = cx * chunk_w;
        let start_row = cy * chunk_h;
        let w = chunk_w.min(self.grid.width - start_col);
        let h = chunk_h.min(self.grid.height - start_row);
        (start_col, start_row, w, h)
    }
}

/// Raster source reading layers stored as Zarr V3 arrays.
///
/// Layer `storage_path` `p` lives at array path `/layers/p`. Only the chunks
/// intersecting a requested window are fetched and decoded; decoded chunks
/// are kept in a memory-bounded LRU cache shared by all jobs.
pub struct ZarrRasterSource<S: ?Sized> {
    storage: Arc<S>,
    chunk_cache: Arc<RwLock<ChunkCache>>,
    retry: RetryPolicy,
}

impl<S> ZarrRasterSource<S>
where
    S: ReadableStorageTraits + ?Sized + Send + Sync + 'static,
{
    pub fn new(storage: Arc<S>, config: &EngineConfig) -> Self {
        Self {
            storage,
            chunk_cache: Arc::new(RwLock::new(ChunkCache::new(config.chunk_cache_size_bytes()))),
            retry: config.read_retry_policy(),
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.chunk_cache.read().await.stats()
    }

    /// Open a layer array and read its metadata.
    #[instrument(skip(self))]
    pub async fn layer_metadata(&self, storage_path: &str) -> Result<LayerMetadata> {
        let storage = self.storage.clone();
        let storage_path = storage_path.to_string();
        tokio::task::spawn_blocking(move || {
            let array = open_layer(storage, &storage_path)?;
            LayerMetadata::from_array(&array)
        })
        .await
        .map_err(|e| EngineError::Compute(format!("layer read task failed: {}", e)))?
    }

    async fn read_once(&self, layer: &LayerDescriptor, bbox: BoundingBox) -> Result<RasterWindow> {
        let storage = self.storage.clone();
        let cache = self.chunk_cache.clone();
        let layer_id = layer.id.to_string();
        let storage_path = layer.storage_path.clone();

        tokio::task::spawn_blocking(move || {
            read_window_blocking(storage, &cache, &layer_id, &storage_path, &bbox)
        })
        .await
        .map_err(|e| EngineError::Compute(format!("layer read task failed: {}", e)))?
    }
}

#[async_trait]
impl<S> RasterSource for ZarrRasterSource<S>
where
    S: ReadableStorageTraits + ?Sized + Send + Sync + 'static,
{
    #[instrument(skip(self, layer), fields(layer = %layer.id))]
    async fn fetch_window(
        &self,
        layer: &LayerDescriptor,
        bbox: &BoundingBox,
    ) -> Result<RasterWindow> {
        if !layer.is_stored() {
            return Err(not_stored(layer));
        }

        let start = Instant::now();
        let window =
            with_read_retries(&self.retry, layer.id.as_str(), || self.read_once(layer, *bbox))
                .await?;

        metrics::histogram!("raster_fetch_seconds").record(start.elapsed().as_secs_f64());
        debug!(
            width = window.width(),
            height = window.height(),
            valid = window.valid_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Fetched layer window"
        );
        Ok(window)
    }
}

/// Open the array of a stored layer, telling a missing layer from a broken store.
fn open_layer<S>(storage: Arc<S>, storage_path: &str) -> Result<Array<S>>
where
    S: ReadableStorageTraits + ?Sized + 'static,
{
    let prefix = StoragePath::layer(storage_path);
    let key = StoreKey::new(format!("{}/zarr.json", prefix))
        .map_err(|e| EngineError::invalid_metadata(e.to_string()))?;

    match storage.get(&key) {
        Ok(Some(_)) => {}
        Ok(None) => return Err(EngineError::LayerMissing(storage_path.to_string())),
        Err(e) => return Err(EngineError::read_failed(storage_path, e)),
    }

    Array::open(storage, &format!("/{}", prefix))
        .map_err(|e| EngineError::invalid_metadata(format!("{}: {}", storage_path, e)))
}

/// Read the cells of a layer covering `bbox`, through the chunk cache.
fn read_window_blocking<S>(
    storage: Arc<S>,
    cache: &RwLock<ChunkCache>,
    layer_id: &str,
    storage_path: &str,
    bbox: &BoundingBox,
) -> Result<RasterWindow>
where
    S: ReadableStorageTraits + ?Sized + 'static,
{
    let array = open_layer(storage, storage_path)?;
    let meta = LayerMetadata::from_array(&array)?;

    let window = window_for_bbox(&meta.grid, bbox, WINDOW_MARGIN)
        .ok_or_else(|| EngineError::NoIntersection(layer_id.to_string()))?;

    let path_hash = hash_path(storage_path);
    let mut output = vec![f32::NAN; window.width() * window.height()];

    for (cx, cy) in meta.chunks_for_window(&window) {
        let key = (path_hash, cx, cy);
        let cached = cache.blocking_write().get(&key).cloned();
        let chunk = match cached {
            Some(chunk) => chunk,
            None => {
                let chunk = read_chunk(&array, &meta, cx, cy)
                    .map_err(|e| EngineError::read_failed(layer_id, e))?;
                cache.blocking_write().insert(key, chunk.clone());
                chunk
            }
        };
        copy_chunk_overlap(&meta, &window, cx, cy, &chunk, &mut output);
    }

    mask_sentinels(&mut output, meta.fill_value, meta.nodata);
    Ok(RasterWindow::new(output, window.grid(&meta.grid)))
}

/// Read and decode one chunk (partial at the array edges).
fn read_chunk<S>(
    array: &Array<S>,
    meta: &LayerMetadata,
    cx: usize,
    cy: usize,
) -> std::result::Result<Vec<f32>, String>
where
    S: ReadableStorageTraits + ?Sized + 'static,
{
    let (start_col, start_row, w, h) = meta.chunk_extent(cx, cy);
    let subset = ArraySubset::new_with_start_shape(
        vec![start_row as u64, start_col as u64],
        vec![h as u64, w as u64],
    )
    .map_err(|e| e.to_string())?;

    array
        .retrieve_array_subset_elements::<f32>(&subset)
        .map_err(|e| e.to_string())
}

/// Copy the part of a chunk that falls inside `window` into `output`.
fn copy_chunk_overlap(
    meta: &LayerMetadata,
    window: &PixelWindow,
    cx: usize,
    cy: usize,
    chunk: &[f32],
    output: &mut [f32],
) {
    let (chunk_col, chunk_row, chunk_w, chunk_h) = meta.chunk_extent(cx, cy);

    let col_start = window.min_col.max(chunk_col);
    let col_end = window.max_col.min(chunk_col + chunk_w);
    let row_start = window.min_row.max(chunk_row);
    let row_end = window.max_row.min(chunk_row + chunk_h);
    if col_start >= col_end || row_start >= row_end {
        return;
    }

    let out_width = window.width();
    let span = col_end - col_start;
    for row in row_start..row_end {
        let src = (row - chunk_row) * chunk_w + (col_start - chunk_col);
        let dst = (row - window.min_row) * out_width + (col_start - window.min_col);
        if let (Some(src), Some(dst)) = (chunk.get(src..src + span), output.get_mut(dst..dst + span)) {
            dst.copy_from_slice(src);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(width: usize, height: usize, chunk: usize) -> LayerMetadata {
        LayerMetadata {
            grid: GridSpec::new(CrsCode::Epsg4326, 0.0, height as f64, 1.0, 1.0, width, height),
            chunk_shape: (chunk, chunk),
            fill_value: f32::NAN,
            nodata: None,
            units: None,
        }
    }

    #[test]
    fn test_chunks_for_window() {
        let meta = meta(100, 100, 32);
        let window = PixelWindow {
            min_col: 30,
            min_row: 0,
            max_col: 70,
            max_row: 10,
        };
        // cols 30..70 touch chunks 0, 1 and 2; rows 0..10 only chunk row 0
        assert_eq!(meta.chunks_for_window(&window), vec![(0, 0), (1, 0), (2, 0)]);
    }

    #[test]
    fn test_edge_chunk_extent() {
        let meta = meta(100, 100, 32);
        assert_eq!(meta.chunk_extent(3, 3), (96, 96, 4, 4));
    }

    #[test]
    fn test_copy_chunk_overlap() {
        let meta = meta(4, 4, 2);
        let window = PixelWindow {
            min_col: 1,
            min_row: 1,
            max_col: 3,
            max_row: 3,
        };
        let mut output = vec![f32::NAN; 4];
        // Chunk (0, 0) covers cols 0..2, rows 0..2; only its cell (1, 1) is in the window
        copy_chunk_overlap(&meta, &window, 0, 0, &[1.0, 2.0, 3.0, 4.0], &mut output);
        assert_eq!(output[0], 4.0);
        assert!(output[1].is_nan());
    }
}

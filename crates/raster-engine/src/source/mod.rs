//! Raster Source Accessor: windowed reads of catalog layers.
//!
//! Sources are shared by every job a worker runs and hold no job state.
//! Requested windows are given in geographic coordinates (EPSG:4326) and
//! returned on the layer's native grid, snapped outward to whole cells plus
//! a one-cell margin so edge cells can still be interpolated.

mod memory;
mod zarr;

pub use memory::MemoryRasterSource;
pub use zarr::{LayerMetadata, ZarrRasterSource};

use std::future::Future;

use async_trait::async_trait;
use tracing::warn;

use suit_common::{BoundingBox, CrsCode, GridSpec, LayerDescriptor, RetryPolicy};

use crate::error::{EngineError, Result};
use crate::types::RasterWindow;

/// Extra source cells read around the requested window.
pub const WINDOW_MARGIN: usize = 1;

/// Windowed read access to stored layers.
#[async_trait]
pub trait RasterSource: Send + Sync {
    /// Read the part of `layer` covering `bbox` (EPSG:4326).
    ///
    /// Fails with a `DataUnavailable`-kind error when the layer is missing,
    /// `bbox` lies outside its extent, or the store stays unreachable after
    /// the source's own retries.
    async fn fetch_window(&self, layer: &LayerDescriptor, bbox: &BoundingBox)
        -> Result<RasterWindow>;
}

/// Cell range `[min, max)` of a layer grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub min_col: usize,
    pub min_row: usize,
    pub max_col: usize,
    pub max_row: usize,
}

impl PixelWindow {
    pub fn width(&self) -> usize {
        self.max_col - self.min_col
    }

    pub fn height(&self) -> usize {
        self.max_row - self.min_row
    }

    /// Geotransform of this window within `layer_grid`.
    pub fn grid(&self, layer_grid: &GridSpec) -> GridSpec {
        GridSpec::new(
            layer_grid.crs,
            layer_grid.origin_x + self.min_col as f64 * layer_grid.res_x,
            layer_grid.origin_y - self.min_row as f64 * layer_grid.res_y,
            layer_grid.res_x,
            layer_grid.res_y,
            self.width(),
            self.height(),
        )
    }
}

/// Cells of `layer_grid` needed to cover a geographic `bbox`, plus `margin`.
///
/// Returns `None` when the box does not intersect the layer.
pub fn window_for_bbox(
    layer_grid: &GridSpec,
    bbox: &BoundingBox,
    margin: usize,
) -> Option<PixelWindow> {
    let request = CrsCode::Epsg4326.transform_bbox(layer_grid.crs, bbox);
    let extent = layer_grid.bbox();
    if !extent.intersects(&request) {
        return None;
    }

    let min_col = ((request.min_x - extent.min_x) / layer_grid.res_x).floor();
    let max_col = ((request.max_x - extent.min_x) / layer_grid.res_x).ceil();
    let min_row = ((extent.max_y - request.max_y) / layer_grid.res_y).floor();
    let max_row = ((extent.max_y - request.min_y) / layer_grid.res_y).ceil();

    let clamp = |v: f64, limit: usize| v.max(0.0).min(limit as f64) as usize;
    let window = PixelWindow {
        min_col: clamp(min_col, layer_grid.width).saturating_sub(margin),
        min_row: clamp(min_row, layer_grid.height).saturating_sub(margin),
        max_col: (clamp(max_col, layer_grid.width) + margin).min(layer_grid.width),
        max_row: (clamp(max_row, layer_grid.height) + margin).min(layer_grid.height),
    };

    if window.width() == 0 || window.height() == 0 {
        return None;
    }
    Some(window)
}

/// Run a read, retrying store failures with backoff.
pub(crate) async fn with_read_retries<F, Fut>(
    policy: &RetryPolicy,
    layer: &str,
    mut read: F,
) -> Result<RasterWindow>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RasterWindow>>,
{
    let mut retries = 0;
    loop {
        match read().await {
            Err(e) if e.is_retryable_read() && retries < policy.max_attempts => {
                let delay = policy.calculate_delay(retries);
                warn!(
                    layer = %layer,
                    retry = retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Layer read failed, retrying"
                );
                metrics::counter!("raster_read_retries_total").increment(1);
                tokio::time::sleep(delay).await;
                retries += 1;
            }
            other => return other,
        }
    }
}

/// Translate a source-specific sentinel into `NaN`.
pub(crate) fn mask_sentinels(data: &mut [f32], fill_value: f32, nodata: Option<f32>) {
    for v in data.iter_mut() {
        if (!fill_value.is_nan() && *v == fill_value) || nodata.is_some_and(|n| *v == n) {
            *v = f32::NAN;
        }
    }
}

/// Read failure for a layer whose store path is empty (derived layers).
pub(crate) fn not_stored(layer: &LayerDescriptor) -> EngineError {
    EngineError::LayerMissing(format!("{} (derived layer has no stored data)", layer.id))
}

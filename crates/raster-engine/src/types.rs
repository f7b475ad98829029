//! In-memory raster windows and resampling choices.

use serde::{Deserialize, Serialize};

use suit_common::{BoundingBox, GridSpec, LayerKind};

/// Nodata sentinel written to persisted result rasters.
///
/// Inside the pipeline nodata is carried as `NaN`.
pub const RESULT_NODATA: f32 = -9999.0;

/// A grid of cell values with its geotransform.
///
/// Values are row-major with row 0 at the north edge. Nodata cells are `NaN`;
/// any source-specific sentinel is translated on read.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterWindow {
    pub data: Vec<f32>,
    pub grid: GridSpec,
}

impl RasterWindow {
    pub fn new(data: Vec<f32>, grid: GridSpec) -> Self {
        debug_assert_eq!(data.len(), grid.len());
        Self { data, grid }
    }

    /// A window of the given grid filled with one value.
    pub fn filled(grid: GridSpec, value: f32) -> Self {
        Self {
            data: vec![value; grid.len()],
            grid,
        }
    }

    /// A window of the given grid with every cell nodata.
    pub fn nodata(grid: GridSpec) -> Self {
        Self::filled(grid, f32::NAN)
    }

    pub fn width(&self) -> usize {
        self.grid.width
    }

    pub fn height(&self) -> usize {
        self.grid.height
    }

    pub fn bbox(&self) -> BoundingBox {
        self.grid.bbox()
    }

    /// Value at `(col, row)`, `None` when outside or nodata.
    pub fn get(&self, col: usize, row: usize) -> Option<f32> {
        if col >= self.grid.width || row >= self.grid.height {
            return None;
        }
        let v = self.data[self.grid.flat_index(col, row)];
        if v.is_nan() {
            None
        } else {
            Some(v)
        }
    }

    /// Number of cells holding a value.
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    /// Min and max over valid cells.
    pub fn value_range(&self) -> Option<(f32, f32)> {
        self.data
            .iter()
            .filter(|v| !v.is_nan())
            .fold(None, |acc, &v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    /// Copy with nodata replaced by `sentinel`, for persistence.
    pub fn to_sentinel(&self, sentinel: f32) -> Vec<f32> {
        self.data
            .iter()
            .map(|&v| if v.is_nan() { sentinel } else { v })
            .collect()
    }
}

/// Sampling method used when moving a window onto another grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResamplingMethod {
    /// Nearest neighbor - preserves exact class codes
    Nearest,
    /// Bilinear interpolation
    #[default]
    Bilinear,
    /// Mean of all source cells inside the target cell
    Average,
}

impl ResamplingMethod {
    /// Source cells per target cell above which continuous layers are averaged.
    pub const AVERAGE_THRESHOLD: f64 = 1.5;

    /// Method for a layer given source and target cell sizes (same units).
    pub fn for_layer(kind: LayerKind, source_res: f64, target_res: f64) -> Self {
        match kind {
            LayerKind::Categorical => Self::Nearest,
            LayerKind::Continuous if target_res > source_res * Self::AVERAGE_THRESHOLD => {
                Self::Average
            }
            LayerKind::Continuous => Self::Bilinear,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Bilinear => "bilinear",
            Self::Average => "average",
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub memory_bytes: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use suit_common::CrsCode;

    fn grid(w: usize, h: usize) -> GridSpec {
        GridSpec::new(CrsCode::Epsg4326, 0.0, h as f64, 1.0, 1.0, w, h)
    }

    #[test]
    fn test_get_skips_nodata() {
        let window = RasterWindow::new(vec![1.0, f32::NAN, 3.0, 4.0], grid(2, 2));
        assert_eq!(window.get(0, 0), Some(1.0));
        assert_eq!(window.get(1, 0), None);
        assert_eq!(window.get(2, 0), None);
        assert_eq!(window.valid_count(), 3);
        assert_eq!(window.value_range(), Some((1.0, 4.0)));
    }

    #[test]
    fn test_to_sentinel() {
        let window = RasterWindow::new(vec![f32::NAN, 2.0], grid(2, 1));
        assert_eq!(window.to_sentinel(RESULT_NODATA), vec![RESULT_NODATA, 2.0]);
    }

    #[test]
    fn test_resampling_choice() {
        assert_eq!(
            ResamplingMethod::for_layer(LayerKind::Categorical, 0.001, 0.01),
            ResamplingMethod::Nearest
        );
        assert_eq!(
            ResamplingMethod::for_layer(LayerKind::Continuous, 0.001, 0.01),
            ResamplingMethod::Average
        );
        assert_eq!(
            ResamplingMethod::for_layer(LayerKind::Continuous, 0.04, 0.01),
            ResamplingMethod::Bilinear
        );
    }

    #[test]
    fn test_empty_window_has_no_range() {
        let window = RasterWindow::nodata(grid(3, 3));
        assert_eq!(window.value_range(), None);
        assert_eq!(window.valid_count(), 0);
    }
}

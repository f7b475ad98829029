//! Overview generation for result rasters.
//!
//! Each overview halves the previous level in both dimensions; nodata
//! cells are ignored when reducing a 2x2 block.

use serde::{Deserialize, Serialize};

use suit_common::GridSpec;

use crate::types::RasterWindow;

/// Method used to reduce a 2x2 block into one overview cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownsampleMethod {
    /// Average of the valid cells in the block
    #[default]
    Mean,
    /// Maximum of the valid cells - keeps the best local score visible
    Max,
    /// Top-left value of the block
    Nearest,
}

impl DownsampleMethod {
    /// Parse from string (case-insensitive), defaulting to `Mean`.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "max" => Self::Max,
            "nearest" => Self::Nearest,
            _ => Self::Mean,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Max => "max",
            Self::Nearest => "nearest",
        }
    }
}

/// Downsample a row-major grid by a factor of 2.
///
/// Odd trailing rows/columns are folded into the last block, so every
/// input cell contributes. Returns `(data, new_width, new_height)`.
pub fn downsample_2x(
    data: &[f32],
    width: usize,
    height: usize,
    method: DownsampleMethod,
) -> (Vec<f32>, usize, usize) {
    let new_width = width / 2;
    let new_height = height / 2;

    if new_width == 0 || new_height == 0 {
        return (vec![], 0, 0);
    }

    let mut output = vec![f32::NAN; new_width * new_height];

    for out_y in 0..new_height {
        let row_end = if out_y + 1 == new_height { height } else { out_y * 2 + 2 };
        for out_x in 0..new_width {
            let col_end = if out_x + 1 == new_width { width } else { out_x * 2 + 2 };

            let block = (out_y * 2..row_end)
                .flat_map(|y| (out_x * 2..col_end).map(move |x| y * width + x))
                .filter_map(|idx| data.get(idx).copied());

            output[out_y * new_width + out_x] = match method {
                DownsampleMethod::Mean => mean_ignoring_nan(block),
                DownsampleMethod::Max => max_ignoring_nan(block),
                DownsampleMethod::Nearest => data
                    .get(out_y * 2 * width + out_x * 2)
                    .copied()
                    .unwrap_or(f32::NAN),
            };
        }
    }

    (output, new_width, new_height)
}

#[inline]
fn mean_ignoring_nan(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, count) = values
        .filter(|v| !v.is_nan())
        .fold((0.0f64, 0usize), |(s, c), v| (s + v as f64, c + 1));
    if count == 0 {
        f32::NAN
    } else {
        (sum / count as f64) as f32
    }
}

#[inline]
fn max_ignoring_nan(values: impl Iterator<Item = f32>) -> f32 {
    values
        .filter(|v| !v.is_nan())
        .fold(None, |acc: Option<f32>, v| Some(acc.map_or(v, |m| m.max(v))))
        .unwrap_or(f32::NAN)
}

/// Build the overview levels of a window, coarsest last.
///
/// Level `n` has cell size `2^n` times the source. Generation stops when
/// the smaller dimension of the next level would fall below `min_dimension`.
/// The full-resolution window itself is not included.
pub fn generate_overviews(
    window: &RasterWindow,
    min_dimension: usize,
    method: DownsampleMethod,
) -> Vec<RasterWindow> {
    let mut levels = Vec::new();
    let mut current = window.data.clone();
    let mut grid = window.grid;

    loop {
        let next_width = grid.width / 2;
        let next_height = grid.height / 2;
        if next_width == 0 || next_height == 0 || next_width.min(next_height) < min_dimension {
            break;
        }

        let (data, width, height) = downsample_2x(&current, grid.width, grid.height, method);
        let next_grid = GridSpec::new(
            grid.crs,
            grid.origin_x,
            grid.origin_y,
            grid.res_x * grid.width as f64 / width as f64,
            grid.res_y * grid.height as f64 / height as f64,
            width,
            height,
        );

        levels.push(RasterWindow::new(data.clone(), next_grid));
        current = data;
        grid = next_grid;
    }

    levels
}

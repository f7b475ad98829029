//! Point and area sampling kernels.
//!
//! Pixel coordinates put cell centers on whole numbers (see
//! `GridSpec::world_to_pixel`), so `(0.0, 0.0)` is the center of the
//! north-west cell. Positions more than half a cell outside the grid
//! sample as nodata.

use suit_common::BoundingBox;

use crate::types::RasterWindow;

fn inside(window: &RasterWindow, x: f64, y: f64) -> bool {
    x >= -0.5 && y >= -0.5 && x < window.width() as f64 - 0.5 && y < window.height() as f64 - 0.5
}

/// Value of the cell containing the pixel position.
pub fn nearest(window: &RasterWindow, x: f64, y: f64) -> f32 {
    if !inside(window, x, y) {
        return f32::NAN;
    }
    let col = (x.round().max(0.0) as usize).min(window.width() - 1);
    let row = (y.round().max(0.0) as usize).min(window.height() - 1);
    window.data[window.grid.flat_index(col, row)]
}

/// Bilinear interpolation between the four surrounding cell centers.
///
/// Nodata at any of the four corners yields nodata. Within the outer
/// half-cell the position is clamped to the edge centers.
pub fn bilinear(window: &RasterWindow, x: f64, y: f64) -> f32 {
    if !inside(window, x, y) {
        return f32::NAN;
    }
    let width = window.width();
    let height = window.height();

    let x = x.clamp(0.0, (width - 1) as f64);
    let y = y.clamp(0.0, (height - 1) as f64);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let xf = (x - x0 as f64) as f32;
    let yf = (y - y0 as f64) as f32;

    let data = &window.data;
    let v00 = data[y0 * width + x0];
    let v10 = data[y0 * width + x1];
    let v01 = data[y1 * width + x0];
    let v11 = data[y1 * width + x1];

    if v00.is_nan() || v10.is_nan() || v01.is_nan() || v11.is_nan() {
        return f32::NAN;
    }

    let top = v00 * (1.0 - xf) + v10 * xf;
    let bottom = v01 * (1.0 - xf) + v11 * xf;
    top * (1.0 - yf) + bottom * yf
}

/// Mean of the valid cells whose centers fall inside `footprint`.
///
/// `footprint` is in the window's CRS. Falls back to bilinear sampling at
/// the footprint center when no cell center lies inside it.
pub fn area_average(window: &RasterWindow, footprint: &BoundingBox) -> f32 {
    let grid = &window.grid;
    let (px0, py0) = grid.world_to_pixel(footprint.min_x, footprint.max_y);
    let (px1, py1) = grid.world_to_pixel(footprint.max_x, footprint.min_y);

    let col_start = px0.ceil().max(0.0) as usize;
    let col_end = (px1.ceil().max(0.0) as usize).min(grid.width);
    let row_start = py0.ceil().max(0.0) as usize;
    let row_end = (py1.ceil().max(0.0) as usize).min(grid.height);

    if col_start >= col_end || row_start >= row_end {
        let (cx, cy) = footprint.center();
        let (x, y) = grid.world_to_pixel(cx, cy);
        return bilinear(window, x, y);
    }

    let mut sum = 0.0f64;
    let mut count = 0usize;
    for row in row_start..row_end {
        for &v in &window.data[row * grid.width + col_start..row * grid.width + col_end] {
            if !v.is_nan() {
                sum += v as f64;
                count += 1;
            }
        }
    }

    if count == 0 {
        f32::NAN
    } else {
        (sum / count as f64) as f32
    }
}

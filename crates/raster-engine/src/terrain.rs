//! Terrain derivatives computed from elevation windows.

use rayon::prelude::*;

use crate::types::RasterWindow;

/// Slope in degrees from an elevation window in meters.
///
/// Uses central differences in the interior and one-sided differences on
/// the window edges, with the per-row ground cell size. A cell is nodata
/// when it or any neighbor used for its gradient is nodata.
pub fn slope_degrees(dem: &RasterWindow) -> RasterWindow {
    let grid = dem.grid;
    let (width, height) = (grid.width, grid.height);
    let mut out = vec![f32::NAN; grid.len()];

    out.par_chunks_mut(width.max(1))
        .enumerate()
        .for_each(|(row, cells)| {
            let (dx, dy) = grid.cell_size_m(row);
            for (col, cell) in cells.iter_mut().enumerate() {
                let z = |c: usize, r: usize| dem.data[r * width + c] as f64;

                let dzdx = gradient(col, width, dx, |c| z(c, row));
                // Rows run north to south, so flip the sign to get a northward gradient
                let dzdy = gradient(row, height, dy, |r| z(col, r)).map(|g| -g);

                if let (Some(gx), Some(gy)) = (dzdx, dzdy) {
                    if !z(col, row).is_nan() {
                        *cell = (gx.hypot(gy)).atan().to_degrees() as f32;
                    }
                }
            }
        });

    RasterWindow::new(out, grid)
}

/// Finite difference along one axis at index `i` of `n` cells spaced `spacing` apart.
fn gradient(i: usize, n: usize, spacing: f64, z: impl Fn(usize) -> f64) -> Option<f64> {
    if n < 2 || spacing <= 0.0 {
        return Some(0.0);
    }
    let (lo, hi) = if i == 0 {
        (0, 1)
    } else if i == n - 1 {
        (n - 2, n - 1)
    } else {
        (i - 1, i + 1)
    };
    let (a, b) = (z(lo), z(hi));
    if a.is_nan() || b.is_nan() {
        return None;
    }
    Some((b - a) / ((hi - lo) as f64 * spacing))
}

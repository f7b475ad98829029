//! North-up raster grid definitions.

use crate::{BoundingBox, CrsCode};
use serde::{Deserialize, Serialize};

/// Mean meters per degree of latitude.
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Specification of a regular north-up grid (an affine geotransform without rotation).
///
/// Row 0 is the northernmost row; cell `(col, row)` covers
/// `[origin_x + col*res_x, origin_x + (col+1)*res_x]` horizontally and
/// `[origin_y - (row+1)*res_y, origin_y - row*res_y]` vertically.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    /// Coordinate reference of `origin_*` and `res_*`.
    pub crs: CrsCode,
    /// West edge of column 0.
    pub origin_x: f64,
    /// North edge of row 0.
    pub origin_y: f64,
    /// Cell width (always positive).
    pub res_x: f64,
    /// Cell height (always positive).
    pub res_y: f64,
    /// Number of columns.
    pub width: usize,
    /// Number of rows.
    pub height: usize,
}

impl GridSpec {
    /// Create a new grid specification.
    pub fn new(
        crs: CrsCode,
        origin_x: f64,
        origin_y: f64,
        res_x: f64,
        res_y: f64,
        width: usize,
        height: usize,
    ) -> Self {
        Self {
            crs,
            origin_x,
            origin_y,
            res_x,
            res_y,
            width,
            height,
        }
    }

    /// Grid covering `bbox` at `resolution`, snapped outward to whole cells.
    ///
    /// Always at least one cell wide and tall. Extents within a millionth
    /// of a cell of a whole number of cells are not rounded up.
    pub fn covering(bbox: &BoundingBox, resolution: f64, crs: CrsCode) -> Self {
        let cells = |extent: f64| (((extent / resolution) - 1e-6).ceil() as usize).max(1);
        let width = cells(bbox.width());
        let height = cells(bbox.height());
        Self::new(
            crs,
            bbox.min_x,
            bbox.max_y,
            resolution,
            resolution,
            width,
            height,
        )
    }

    /// Calculate the bounding box of this grid.
    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::new(
            self.origin_x,
            self.origin_y - self.height as f64 * self.res_y,
            self.origin_x + self.width as f64 * self.res_x,
            self.origin_y,
        )
    }

    /// World coordinates of the center of cell `(col, row)`.
    pub fn cell_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.res_x,
            self.origin_y - (row as f64 + 0.5) * self.res_y,
        )
    }

    /// Fractional pixel position of a world coordinate.
    ///
    /// Cell centers map to whole numbers, so the result can be fed
    /// directly into nearest/bilinear sampling.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.res_x - 0.5,
            (self.origin_y - y) / self.res_y - 0.5,
        )
    }

    /// Cell containing a world coordinate, if inside the grid.
    pub fn cell_at(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.origin_x) / self.res_x).floor();
        let row = ((self.origin_y - y) / self.res_y).floor();
        if col < 0.0 || row < 0.0 || col >= self.width as f64 || row >= self.height as f64 {
            return None;
        }
        Some((col as usize, row as usize))
    }

    /// Get the 1D array index for a 2D grid position (row-major).
    pub fn flat_index(&self, col: usize, row: usize) -> usize {
        row * self.width + col
    }

    /// Total number of cells.
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    /// Check if grid is empty.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether two grids describe the same cells, within a relative tolerance.
    pub fn same_grid(&self, other: &GridSpec) -> bool {
        let tol_x = self.res_x.abs() * 1e-6;
        let tol_y = self.res_y.abs() * 1e-6;
        self.crs == other.crs
            && self.width == other.width
            && self.height == other.height
            && (self.origin_x - other.origin_x).abs() <= tol_x
            && (self.origin_y - other.origin_y).abs() <= tol_y
            && (self.res_x - other.res_x).abs() <= tol_x
            && (self.res_y - other.res_y).abs() <= tol_y
    }

    /// Approximate ground size of one cell in meters `(dx, dy)` at a given row.
    pub fn cell_size_m(&self, row: usize) -> (f64, f64) {
        match self.crs {
            CrsCode::Epsg4326 => {
                let (_, lat) = self.cell_center(0, row);
                let dx = self.res_x * METERS_PER_DEGREE * lat.to_radians().cos().abs();
                let dy = self.res_y * METERS_PER_DEGREE;
                (dx, dy)
            }
            CrsCode::Epsg3857 => {
                // Mercator stretches distances by 1/cos(lat).
                let (_, y) = self.cell_center(0, row);
                let (_, lat) = self.crs.to_geographic(0.0, y);
                let scale = lat.to_radians().cos().abs();
                (self.res_x * scale, self.res_y * scale)
            }
        }
    }

    /// Approximate ground area of one cell in square kilometers at a given row.
    pub fn cell_area_km2(&self, row: usize) -> f64 {
        let (dx, dy) = self.cell_size_m(row);
        dx * dy / 1.0e6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_10x10() -> GridSpec {
        GridSpec::new(CrsCode::Epsg4326, 0.0, 10.0, 1.0, 1.0, 10, 10)
    }

    #[test]
    fn test_bbox() {
        let bbox = grid_10x10().bbox();
        assert_eq!(bbox, BoundingBox::new(0.0, 0.0, 10.0, 10.0));
    }

    #[test]
    fn test_cell_center_and_pixel_roundtrip() {
        let grid = grid_10x10();
        let (x, y) = grid.cell_center(3, 7);
        assert!((x - 3.5).abs() < 1e-12);
        assert!((y - 2.5).abs() < 1e-12);

        let (px, py) = grid.world_to_pixel(x, y);
        assert!((px - 3.0).abs() < 1e-12);
        assert!((py - 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_cell_at_bounds() {
        let grid = grid_10x10();
        assert_eq!(grid.cell_at(0.1, 9.9), Some((0, 0)));
        assert_eq!(grid.cell_at(9.9, 0.1), Some((9, 9)));
        assert_eq!(grid.cell_at(-0.1, 5.0), None);
        assert_eq!(grid.cell_at(5.0, 10.1), None);
    }

    #[test]
    fn test_covering_snaps_outward() {
        let grid = GridSpec::covering(&BoundingBox::new(0.0, 0.0, 1.05, 0.5), 0.1, CrsCode::Epsg4326);
        assert_eq!(grid.width, 11);
        assert_eq!(grid.height, 5);
    }

    #[test]
    fn test_same_grid_tolerance() {
        let a = grid_10x10();
        let mut b = a;
        b.origin_x += 1e-9;
        assert!(a.same_grid(&b));
        b.width = 11;
        assert!(!a.same_grid(&b));
    }

    #[test]
    fn test_cell_area_at_equator() {
        let grid = GridSpec::new(CrsCode::Epsg4326, 0.0, 0.005, 0.01, 0.01, 1, 1);
        let area = grid.cell_area_km2(0);
        // ~1.113 km x 1.113 km
        assert!((area - 1.239).abs() < 0.01);
    }
}

//! Alignment & Resampling: moving source windows onto one analysis grid.

use rayon::prelude::*;
use tracing::{debug, warn};

use suit_common::{AreaOfInterest, BoundingBox, CrsCode, GridSpec, LayerDescriptor};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::resample;
use crate::types::{RasterWindow, ResamplingMethod};

/// Analysis grid covering the AOI bounding box at the configured resolution.
///
/// Fails with `GridTooLarge` when the grid would exceed `max_grid_cells`,
/// which a thin polygon with a small area but a wide extent can do.
pub fn target_grid(aoi: &AreaOfInterest, config: &EngineConfig) -> Result<GridSpec> {
    let bbox = aoi
        .bbox()
        .ok_or_else(|| EngineError::Compute("AOI has no extent".to_string()))?;
    let bbox = CrsCode::Epsg4326.transform_bbox(config.output_crs, &bbox);
    let grid = GridSpec::covering(&bbox, config.output_resolution, config.output_crs);

    let cells = (grid.width as u64).saturating_mul(grid.height as u64);
    if cells > config.max_grid_cells as u64 {
        return Err(EngineError::GridTooLarge {
            cells,
            limit: config.max_grid_cells as u64,
        });
    }
    Ok(grid)
}

/// Geographic bounding box to request from sources for a target grid.
///
/// Padded by one target cell so resampling at the grid edge has support.
pub fn fetch_bbox(target: &GridSpec) -> BoundingBox {
    let padded = target.bbox().expand(target.res_x.max(target.res_y));
    target.crs.transform_bbox(CrsCode::Epsg4326, &padded)
}

/// Which target cells have their center inside the AOI polygon.
pub fn aoi_mask(aoi: &AreaOfInterest, target: &GridSpec) -> Vec<bool> {
    let mut inside = vec![false; target.len()];
    inside
        .par_chunks_mut(target.width.max(1))
        .enumerate()
        .for_each(|(row, cells)| {
            for (col, cell) in cells.iter_mut().enumerate() {
                let (x, y) = target.cell_center(col, row);
                let (lon, lat) = target.crs.to_geographic(x, y);
                *cell = aoi.contains(lon, lat);
            }
        });
    inside
}

/// Set every cell outside the AOI polygon to nodata.
pub fn clip_to_aoi(window: &mut RasterWindow, inside: &[bool]) {
    for (v, &keep) in window.data.iter_mut().zip(inside) {
        if !keep {
            *v = f32::NAN;
        }
    }
}

/// Resample one source window onto `target`.
///
/// Categorical layers use nearest neighbor; continuous layers use bilinear
/// interpolation, or an area average when the source is much finer than the
/// target. Target cells outside the source extent are nodata. Fails with
/// `NoOverlap` if the source and target do not overlap at all.
pub fn align_window(
    layer: &LayerDescriptor,
    window: &RasterWindow,
    target: &GridSpec,
) -> Result<RasterWindow> {
    if window.grid.same_grid(target) {
        return Ok(window.clone());
    }

    let source_grid = window.grid;
    let source_extent = source_grid.crs.transform_bbox(target.crs, &source_grid.bbox());
    if window.grid.is_empty() || !source_extent.intersects(&target.bbox()) {
        return Err(EngineError::NoOverlap(layer.id.to_string()));
    }

    let source_bbox = source_grid.bbox();
    let source_res = source_extent.width() / source_grid.width as f64;
    let method = ResamplingMethod::for_layer(layer.kind, source_res, target.res_x);

    let mut data = vec![f32::NAN; target.len()];
    let covered: usize = data
        .par_chunks_mut(target.width.max(1))
        .enumerate()
        .map(|(row, out)| {
            let mut covered = 0;
            for (col, cell) in out.iter_mut().enumerate() {
                let (tx, ty) = target.cell_center(col, row);
                let (sx, sy) = target.crs.transform_point(source_grid.crs, tx, ty);
                if !source_bbox.contains_point(sx, sy) {
                    continue;
                }
                covered += 1;

                let (px, py) = source_grid.world_to_pixel(sx, sy);
                *cell = match method {
                    ResamplingMethod::Nearest => resample::nearest(window, px, py),
                    ResamplingMethod::Bilinear => resample::bilinear(window, px, py),
                    ResamplingMethod::Average => {
                        let footprint = cell_footprint(target, col, row);
                        let footprint = target.crs.transform_bbox(source_grid.crs, &footprint);
                        resample::area_average(window, &footprint)
                    }
                };
            }
            covered
        })
        .sum();

    if covered == 0 {
        return Err(EngineError::NoOverlap(layer.id.to_string()));
    }

    let fraction = covered as f64 / target.len() as f64;
    if covered < target.len() {
        warn!(
            layer = %layer.id,
            covered_fraction = fraction,
            "AOI extends beyond layer extent; uncovered cells are nodata"
        );
    }
    debug!(
        layer = %layer.id,
        method = method.as_str(),
        source_width = source_grid.width,
        source_height = source_grid.height,
        "Aligned layer window"
    );

    Ok(RasterWindow::new(data, *target))
}

/// Align several windows onto one grid, failing on the first layer with no overlap.
pub fn align_all(
    inputs: &[(&LayerDescriptor, &RasterWindow)],
    target: &GridSpec,
) -> Result<Vec<RasterWindow>> {
    inputs
        .iter()
        .map(|(layer, window)| align_window(layer, window, target))
        .collect()
}

fn cell_footprint(grid: &GridSpec, col: usize, row: usize) -> BoundingBox {
    let min_x = grid.origin_x + col as f64 * grid.res_x;
    let max_y = grid.origin_y - row as f64 * grid.res_y;
    BoundingBox::new(min_x, max_y - grid.res_y, min_x + grid.res_x, max_y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::LayerCatalog;
    use suit_common::{LayerId, LayerKind};
    use uuid::Uuid;

    fn layer(id: &str) -> LayerDescriptor {
        LayerCatalog::default_catalog()
            .require(&LayerId::new(id))
            .unwrap()
            .clone()
    }

    fn target() -> GridSpec {
        // 10x10 cells of 0.01 degrees
        GridSpec::new(CrsCode::Epsg4326, 10.0, 20.1, 0.01, 0.01, 10, 10)
    }

    #[test]
    fn test_target_grid_from_aoi() {
        let aoi = AreaOfInterest::from_bbox(Uuid::new_v4(), &BoundingBox::new(10.0, 20.0, 10.1, 20.1));
        let config = EngineConfig {
            output_resolution: 0.01,
            ..Default::default()
        };
        let grid = target_grid(&aoi, &config).unwrap();
        assert_eq!((grid.width, grid.height), (10, 10));
        assert_eq!(grid.origin_x, 10.0);
        assert_eq!(grid.origin_y, 20.1);
    }

    #[test]
    fn test_wide_extent_exceeds_grid_limit() {
        let aoi = AreaOfInterest::from_bbox(Uuid::new_v4(), &BoundingBox::new(10.0, 20.0, 11.0, 21.0));
        let config = EngineConfig {
            output_resolution: 0.01,
            max_grid_cells: 5_000,
            ..Default::default()
        };
        let err = target_grid(&aoi, &config).unwrap_err();
        assert!(matches!(err, EngineError::GridTooLarge { cells: 10_000, limit: 5_000 }));
        assert_eq!(err.kind(), suit_common::ErrorKind::Validation);
    }

    #[test]
    fn test_constant_layer_stays_constant() {
        // Coarse source: 0.04 degree cells around the target
        let source = RasterWindow::filled(
            GridSpec::new(CrsCode::Epsg4326, 9.92, 20.2, 0.04, 0.04, 8, 8),
            1800.0,
        );
        let aligned = align_window(&layer("ghi"), &source, &target()).unwrap();
        assert!(aligned.grid.same_grid(&target()));
        assert!(aligned.data.iter().all(|&v| (v - 1800.0).abs() < 1e-3));
    }

    #[test]
    fn test_fine_source_is_averaged() {
        // 0.005 degree source, alternating columns 0 and 10
        let grid = GridSpec::new(CrsCode::Epsg4326, 10.0, 20.1, 0.005, 0.005, 20, 20);
        let data = (0..400).map(|i| if i % 2 == 0 { 0.0 } else { 10.0 }).collect();
        let source = RasterWindow::new(data, grid);

        let aligned = align_window(&layer("dem"), &source, &target()).unwrap();
        assert!(aligned.data.iter().all(|&v| (v - 5.0).abs() < 1e-4));
    }

    #[test]
    fn test_categorical_uses_nearest() {
        let grid = GridSpec::new(CrsCode::Epsg4326, 10.0, 20.1, 0.005, 0.005, 20, 20);
        let data = (0..400).map(|i| if i % 2 == 0 { 10.0 } else { 50.0 }).collect();
        let source = RasterWindow::new(data, grid);

        let lulc = layer("lulc");
        assert_eq!(lulc.kind, LayerKind::Categorical);
        let aligned = align_window(&lulc, &source, &target()).unwrap();
        assert!(aligned.data.iter().all(|&v| v == 10.0 || v == 50.0));
    }

    #[test]
    fn test_disjoint_source_fails_alignment() {
        let source = RasterWindow::filled(
            GridSpec::new(CrsCode::Epsg4326, 50.0, 60.0, 0.01, 0.01, 10, 10),
            1.0,
        );
        let err = align_window(&layer("ghi"), &source, &target()).unwrap_err();
        assert!(matches!(err, EngineError::NoOverlap(ref id) if id == "ghi"));
    }

    #[test]
    fn test_align_all_stops_at_first_disjoint_layer() {
        let ghi = layer("ghi");
        let dem = layer("dem");
        let covering = RasterWindow::filled(
            GridSpec::new(CrsCode::Epsg4326, 9.9, 20.2, 0.01, 0.01, 30, 30),
            3.0,
        );
        let elsewhere = RasterWindow::filled(
            GridSpec::new(CrsCode::Epsg4326, 50.0, 60.0, 0.01, 0.01, 10, 10),
            3.0,
        );

        let aligned = align_all(&[(&ghi, &covering), (&dem, &covering)], &target()).unwrap();
        assert_eq!(aligned.len(), 2);
        assert!(aligned.iter().all(|w| w.grid.same_grid(&target())));

        let err = align_all(&[(&ghi, &covering), (&dem, &elsewhere)], &target()).unwrap_err();
        assert!(matches!(err, EngineError::NoOverlap(ref id) if id == "dem"));
    }

    #[test]
    fn test_partial_extent_fills_nodata() {
        // Source covers only the western half of the target
        let source = RasterWindow::filled(
            GridSpec::new(CrsCode::Epsg4326, 9.9, 20.2, 0.01, 0.01, 15, 30),
            7.0,
        );
        let aligned = align_window(&layer("distance_to_grid"), &source, &target()).unwrap();
        let row: Vec<f32> = aligned.data[..10].to_vec();
        assert!(row[..5].iter().all(|&v| (v - 7.0).abs() < 1e-4));
        assert!(row[5..].iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_mercator_target() {
        let aoi = AreaOfInterest::from_bbox(Uuid::new_v4(), &BoundingBox::new(10.0, 20.0, 10.1, 20.1));
        let config = EngineConfig {
            output_crs: CrsCode::Epsg3857,
            output_resolution: 1000.0,
            ..Default::default()
        };
        let grid = target_grid(&aoi, &config).unwrap();
        assert_eq!(grid.crs, CrsCode::Epsg3857);

        let source = RasterWindow::filled(
            GridSpec::new(CrsCode::Epsg4326, 9.5, 20.5, 0.05, 0.05, 30, 30),
            3.0,
        );
        let aligned = align_window(&layer("ghi"), &source, &grid).unwrap();
        assert!(aligned.data.iter().all(|&v| (v - 3.0).abs() < 1e-4));
    }

    #[test]
    fn test_aoi_mask_and_clip() {
        // South-west quarter of the target grid
        let aoi = AreaOfInterest::from_bbox(
            Uuid::new_v4(),
            &BoundingBox::new(10.0, 20.0, 10.05, 20.05),
        );
        let inside = aoi_mask(&aoi, &target());
        assert_eq!(inside.iter().filter(|&&v| v).count(), 25);
        assert!(inside[target().flat_index(0, 9)]);
        assert!(!inside[target().flat_index(9, 0)]);

        let mut window = RasterWindow::filled(target(), 1.0);
        clip_to_aoi(&mut window, &inside);
        assert_eq!(window.valid_count(), 25);
    }

    #[test]
    fn test_fetch_bbox_pads_one_cell() {
        let bbox = fetch_bbox(&target());
        assert!((bbox.min_x - 9.99).abs() < 1e-9);
        assert!((bbox.max_y - 20.11).abs() < 1e-9);
    }
}

//! Summary statistics over a suitability result.

use suit_common::ResultStatistics;

use crate::mask::ExclusionMask;
use crate::types::RasterWindow;

/// Compute statistics over the cells inside the AOI.
///
/// `inside` marks cells whose center lies in the AOI polygon; cells outside
/// it are ignored entirely. Inside cells are counted as excluded when the
/// mask excludes them, valid when they carry a score, and nodata otherwise.
/// Standard deviation is the population deviation of valid scores.
pub fn compute_statistics(
    result: &RasterWindow,
    mask: &ExclusionMask,
    inside: &[bool],
    suitable_threshold: f64,
) -> ResultStatistics {
    let grid = result.grid;
    let mut stats = ResultStatistics {
        suitable_threshold,
        ..Default::default()
    };

    let mut sum = 0.0f64;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;

    for row in 0..grid.height {
        let cell_area = grid.cell_area_km2(row);
        for col in 0..grid.width {
            let idx = grid.flat_index(col, row);
            if !inside.get(idx).copied().unwrap_or(false) {
                continue;
            }
            stats.total_cells += 1;
            stats.total_area_km2 += cell_area;

            if mask.is_excluded(idx) {
                stats.excluded_cells += 1;
                stats.excluded_area_km2 += cell_area;
                continue;
            }

            let v = result.data[idx];
            if v.is_nan() {
                stats.nodata_cells += 1;
                continue;
            }

            let v = v as f64;
            stats.valid_cells += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
            if v >= suitable_threshold {
                stats.suitable_area_km2 += cell_area;
            }
        }
    }

    if stats.total_cells > 0 {
        stats.cell_area_km2 = stats.total_area_km2 / stats.total_cells as f64;
    }

    if stats.valid_cells > 0 {
        let n = stats.valid_cells as f64;
        let mean = sum / n;
        let variance = result
            .data
            .iter()
            .enumerate()
            .filter(|(i, v)| {
                !v.is_nan() && inside.get(*i).copied().unwrap_or(false) && !mask.is_excluded(*i)
            })
            .map(|(_, &v)| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / n;

        stats.mean = Some(mean);
        stats.min = Some(min);
        stats.max = Some(max);
        stats.std_dev = Some(variance.sqrt());
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use suit_common::{Comparison, CrsCode, GridSpec};

    fn grid() -> GridSpec {
        GridSpec::new(CrsCode::Epsg4326, 10.0, 20.1, 0.01, 0.01, 10, 10)
    }

    #[test]
    fn test_uniform_result() {
        let result = RasterWindow::filled(grid(), 80.0);
        let stats = compute_statistics(&result, &ExclusionMask::empty(grid()), &[true; 100], 50.0);

        assert_eq!(stats.total_cells, 100);
        assert_eq!(stats.valid_cells, 100);
        assert_eq!(stats.excluded_cells, 0);
        assert_eq!(stats.mean, Some(80.0));
        assert_eq!(stats.min, Some(80.0));
        assert_eq!(stats.max, Some(80.0));
        assert_eq!(stats.std_dev, Some(0.0));
        assert!((stats.suitable_area_km2 - stats.total_area_km2).abs() < 1e-9);
        // ~1.1 km cells at 20 degrees north
        assert!(stats.cell_area_km2 > 1.0 && stats.cell_area_km2 < 1.3);
    }

    #[test]
    fn test_fully_excluded_result() {
        let raw_slope = RasterWindow::filled(grid(), 20.0);
        let mask = ExclusionMask::from_rule(&raw_slope, &Comparison::Gt(15.0));
        let result = RasterWindow::nodata(grid());
        let stats = compute_statistics(&result, &mask, &[true; 100], 50.0);

        assert_eq!(stats.valid_cells, 0);
        assert_eq!(stats.excluded_cells, 100);
        assert_eq!(stats.excluded_percent(), 100.0);
        assert!((stats.excluded_area_km2 - stats.total_area_km2).abs() < 1e-9);
        assert_eq!(stats.mean, None);
        assert_eq!(stats.std_dev, None);
    }

    #[test]
    fn test_cells_outside_aoi_ignored() {
        let mut inside = vec![true; 100];
        inside[..50].iter_mut().for_each(|c| *c = false);
        let mut result = RasterWindow::filled(grid(), 40.0);
        result.data[60] = f32::NAN;
        result.data[70] = 60.0;

        let stats = compute_statistics(&result, &ExclusionMask::empty(grid()), &inside, 50.0);
        assert_eq!(stats.total_cells, 50);
        assert_eq!(stats.valid_cells, 49);
        assert_eq!(stats.nodata_cells, 1);
        assert_eq!(stats.max, Some(60.0));
        assert!(stats.suitable_area_km2 > 0.0 && stats.suitable_area_km2 < stats.cell_area_km2 * 1.5);
    }

    #[test]
    fn test_std_dev() {
        let data = (0..100).map(|i| if i % 2 == 0 { 40.0 } else { 60.0 }).collect();
        let result = RasterWindow::new(data, grid());
        let stats = compute_statistics(&result, &ExclusionMask::empty(grid()), &[true; 100], 50.0);
        assert_eq!(stats.mean, Some(50.0));
        assert!((stats.std_dev.unwrap() - 10.0).abs() < 1e-9);
    }
}

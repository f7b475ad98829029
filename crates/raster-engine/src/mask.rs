//! Constraint Mask Builder.

use suit_common::{Comparison, GridSpec};

use crate::error::{EngineError, Result};
use crate::types::RasterWindow;

/// Binary exclusion layer on an analysis grid (`true` = excluded).
#[derive(Debug, Clone, PartialEq)]
pub struct ExclusionMask {
    excluded: Vec<bool>,
    grid: GridSpec,
}

impl ExclusionMask {
    /// Mask that excludes nothing.
    pub fn empty(grid: GridSpec) -> Self {
        Self {
            excluded: vec![false; grid.len()],
            grid,
        }
    }

    /// Exclude every cell whose value satisfies `comparison`.
    ///
    /// A nodata cell cannot be evaluated and is never excluded by the rule.
    pub fn from_rule(window: &RasterWindow, comparison: &Comparison) -> Self {
        let excluded = window
            .data
            .iter()
            .map(|&v| !v.is_nan() && comparison.matches(v as f64))
            .collect();
        Self {
            excluded,
            grid: window.grid,
        }
    }

    /// Logical OR with another mask on the same grid.
    pub fn union(&mut self, other: &ExclusionMask) -> Result<()> {
        if !self.grid.same_grid(&other.grid) {
            return Err(EngineError::GridMismatch(
                "constraint masks are on different grids".to_string(),
            ));
        }
        for (a, &b) in self.excluded.iter_mut().zip(&other.excluded) {
            *a |= b;
        }
        Ok(())
    }

    pub fn is_excluded(&self, index: usize) -> bool {
        self.excluded.get(index).copied().unwrap_or(false)
    }

    pub fn excluded_count(&self) -> usize {
        self.excluded.iter().filter(|&&e| e).count()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.excluded
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }
}

/// Combine per-constraint exclusions with OR.
///
/// Every rule window must already be aligned to `grid`. No rules gives a
/// mask that excludes nothing.
pub fn build_mask(rules: &[(&RasterWindow, &Comparison)], grid: &GridSpec) -> Result<ExclusionMask> {
    let mut mask = ExclusionMask::empty(*grid);
    for (window, comparison) in rules {
        if !window.grid.same_grid(grid) {
            return Err(EngineError::GridMismatch(format!(
                "constraint window {}x{} is not aligned to the {}x{} analysis grid",
                window.width(),
                window.height(),
                grid.width,
                grid.height
            )));
        }
        mask.union(&ExclusionMask::from_rule(window, comparison))?;
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use suit_common::CrsCode;

    fn grid() -> GridSpec {
        GridSpec::new(CrsCode::Epsg4326, 0.0, 2.0, 1.0, 1.0, 2, 2)
    }

    #[test]
    fn test_no_constraints_excludes_nothing() {
        let mask = build_mask(&[], &grid()).unwrap();
        assert_eq!(mask.excluded_count(), 0);
        assert_eq!(mask.as_slice().len(), 4);
    }

    #[test]
    fn test_union_of_rules() {
        let slope = RasterWindow::new(vec![5.0, 20.0, 5.0, 20.0], grid());
        let lulc = RasterWindow::new(vec![50.0, 50.0, 80.0, 10.0], grid());
        let slope_rule = Comparison::Gt(15.0);
        let lulc_rule = Comparison::InSet(vec![80.0, 90.0]);

        let mask = build_mask(&[(&slope, &slope_rule), (&lulc, &lulc_rule)], &grid()).unwrap();
        assert_eq!(mask.as_slice(), &[false, true, true, true]);

        // The combined mask is the union of the individual masks
        let mut expected = ExclusionMask::from_rule(&slope, &slope_rule);
        expected.union(&ExclusionMask::from_rule(&lulc, &lulc_rule)).unwrap();
        assert_eq!(mask, expected);
    }

    #[test]
    fn test_nodata_never_excludes() {
        let window = RasterWindow::new(vec![f32::NAN, 1.0, 2.0, 3.0], grid());
        let mask = ExclusionMask::from_rule(&window, &Comparison::Lt(100.0));
        assert_eq!(mask.as_slice(), &[false, true, true, true]);
    }

    #[test]
    fn test_misaligned_rule_rejected() {
        let other = GridSpec::new(CrsCode::Epsg4326, 0.0, 3.0, 1.0, 1.0, 3, 3);
        let window = RasterWindow::filled(other, 1.0);
        let rule = Comparison::Eq(1.0);
        assert!(matches!(
            build_mask(&[(&window, &rule)], &grid()),
            Err(EngineError::GridMismatch(_))
        ));
    }
}

//! Weighted Overlay Combiner.

use rayon::prelude::*;

use crate::error::{EngineError, Result};
use crate::mask::ExclusionMask;
use crate::types::RasterWindow;

/// Per-cell weighted sum of normalized factors, `Σ factor_i × weight_i / Σ weight`.
///
/// Weights are percentages; they are rescaled by their actual sum so a
/// total within tolerance of 100 still yields scores in 0..=100. Excluded cells, and cells where any factor is
/// nodata, are nodata in the result. All windows and the mask must share
/// one grid.
pub fn combine(
    factors: &[RasterWindow],
    weights: &[f64],
    mask: &ExclusionMask,
) -> Result<RasterWindow> {
    if factors.is_empty() {
        return Err(EngineError::Compute("no factors to combine".to_string()));
    }
    if factors.len() != weights.len() {
        return Err(EngineError::Compute(format!(
            "{} factors but {} weights",
            factors.len(),
            weights.len()
        )));
    }

    let grid = *mask.grid();
    if let Some(bad) = factors.iter().position(|f| !f.grid.same_grid(&grid)) {
        return Err(EngineError::GridMismatch(format!(
            "factor {} is not on the analysis grid",
            bad
        )));
    }

    let total: f64 = weights.iter().sum();
    if !total.is_finite() || total <= 0.0 {
        return Err(EngineError::Compute(format!("invalid weight total {}", total)));
    }
    let fractions: Vec<f64> = weights.iter().map(|w| w / total).collect();
    let data = (0..grid.len())
        .into_par_iter()
        .map(|i| {
            if mask.is_excluded(i) {
                return f32::NAN;
            }
            let mut sum = 0.0f64;
            for (factor, fraction) in factors.iter().zip(&fractions) {
                let v = factor.data[i];
                if v.is_nan() {
                    return f32::NAN;
                }
                sum += v as f64 * fraction;
            }
            sum as f32
        })
        .collect();

    Ok(RasterWindow::new(data, grid))
}

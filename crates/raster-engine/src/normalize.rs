//! Normalizer: rescale factor windows to a common 0-100 score.

use rayon::prelude::*;

use suit_common::Direction;

use crate::error::{EngineError, Result};
use crate::types::RasterWindow;

/// Upper bound of normalized scores.
pub const SCORE_MAX: f64 = 100.0;

/// Linearly rescale `window` from `[domain_min, domain_max]` into `[0, 100]`.
///
/// Values are clipped to the domain first. For `LowerIsBetter` the score is
/// inverted (`100 - scaled`), so higher always means more suitable.
/// Nodata cells stay nodata.
pub fn normalize(
    window: &RasterWindow,
    direction: Direction,
    domain_min: f64,
    domain_max: f64,
) -> Result<RasterWindow> {
    if !(domain_min.is_finite() && domain_max.is_finite()) || domain_min >= domain_max {
        return Err(EngineError::InvalidDomain {
            min: domain_min,
            max: domain_max,
        });
    }

    let span = domain_max - domain_min;
    let data = window
        .data
        .par_iter()
        .map(|&v| {
            if v.is_nan() {
                return f32::NAN;
            }
            let scaled = (v as f64).clamp(domain_min, domain_max) - domain_min;
            let score = scaled / span * SCORE_MAX;
            match direction {
                Direction::HigherIsBetter => score as f32,
                Direction::LowerIsBetter => (SCORE_MAX - score) as f32,
            }
        })
        .collect();

    Ok(RasterWindow::new(data, window.grid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use suit_common::{CrsCode, GridSpec};

    fn window(values: &[f32]) -> RasterWindow {
        let grid = GridSpec::new(CrsCode::Epsg4326, 0.0, 1.0, 1.0, 1.0, values.len(), 1);
        RasterWindow::new(values.to_vec(), grid)
    }

    #[test]
    fn test_higher_is_better() {
        let out = normalize(
            &window(&[1000.0, 1750.0, 2500.0]),
            Direction::HigherIsBetter,
            1000.0,
            2500.0,
        )
        .unwrap();
        assert_eq!(out.data, vec![0.0, 50.0, 100.0]);
    }

    #[test]
    fn test_lower_is_better_inverts() {
        let out = normalize(&window(&[0.0, 2.0, 10.0]), Direction::LowerIsBetter, 0.0, 10.0).unwrap();
        assert_eq!(out.data, vec![100.0, 80.0, 0.0]);
    }

    #[test]
    fn test_values_clipped_to_domain() {
        let out = normalize(
            &window(&[-50.0, 20000.0]),
            Direction::HigherIsBetter,
            0.0,
            10000.0,
        )
        .unwrap();
        assert_eq!(out.data, vec![0.0, 100.0]);
    }

    #[test]
    fn test_nodata_passes_through() {
        let out = normalize(&window(&[f32::NAN, 5.0]), Direction::HigherIsBetter, 0.0, 10.0).unwrap();
        assert!(out.data[0].is_nan());
        assert_eq!(out.data[1], 50.0);
    }

    #[test]
    fn test_identity_on_score_domain() {
        let scores = window(&[0.0, 12.5, 80.0, 100.0]);
        let once = normalize(&scores, Direction::HigherIsBetter, 0.0, 100.0).unwrap();
        let twice = normalize(&once, Direction::HigherIsBetter, 0.0, 100.0).unwrap();
        assert_eq!(once.data, scores.data);
        assert_eq!(twice.data, scores.data);
    }

    #[test]
    fn test_degenerate_domain_rejected() {
        let err = normalize(&window(&[1.0]), Direction::HigherIsBetter, 5.0, 5.0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidDomain { .. }));
    }
}

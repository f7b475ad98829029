//! Area of interest polygons.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BoundingBox, SuitError, SuitResult};

/// Mean meters per degree of latitude.
const METERS_PER_DEGREE: f64 = 111_320.0;

/// A user-drawn polygon in WGS84 lon/lat.
///
/// The first ring is the exterior, any further rings are holes.
/// Rings may be given open or closed. The AOI is immutable once a job
/// references it; edits create a new AOI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaOfInterest {
    pub id: Uuid,
    pub project_id: Uuid,
    pub rings: Vec<Vec<(f64, f64)>>,
}

impl AreaOfInterest {
    pub fn new(project_id: Uuid, rings: Vec<Vec<(f64, f64)>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            rings,
        }
    }

    /// Axis-aligned rectangle as a single-ring AOI.
    pub fn from_bbox(project_id: Uuid, bbox: &BoundingBox) -> Self {
        Self::new(
            project_id,
            vec![vec![
                (bbox.min_x, bbox.min_y),
                (bbox.max_x, bbox.min_y),
                (bbox.max_x, bbox.max_y),
                (bbox.min_x, bbox.max_y),
            ]],
        )
    }

    pub fn exterior(&self) -> &[(f64, f64)] {
        self.rings.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Check that the exterior ring has at least 3 distinct vertices and finite coordinates.
    pub fn validate(&self) -> SuitResult<()> {
        let exterior = self.exterior();
        if exterior
            .iter()
            .any(|(x, y)| !x.is_finite() || !y.is_finite())
        {
            return Err(SuitError::Validation(
                "AOI contains non-finite coordinates".into(),
            ));
        }

        let mut distinct: Vec<(f64, f64)> = Vec::with_capacity(exterior.len());
        for &p in exterior {
            if !distinct.contains(&p) {
                distinct.push(p);
            }
        }
        if distinct.len() < 3 {
            return Err(SuitError::Validation(format!(
                "AOI ring is degenerate ({} distinct vertices)",
                distinct.len()
            )));
        }
        if self.area_km2() <= 0.0 {
            return Err(SuitError::Validation("AOI has zero area".into()));
        }
        Ok(())
    }

    /// Bounding box of the exterior ring.
    pub fn bbox(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(self.exterior().iter().copied())
    }

    /// Approximate planar area in square kilometers.
    ///
    /// Uses the shoelace formula on an equirectangular projection scaled at
    /// the ring's mean latitude. Holes are subtracted.
    pub fn area_km2(&self) -> f64 {
        let exterior = self.exterior();
        if exterior.is_empty() {
            return 0.0;
        }
        let mean_lat = exterior.iter().map(|p| p.1).sum::<f64>() / exterior.len() as f64;
        let kx = METERS_PER_DEGREE * mean_lat.to_radians().cos();
        let ky = METERS_PER_DEGREE;

        let mut area_m2 = 0.0;
        for (i, ring) in self.rings.iter().enumerate() {
            let a = ring_area_deg2(ring).abs() * kx * ky;
            if i == 0 {
                area_m2 += a;
            } else {
                area_m2 -= a;
            }
        }
        area_m2.max(0.0) / 1.0e6
    }

    /// Even-odd point-in-polygon test over all rings.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.rings
            .iter()
            .filter(|ring| ring_contains(ring, x, y))
            .count()
            % 2
            == 1
    }
}

fn ring_area_deg2(ring: &[(f64, f64)]) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..n {
        let (x1, y1) = ring[i];
        let (x2, y2) = ring[(i + 1) % n];
        sum += x1 * y2 - x2 * y1;
    }
    sum / 2.0
}

fn ring_contains(ring: &[(f64, f64)], x: f64, y: f64) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

//! Coordinate Reference System types and point transforms.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::BoundingBox;

/// Web Mercator half-extent in meters.
const MERCATOR_MAX_EXTENT: f64 = 20037508.342789244;
/// WGS84 semi-major axis used by Web Mercator.
const EARTH_RADIUS_M: f64 = 6378137.0;
/// Latitude limit of the Web Mercator square.
const MERCATOR_MAX_LAT: f64 = 85.051_128_779_806_59;

/// CRS codes the raster pipeline can read and align between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CrsCode {
    /// WGS84 Geographic (lon/lat in degrees)
    #[default]
    Epsg4326,
    /// Web Mercator (meters)
    Epsg3857,
}

impl CrsCode {
    /// Parse a CRS string such as "EPSG:4326", "epsg:3857" or "CRS:84".
    pub fn parse(s: &str) -> Result<Self, CrsParseError> {
        match s.trim().to_uppercase().as_str() {
            "EPSG:4326" | "CRS:84" => Ok(CrsCode::Epsg4326),
            "EPSG:3857" | "EPSG:900913" => Ok(CrsCode::Epsg3857),
            _ => Err(CrsParseError::UnsupportedCrs(s.to_string())),
        }
    }

    /// Check if this is a geographic (lat/lon) CRS.
    pub fn is_geographic(&self) -> bool {
        matches!(self, CrsCode::Epsg4326)
    }

    /// Convert a point in this CRS to WGS84 lon/lat.
    pub fn to_geographic(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            CrsCode::Epsg4326 => (x, y),
            CrsCode::Epsg3857 => {
                let lon = (x / EARTH_RADIUS_M).to_degrees();
                let lat = (2.0 * (y / EARTH_RADIUS_M).exp().atan() - std::f64::consts::FRAC_PI_2)
                    .to_degrees();
                (lon, lat)
            }
        }
    }

    /// Convert a WGS84 lon/lat point into this CRS.
    pub fn from_geographic(&self, lon: f64, lat: f64) -> (f64, f64) {
        match self {
            CrsCode::Epsg4326 => (lon, lat),
            CrsCode::Epsg3857 => {
                let lat = lat.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT);
                let x = EARTH_RADIUS_M * lon.to_radians();
                let y = EARTH_RADIUS_M
                    * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
                (x, y)
            }
        }
    }

    /// Transform a point from this CRS into `target`.
    pub fn transform_point(&self, target: CrsCode, x: f64, y: f64) -> (f64, f64) {
        if *self == target {
            return (x, y);
        }
        let (lon, lat) = self.to_geographic(x, y);
        target.from_geographic(lon, lat)
    }

    /// Transform a bounding box into `target` by projecting its corners and edge midpoints.
    pub fn transform_bbox(&self, target: CrsCode, bbox: &BoundingBox) -> BoundingBox {
        if *self == target {
            return *bbox;
        }
        let (cx, cy) = bbox.center();
        let samples = [
            (bbox.min_x, bbox.min_y),
            (bbox.min_x, bbox.max_y),
            (bbox.max_x, bbox.min_y),
            (bbox.max_x, bbox.max_y),
            (cx, bbox.min_y),
            (cx, bbox.max_y),
            (bbox.min_x, cy),
            (bbox.max_x, cy),
        ];
        BoundingBox::from_points(samples.iter().map(|&(x, y)| self.transform_point(target, x, y)))
            .unwrap_or(*bbox)
    }

    /// Get the valid bounds for this CRS.
    pub fn valid_bounds(&self) -> BoundingBox {
        match self {
            CrsCode::Epsg4326 => BoundingBox::new(-180.0, -90.0, 180.0, 90.0),
            CrsCode::Epsg3857 => BoundingBox::new(
                -MERCATOR_MAX_EXTENT,
                -MERCATOR_MAX_EXTENT,
                MERCATOR_MAX_EXTENT,
                MERCATOR_MAX_EXTENT,
            ),
        }
    }
}

impl fmt::Display for CrsCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            CrsCode::Epsg4326 => "EPSG:4326",
            CrsCode::Epsg3857 => "EPSG:3857",
        };
        write!(f, "{}", code)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CrsParseError {
    #[error("Unsupported CRS: {0}")]
    UnsupportedCrs(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_crs() {
        assert_eq!(CrsCode::parse("EPSG:4326").unwrap(), CrsCode::Epsg4326);
        assert_eq!(CrsCode::parse("epsg:3857").unwrap(), CrsCode::Epsg3857);
        assert_eq!(CrsCode::parse("CRS:84").unwrap(), CrsCode::Epsg4326);
        assert!(CrsCode::parse("EPSG:99999").is_err());
    }

    #[test]
    fn test_mercator_roundtrip() {
        let (x, y) = CrsCode::Epsg3857.from_geographic(13.4, 52.5);
        let (lon, lat) = CrsCode::Epsg3857.to_geographic(x, y);
        assert!((lon - 13.4).abs() < 1e-9);
        assert!((lat - 52.5).abs() < 1e-9);
    }

    #[test]
    fn test_mercator_origin_and_extent() {
        let (x, y) = CrsCode::Epsg3857.from_geographic(0.0, 0.0);
        assert!(x.abs() < 1e-6 && y.abs() < 1e-6);

        let (x, _) = CrsCode::Epsg3857.from_geographic(180.0, 0.0);
        assert!((x - MERCATOR_MAX_EXTENT).abs() < 1e-3);
    }

    #[test]
    fn test_transform_bbox_identity() {
        let bbox = BoundingBox::new(-10.0, -5.0, 10.0, 5.0);
        assert_eq!(CrsCode::Epsg4326.transform_bbox(CrsCode::Epsg4326, &bbox), bbox);
    }
}

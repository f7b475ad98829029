//! Layer catalog entries for the global raster sources.

use serde::{Deserialize, Serialize};

/// Unique identifier for a layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(pub String);

impl LayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How cell values should be treated when resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Physical quantity (irradiance, elevation, distance); interpolated.
    #[default]
    Continuous,
    /// Class codes (land cover); never interpolated.
    Categorical,
}

/// A layer computed from another catalog layer instead of being read directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Derivation {
    /// Terrain slope in degrees from an elevation layer.
    SlopeDegrees { source: LayerId },
}

impl Derivation {
    /// Layer that has to be fetched to compute this one.
    pub fn source(&self) -> &LayerId {
        match self {
            Derivation::SlopeDegrees { source } => source,
        }
    }
}

/// Static catalog entry describing one global raster layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// Unique layer identifier
    pub id: LayerId,

    /// Human-readable name
    pub name: String,

    /// Zarr array path inside the raster bucket
    #[serde(default)]
    pub storage_path: String,

    /// Physical unit of cell values
    pub unit: String,

    /// Native cell size in degrees
    pub native_resolution: f64,

    /// Expected value domain `(min, max)`, used as default normalization bounds
    pub value_range: (f64, f64),

    /// Direction flag applied when a factor does not specify one
    #[serde(default = "default_true")]
    pub higher_is_better: bool,

    #[serde(default)]
    pub kind: LayerKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation: Option<Derivation>,
}

fn default_true() -> bool {
    true
}

impl LayerDescriptor {
    /// Whether this layer is read directly from storage.
    pub fn is_stored(&self) -> bool {
        self.derivation.is_none()
    }
}

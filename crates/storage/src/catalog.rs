//! Static layer catalog loaded from YAML.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use suit_common::{
    Derivation, LayerDescriptor, LayerId, LayerKind, SuitError, SuitResult,
};

/// On-disk shape of the catalog file.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    layers: Vec<LayerDescriptor>,
}

/// Read-only registry of every layer a job may reference.
#[derive(Debug, Clone, Default)]
pub struct LayerCatalog {
    layers: BTreeMap<LayerId, LayerDescriptor>,
}

impl LayerCatalog {
    /// Build a catalog from descriptors, checking derivation sources.
    pub fn new(layers: Vec<LayerDescriptor>) -> SuitResult<Self> {
        let mut map = BTreeMap::new();
        for layer in layers {
            if map.contains_key(&layer.id) {
                return Err(SuitError::Validation(format!(
                    "duplicate layer id '{}' in catalog",
                    layer.id
                )));
            }
            map.insert(layer.id.clone(), layer);
        }

        let catalog = Self { layers: map };
        catalog.check_derivations()?;
        Ok(catalog)
    }

    /// Parse a catalog from YAML text.
    pub fn from_yaml_str(yaml: &str) -> SuitResult<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml)
            .map_err(|e| SuitError::Validation(format!("Invalid layer catalog: {}", e)))?;
        Self::new(file.layers)
    }

    /// Load a catalog from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> SuitResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SuitError::Validation(format!("Failed to read catalog {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_yaml_str(&text)?;
        info!(path = %path.display(), layers = catalog.len(), "Loaded layer catalog");
        Ok(catalog)
    }

    /// Serialize the catalog back to YAML.
    pub fn to_yaml(&self) -> SuitResult<String> {
        let file = CatalogFile {
            layers: self.layers.values().cloned().collect(),
        };
        serde_yaml::to_string(&file)
            .map_err(|e| SuitError::InternalError(format!("Catalog serialization failed: {}", e)))
    }

    pub fn get(&self, id: &LayerId) -> Option<&LayerDescriptor> {
        self.layers.get(id)
    }

    /// Look up a layer, failing with a validation error when absent.
    pub fn require(&self, id: &LayerId) -> SuitResult<&LayerDescriptor> {
        self.get(id)
            .ok_or_else(|| SuitError::LayerNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &LayerId) -> bool {
        self.layers.contains_key(id)
    }

    /// The layer that has to be read from storage to produce `id`.
    pub fn stored_source(&self, id: &LayerId) -> SuitResult<&LayerDescriptor> {
        let layer = self.require(id)?;
        match &layer.derivation {
            None => Ok(layer),
            Some(derivation) => self.require(derivation.source()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerDescriptor> {
        self.layers.values()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn check_derivations(&self) -> SuitResult<()> {
        for layer in self.layers.values() {
            let Some(derivation) = &layer.derivation else {
                continue;
            };
            let source = self.get(derivation.source()).ok_or_else(|| {
                SuitError::Validation(format!(
                    "layer '{}' is derived from unknown layer '{}'",
                    layer.id,
                    derivation.source()
                ))
            })?;
            if !source.is_stored() {
                return Err(SuitError::Validation(format!(
                    "layer '{}' is derived from derived layer '{}'",
                    layer.id, source.id
                )));
            }
        }
        Ok(())
    }

    /// The global data lake layers.
    pub fn default_catalog() -> Self {
        fn stored(
            id: &str,
            name: &str,
            path: &str,
            unit: &str,
            resolution: f64,
            range: (f64, f64),
            higher_is_better: bool,
            kind: LayerKind,
        ) -> LayerDescriptor {
            LayerDescriptor {
                id: LayerId::new(id),
                name: name.to_string(),
                storage_path: path.to_string(),
                unit: unit.to_string(),
                native_resolution: resolution,
                value_range: range,
                higher_is_better,
                kind,
                derivation: None,
            }
        }

        let mut layers = vec![
            stored(
                "ghi",
                "Global Horizontal Irradiance",
                "solar/ghi",
                "kWh/m2/yr",
                0.04,
                (1000.0, 2500.0),
                true,
                LayerKind::Continuous,
            ),
            stored(
                "dni",
                "Direct Normal Irradiance",
                "solar/dni",
                "kWh/m2/yr",
                0.04,
                (1000.0, 3000.0),
                true,
                LayerKind::Continuous,
            ),
            stored(
                "dem",
                "Elevation",
                "terrain/dem",
                "m",
                0.000833,
                (-500.0, 9000.0),
                false,
                LayerKind::Continuous,
            ),
            stored(
                "distance_to_grid",
                "Distance to Transmission Grid",
                "infrastructure/distance_to_grid",
                "m",
                0.0025,
                (0.0, 10000.0),
                false,
                LayerKind::Continuous,
            ),
            stored(
                "distance_to_roads",
                "Distance to Roads",
                "infrastructure/distance_to_roads",
                "m",
                0.0025,
                (0.0, 5000.0),
                false,
                LayerKind::Continuous,
            ),
            stored(
                "lulc",
                "Land Cover",
                "landcover/lulc",
                "class",
                0.000833,
                (10.0, 100.0),
                true,
                LayerKind::Categorical,
            ),
        ];
        layers.push(LayerDescriptor {
            id: LayerId::new("slope"),
            name: "Terrain Slope".to_string(),
            storage_path: String::new(),
            unit: "degrees".to_string(),
            native_resolution: 0.000833,
            value_range: (0.0, 10.0),
            higher_is_better: false,
            kind: LayerKind::Continuous,
            derivation: Some(Derivation::SlopeDegrees {
                source: LayerId::new("dem"),
            }),
        });

        Self {
            layers: layers.into_iter().map(|l| (l.id.clone(), l)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG_YAML: &str = r#"
layers:
  - id: ghi
    name: Global Horizontal Irradiance
    storage_path: solar/ghi
    unit: kWh/m2/yr
    native_resolution: 0.04
    value_range: [1000.0, 2500.0]
  - id: dem
    name: Elevation
    storage_path: terrain/dem
    unit: m
    native_resolution: 0.000833
    value_range: [-500.0, 9000.0]
    higher_is_better: false
  - id: slope
    name: Terrain Slope
    unit: degrees
    native_resolution: 0.000833
    value_range: [0.0, 10.0]
    higher_is_better: false
    derivation:
      type: slope_degrees
      source: dem
  - id: lulc
    name: Land Cover
    storage_path: landcover/lulc
    unit: class
    native_resolution: 0.000833
    value_range: [10.0, 100.0]
    kind: categorical
"#;

    #[test]
    fn test_parse_yaml_catalog() {
        let catalog = LayerCatalog::from_yaml_str(CATALOG_YAML).unwrap();
        assert_eq!(catalog.len(), 4);

        let slope = catalog.require(&LayerId::new("slope")).unwrap();
        assert!(!slope.higher_is_better);
        assert_eq!(
            catalog.stored_source(&LayerId::new("slope")).unwrap().id,
            LayerId::new("dem")
        );
        assert_eq!(
            catalog.get(&LayerId::new("lulc")).unwrap().kind,
            LayerKind::Categorical
        );
    }

    #[test]
    fn test_unknown_derivation_source_rejected() {
        let yaml = r#"
layers:
  - id: slope
    name: Terrain Slope
    unit: degrees
    native_resolution: 0.001
    value_range: [0.0, 10.0]
    derivation:
      type: slope_degrees
      source: dem
"#;
        assert!(matches!(
            LayerCatalog::from_yaml_str(yaml),
            Err(SuitError::Validation(_))
        ));
    }

    #[test]
    fn test_missing_layer() {
        let catalog = LayerCatalog::default_catalog();
        assert!(matches!(
            catalog.require(&LayerId::new("aspect")),
            Err(SuitError::LayerNotFound(_))
        ));
    }

    #[test]
    fn test_default_catalog_roundtrips_through_yaml() {
        let catalog = LayerCatalog::default_catalog();
        assert_eq!(catalog.len(), 7);
        let yaml = catalog.to_yaml().unwrap();
        let parsed = LayerCatalog::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed.len(), 7);
        assert_eq!(
            parsed.get(&LayerId::new("ghi")),
            catalog.get(&LayerId::new("ghi"))
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layers.yaml");
        std::fs::write(&path, CATALOG_YAML).unwrap();
        let catalog = LayerCatalog::load(&path).unwrap();
        assert!(catalog.contains(&LayerId::new("ghi")));
    }
}

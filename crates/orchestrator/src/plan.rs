//! Resolution of a job request against the layer catalog.

use std::sync::Arc;

use raster_engine::{aoi_mask, fetch_bbox, target_grid, EngineConfig};
use storage::LayerCatalog;
use suit_common::{
    BoundingBox, Comparison, Direction, GridSpec, JobRequest, LayerDescriptor, LayerId,
    SuitError, SuitResult,
};
use uuid::Uuid;

/// A factor with its catalog defaults filled in.
#[derive(Debug, Clone)]
pub struct FactorPlan {
    pub layer: LayerDescriptor,
    pub weight: f64,
    pub direction: Direction,
    /// Normalization bounds
    pub domain: (f64, f64),
}

#[derive(Debug, Clone)]
pub struct ConstraintPlan {
    pub layer: LayerDescriptor,
    pub comparison: Comparison,
}

/// A referenced layer and the stored layer read to produce it.
///
/// For stored layers both are the same descriptor.
#[derive(Debug, Clone)]
pub struct LayerPlan {
    pub layer: LayerDescriptor,
    pub source: LayerDescriptor,
}

/// Everything a pipeline run needs besides the collaborators.
#[derive(Debug, Clone)]
pub struct AnalysisPlan {
    pub job_id: Uuid,
    pub target: GridSpec,
    /// Target cells whose center lies inside the AOI polygon
    pub inside: Arc<Vec<bool>>,
    /// Geographic window requested from the raster source
    pub fetch_bbox: BoundingBox,
    pub layers: Vec<LayerPlan>,
    pub factors: Vec<FactorPlan>,
    pub constraints: Vec<ConstraintPlan>,
    pub suitable_threshold: f64,
}

impl AnalysisPlan {
    pub fn build(
        request: &JobRequest,
        catalog: &LayerCatalog,
        engine: &EngineConfig,
    ) -> SuitResult<Self> {
        let layers = request
            .referenced_layers()
            .iter()
            .map(|id| {
                Ok(LayerPlan {
                    layer: require(catalog, id)?.clone(),
                    source: catalog.stored_source(id)?.clone(),
                })
            })
            .collect::<SuitResult<Vec<_>>>()?;

        let factors = request
            .factors
            .iter()
            .map(|f| {
                let layer = require(catalog, &f.layer)?.clone();
                let direction = f
                    .direction
                    .unwrap_or_else(|| Direction::from_higher_is_better(layer.higher_is_better));
                let domain = f.domain.unwrap_or(layer.value_range);
                Ok(FactorPlan {
                    layer,
                    weight: f.weight,
                    direction,
                    domain,
                })
            })
            .collect::<SuitResult<Vec<_>>>()?;

        let constraints = request
            .constraints
            .iter()
            .map(|c| {
                Ok(ConstraintPlan {
                    layer: require(catalog, &c.layer)?.clone(),
                    comparison: c.comparison.clone(),
                })
            })
            .collect::<SuitResult<Vec<_>>>()?;

        let target = target_grid(&request.aoi, engine)?;
        let inside = aoi_mask(&request.aoi, &target);

        Ok(Self {
            job_id: request.job_id,
            fetch_bbox: fetch_bbox(&target),
            target,
            inside: Arc::new(inside),
            layers,
            factors,
            constraints,
            suitable_threshold: engine.suitable_threshold,
        })
    }

    /// Distinct stored layers to fetch, in first-use order.
    pub fn sources(&self) -> Vec<&LayerDescriptor> {
        let mut sources: Vec<&LayerDescriptor> = Vec::new();
        for plan in &self.layers {
            if !sources.iter().any(|s| s.id == plan.source.id) {
                sources.push(&plan.source);
            }
        }
        sources
    }

    pub fn weights(&self) -> Vec<f64> {
        self.factors.iter().map(|f| f.weight).collect()
    }
}

fn require<'a>(catalog: &'a LayerCatalog, id: &LayerId) -> SuitResult<&'a LayerDescriptor> {
    catalog
        .require(id)
        .map_err(|_| SuitError::Validation(format!("unknown layer '{}'", id)))
}

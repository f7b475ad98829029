//! The analysis pipeline as an explicit state machine.
//!
//! Each state owns the inputs of its stage, so a failed stage can be
//! retried from the same state without redoing earlier work.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::debug;

use raster_engine::{
    align_all, build_mask, clip_to_aoi, combine, compute_statistics, normalize,
    slope_degrees, ArtifactStore, ExclusionMask, RasterSource, RasterWindow,
};
use suit_common::{
    Derivation, LayerId, PipelineStage, ResultArtifact, ResultStatistics, SuitError,
    SuitResult,
};

use crate::plan::AnalysisPlan;

type Windows = Arc<HashMap<LayerId, RasterWindow>>;

/// Where a pipeline run stands.
#[derive(Debug, Clone)]
pub enum PipelineState {
    Fetching,
    /// Raw windows keyed by stored source layer
    Aligning { raw: Windows },
    /// Windows on the target grid keyed by referenced layer
    Normalizing { aligned: Windows },
    Masking {
        aligned: Windows,
        scores: Arc<Vec<RasterWindow>>,
    },
    Combining {
        scores: Arc<Vec<RasterWindow>>,
        mask: Arc<ExclusionMask>,
    },
    Writing {
        result: Arc<RasterWindow>,
        statistics: ResultStatistics,
    },
    Done {
        artifact: ResultArtifact,
        statistics: ResultStatistics,
    },
}

impl PipelineState {
    pub fn start() -> Self {
        PipelineState::Fetching
    }

    /// Stage this state runs next, `None` once done.
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            PipelineState::Fetching => Some(PipelineStage::Fetching),
            PipelineState::Aligning { .. } => Some(PipelineStage::Aligning),
            PipelineState::Normalizing { .. } => Some(PipelineStage::Normalizing),
            PipelineState::Masking { .. } => Some(PipelineStage::Masking),
            PipelineState::Combining { .. } => Some(PipelineStage::Combining),
            PipelineState::Writing { .. } => Some(PipelineStage::Writing),
            PipelineState::Done { .. } => None,
        }
    }
}

/// One job's pipeline: a plan plus the collaborators it reads from and writes to.
pub struct Pipeline {
    plan: Arc<AnalysisPlan>,
    source: Arc<dyn RasterSource>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl Pipeline {
    pub fn new(
        plan: AnalysisPlan,
        source: Arc<dyn RasterSource>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            plan: Arc::new(plan),
            source,
            artifacts,
        }
    }

    pub fn plan(&self) -> &AnalysisPlan {
        &self.plan
    }

    /// Run the stage of `state` and return the following state.
    ///
    /// `state` is left untouched, so on error the same stage can be run again.
    pub async fn step(&self, state: &PipelineState) -> SuitResult<PipelineState> {
        match state {
            PipelineState::Fetching => self.fetch().await,
            PipelineState::Aligning { raw } => {
                let plan = self.plan.clone();
                let raw = raw.clone();
                blocking(move || align(&plan, &raw)).await
            }
            PipelineState::Normalizing { aligned } => {
                let plan = self.plan.clone();
                let aligned = aligned.clone();
                blocking(move || score(&plan, aligned)).await
            }
            PipelineState::Masking { aligned, scores } => {
                let plan = self.plan.clone();
                let aligned = aligned.clone();
                let scores = scores.clone();
                blocking(move || mask(&plan, &aligned, scores)).await
            }
            PipelineState::Combining { scores, mask } => {
                let plan = self.plan.clone();
                let scores = scores.clone();
                let mask = mask.clone();
                blocking(move || overlay(&plan, &scores, &mask)).await
            }
            PipelineState::Writing { result, statistics } => {
                let artifact = self
                    .artifacts
                    .write(self.plan.job_id, result, statistics)
                    .await?;
                Ok(PipelineState::Done {
                    artifact,
                    statistics: statistics.clone(),
                })
            }
            PipelineState::Done { .. } => Err(SuitError::InternalError(
                "pipeline already finished".to_string(),
            )),
        }
    }

    async fn fetch(&self) -> SuitResult<PipelineState> {
        let bbox = self.plan.fetch_bbox;
        let reads = self.plan.sources().into_iter().map(|layer| async move {
            let window = self.source.fetch_window(layer, &bbox).await?;
            debug!(
                layer = %layer.id,
                width = window.width(),
                height = window.height(),
                "Fetched layer window"
            );
            Ok::<_, SuitError>((layer.id.clone(), window))
        });
        let raw = try_join_all(reads).await?;
        Ok(PipelineState::Aligning {
            raw: Arc::new(raw.into_iter().collect()),
        })
    }
}

async fn blocking<F>(f: F) -> SuitResult<PipelineState>
where
    F: FnOnce() -> SuitResult<PipelineState> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SuitError::ComputeFailure(format!("pipeline task failed: {}", e)))?
}

fn lookup<'a>(windows: &'a HashMap<LayerId, RasterWindow>, id: &LayerId) -> SuitResult<&'a RasterWindow> {
    windows
        .get(id)
        .ok_or_else(|| SuitError::InternalError(format!("no window for layer '{}'", id)))
}

fn align(plan: &AnalysisPlan, raw: &HashMap<LayerId, RasterWindow>) -> SuitResult<PipelineState> {
    // Derived layers are computed on the source grid before resampling
    let derived: Vec<Option<RasterWindow>> = plan
        .layers
        .iter()
        .map(|layer_plan| {
            let source = lookup(raw, &layer_plan.source.id)?;
            Ok(match &layer_plan.layer.derivation {
                Some(Derivation::SlopeDegrees { .. }) => Some(slope_degrees(source)),
                None => None,
            })
        })
        .collect::<SuitResult<_>>()?;

    let mut inputs = Vec::with_capacity(plan.layers.len());
    for (layer_plan, derived) in plan.layers.iter().zip(&derived) {
        let window = match derived {
            Some(window) => window,
            None => lookup(raw, &layer_plan.source.id)?,
        };
        inputs.push((&layer_plan.layer, window));
    }

    let windows = align_all(&inputs, &plan.target)?;
    let aligned = plan
        .layers
        .iter()
        .map(|layer_plan| layer_plan.layer.id.clone())
        .zip(windows)
        .collect::<HashMap<_, _>>();
    Ok(PipelineState::Normalizing {
        aligned: Arc::new(aligned),
    })
}

fn score(plan: &AnalysisPlan, aligned: Windows) -> SuitResult<PipelineState> {
    let scores = plan
        .factors
        .iter()
        .map(|factor| {
            let window = lookup(&aligned, &factor.layer.id)?;
            Ok(normalize(
                window,
                factor.direction,
                factor.domain.0,
                factor.domain.1,
            )?)
        })
        .collect::<SuitResult<Vec<_>>>()?;
    Ok(PipelineState::Masking {
        aligned,
        scores: Arc::new(scores),
    })
}

fn mask(
    plan: &AnalysisPlan,
    aligned: &HashMap<LayerId, RasterWindow>,
    scores: Arc<Vec<RasterWindow>>,
) -> SuitResult<PipelineState> {
    let rules = plan
        .constraints
        .iter()
        .map(|c| Ok((lookup(aligned, &c.layer.id)?, &c.comparison)))
        .collect::<SuitResult<Vec<_>>>()?;
    let mask = build_mask(&rules, &plan.target)?;
    debug!(excluded = mask.excluded_count(), "Built exclusion mask");
    Ok(PipelineState::Combining {
        scores,
        mask: Arc::new(mask),
    })
}

fn overlay(plan: &AnalysisPlan, scores: &[RasterWindow], mask: &ExclusionMask) -> SuitResult<PipelineState> {
    let mut result = combine(scores, &plan.weights(), mask)?;
    clip_to_aoi(&mut result, &plan.inside);
    let statistics = compute_statistics(&result, mask, &plan.inside, plan.suitable_threshold);
    Ok(PipelineState::Writing {
        result: Arc::new(result),
        statistics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use raster_engine::{EngineConfig, MemoryArtifactStore, MemoryRasterSource};
    use storage::LayerCatalog;
    use suit_common::{
        AreaOfInterest, BoundingBox, Comparison, ConstraintSpec, CrsCode, FactorSpec, GridSpec,
        JobRequest,
    };
    use uuid::Uuid;

    fn layer(value: f32) -> RasterWindow {
        RasterWindow::filled(GridSpec::new(CrsCode::Epsg4326, 9.5, 20.6, 0.01, 0.01, 110, 110), value)
    }

    fn pipeline(source: MemoryRasterSource, constraints: Vec<ConstraintSpec>) -> Pipeline {
        let aoi = AreaOfInterest::from_bbox(Uuid::new_v4(), &BoundingBox::new(10.0, 20.0, 10.1, 20.1));
        let request = JobRequest::new(
            aoi,
            vec![FactorSpec::new("ghi", 70.0), FactorSpec::new("dem", 30.0)],
            constraints,
        );
        let engine = EngineConfig {
            output_resolution: 0.01,
            ..Default::default()
        };
        let plan = AnalysisPlan::build(&request, &LayerCatalog::default_catalog(), &engine).unwrap();
        Pipeline::new(plan, Arc::new(source), Arc::new(MemoryArtifactStore::new()))
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let source = MemoryRasterSource::new()
            .with_layer("ghi", layer(2200.0))
            .with_layer("dem", layer(4250.0));
        let pipeline = pipeline(source, Vec::new());

        let mut state = PipelineState::start();
        let mut seen = Vec::new();
        while let Some(stage) = state.stage() {
            seen.push(stage);
            state = pipeline.step(&state).await.unwrap();
        }
        assert_eq!(seen, PipelineStage::ALL.to_vec());

        let PipelineState::Done { artifact, statistics } = state else {
            panic!("pipeline did not finish");
        };
        // ghi 2200 in [1000, 2500] -> 80; dem 4250 in [-500, 9000], lower is better -> 50
        let expected = 0.7 * 80.0 + 0.3 * 50.0;
        let mean = statistics.mean.unwrap();
        assert!((mean - expected).abs() < 1e-3, "mean {}", mean);
        assert_eq!(statistics.valid_cells, 100);
        assert_eq!((artifact.width, artifact.height), (10, 10));
    }

    #[tokio::test]
    async fn test_failed_stage_can_be_rerun() {
        let source = MemoryRasterSource::new()
            .with_layer("ghi", layer(2200.0))
            .with_layer("dem", layer(100.0))
            .with_retry_policy(suit_common::RetryPolicy::none());
        source.fail_next("ghi", 1).await;
        let pipeline = pipeline(
            source,
            vec![ConstraintSpec::new("dem", Comparison::Gt(50.0))],
        );

        let state = PipelineState::start();
        assert!(pipeline.step(&state).await.is_err());

        let mut state = pipeline.step(&state).await.unwrap();
        while !matches!(state, PipelineState::Done { .. }) {
            state = pipeline.step(&state).await.unwrap();
        }
        let PipelineState::Done { statistics, .. } = state else {
            unreachable!()
        };
        assert_eq!(statistics.excluded_cells, 100);
        assert_eq!(statistics.valid_cells, 0);
        assert!(statistics.mean.is_none());
    }
}

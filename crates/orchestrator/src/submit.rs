//! Job intake and status queries used by the API layer.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use raster_engine::{target_grid, ArtifactStore, EngineConfig};
use storage::{CancelOutcome, JobStore, JobTicket, LayerCatalog, WorkQueue};
use suit_common::{AnalysisJob, JobRequest, JobStatusView, SuitError, SuitResult};

use crate::config::OrchestratorConfig;

/// Front door of the orchestrator: validates requests, records jobs and
/// hands them to the work queue.
pub struct JobService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    catalog: Arc<LayerCatalog>,
    artifacts: Arc<dyn ArtifactStore>,
    config: OrchestratorConfig,
    engine: EngineConfig,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        catalog: Arc<LayerCatalog>,
        artifacts: Arc<dyn ArtifactStore>,
        config: OrchestratorConfig,
        engine: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            catalog,
            artifacts,
            config,
            engine,
        }
    }

    /// Check a request without creating a job.
    pub fn validate(&self, request: &JobRequest) -> SuitResult<()> {
        request.validate_weights()?;
        request.aoi.validate()?;

        let area = request.aoi.area_km2();
        if area > self.config.max_aoi_km2 {
            return Err(SuitError::Validation(format!(
                "AOI area {:.1} km² exceeds the limit of {:.1} km²",
                area, self.config.max_aoi_km2
            )));
        }
        // The analysis grid spans the AOI bounding box, not just its area
        target_grid(&request.aoi, &self.engine).map_err(SuitError::from)?;

        if let Some(unknown) = request
            .referenced_layers()
            .into_iter()
            .find(|id| !self.catalog.contains(id))
        {
            return Err(SuitError::Validation(format!("unknown layer '{}'", unknown)));
        }
        Ok(())
    }

    /// Validate and enqueue a request, returning the new job id.
    ///
    /// Invalid requests never create a job. If the queue rejects the ticket
    /// the job stays PENDING and the error is returned; the reaper does not
    /// pick such jobs up, so callers should resubmit or cancel.
    #[instrument(skip(self, request), fields(job_id = %request.job_id))]
    pub async fn submit(&self, request: JobRequest) -> SuitResult<Uuid> {
        if let Err(e) = self.validate(&request) {
            warn!(error = %e, "Rejected analysis request");
            return Err(e);
        }

        let job = AnalysisJob::new(request);
        self.store.insert(&job).await?;
        self.queue.enqueue(&JobTicket::new(job.id, job.attempt)).await?;

        metrics::counter!("analysis_jobs_submitted_total").increment(1);
        info!(
            project_id = %job.project_id,
            factors = job.request.factors.len(),
            constraints = job.request.constraints.len(),
            "Analysis job submitted"
        );
        Ok(job.id)
    }

    pub async fn status(&self, job_id: Uuid) -> SuitResult<JobStatusView> {
        self.store
            .get(job_id)
            .await?
            .map(|job| job.view())
            .ok_or_else(|| SuitError::JobNotFound(job_id.to_string()))
    }

    pub async fn list_for_project(&self, project_id: Uuid) -> SuitResult<Vec<JobStatusView>> {
        Ok(self
            .store
            .list_for_project(project_id)
            .await?
            .iter()
            .map(AnalysisJob::view)
            .collect())
    }

    /// Cancel a PENDING job outright, or flag a RUNNING one for its worker.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: Uuid) -> SuitResult<CancelOutcome> {
        let outcome = self.store.request_cancel(job_id).await?;
        info!(?outcome, "Cancellation requested");
        Ok(outcome)
    }

    /// Remove a finished job and its result raster.
    ///
    /// Non-terminal jobs are refused with `InvalidTransition`.
    #[instrument(skip(self))]
    pub async fn delete(&self, job_id: Uuid) -> SuitResult<()> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| SuitError::JobNotFound(job_id.to_string()))?;
        if !job.status.is_terminal() {
            return Err(SuitError::InvalidTransition(format!(
                "cannot delete job {} in state {}",
                job_id, job.status
            )));
        }

        self.artifacts.delete(job_id).await?;
        if !self.store.delete(job_id).await? {
            return Err(SuitError::JobNotFound(job_id.to_string()));
        }
        info!("Analysis job deleted");
        Ok(())
    }
}

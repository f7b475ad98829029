//! Runs one claimed job through the pipeline and records its outcome.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use raster_engine::{ArtifactStore, EngineConfig, RasterSource};
use storage::{JobStore, LayerCatalog};
use suit_common::{ErrorKind, JobError, JobRequest, JobStatus, PipelineStage, SuitError, SuitResult};

use crate::config::OrchestratorConfig;
use crate::pipeline::{Pipeline, PipelineState};
use crate::plan::AnalysisPlan;

/// Collaborators shared by every job a worker runs.
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub source: Arc<dyn RasterSource>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub catalog: Arc<LayerCatalog>,
    pub engine: EngineConfig,
    pub config: OrchestratorConfig,
}

/// How a run attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(ErrorKind),
    Cancelled,
    /// The job was not PENDING when we tried to claim it.
    Skipped,
    /// Another worker or the reaper took the job over mid-run.
    ClaimLost,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Failed(_) => "failed",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::Skipped => "skipped",
            RunOutcome::ClaimLost => "claim_lost",
        }
    }
}

/// Executes claimed jobs on behalf of one worker identity.
pub struct JobRunner {
    worker_id: String,
    ctx: Arc<WorkerContext>,
}

impl JobRunner {
    pub fn new(worker_id: impl Into<String>, ctx: Arc<WorkerContext>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ctx,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Claim `job_id` and run it to a terminal state.
    ///
    /// Errors are only returned when the job store itself fails; pipeline
    /// failures end up on the job record as FAILED.
    #[instrument(skip(self), fields(worker = %self.worker_id))]
    pub async fn run(&self, job_id: Uuid) -> SuitResult<RunOutcome> {
        let Some(job) = self.ctx.store.try_claim(job_id, &self.worker_id).await? else {
            debug!("Job is not claimable, skipping");
            return Ok(RunOutcome::Skipped);
        };
        info!(attempt = job.attempt, "Claimed analysis job");

        let outcome = if job.attempt >= self.ctx.config.max_job_runs {
            let err = SuitError::ComputeFailure(format!(
                "job abandoned after {} interrupted runs",
                job.attempt
            ));
            self.finish_failed(job_id, &err).await
        } else {
            let heartbeat = self.spawn_heartbeat(job_id);
            let outcome = self.drive(job_id, &job.request).await;
            heartbeat.abort();
            outcome
        }?;

        metrics::counter!("analysis_jobs_total", "outcome" => outcome.as_str()).increment(1);
        Ok(outcome)
    }

    async fn drive(&self, job_id: Uuid, request: &JobRequest) -> SuitResult<RunOutcome> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.ctx.config.job_timeout;

        let plan = match self.build_plan(request).await {
            Ok(plan) => plan,
            Err(e) => return self.finish_failed(job_id, &e).await,
        };
        info!(
            width = plan.target.width,
            height = plan.target.height,
            layers = plan.layers.len(),
            "Analysis plan ready"
        );
        let pipeline = Pipeline::new(plan, self.ctx.source.clone(), self.ctx.artifacts.clone());

        let mut state = PipelineState::start();
        while let Some(stage) = state.stage() {
            if self.ctx.store.is_cancel_requested(job_id).await? {
                return self.finish_cancelled(job_id).await;
            }
            if tokio::time::Instant::now() >= deadline {
                return self.finish_failed(job_id, &self.timed_out(stage)).await;
            }
            if !self.ctx.store.record_stage(job_id, &self.worker_id, stage).await? {
                warn!(stage = %stage, "Claim lost before stage");
                return Ok(RunOutcome::ClaimLost);
            }

            let stage_start = Instant::now();
            let next = tokio::time::timeout_at(deadline, self.run_stage(&pipeline, &state, stage))
                .await
                .unwrap_or_else(|_| Err(self.timed_out(stage)));
            metrics::histogram!("analysis_stage_seconds", "stage" => stage.as_str())
                .record(stage_start.elapsed().as_secs_f64());

            state = match next {
                Ok(next) => next,
                Err(e) => return self.finish_failed(job_id, &e).await,
            };
            debug!(stage = %stage, elapsed_ms = stage_start.elapsed().as_millis() as u64, "Stage finished");
        }

        let PipelineState::Done {
            artifact,
            statistics,
        } = state
        else {
            return Err(SuitError::InternalError(
                "pipeline ended without a result".to_string(),
            ));
        };

        if self
            .ctx
            .store
            .complete(job_id, &self.worker_id, &artifact, &statistics)
            .await?
        {
            info!(
                location = %artifact.location,
                valid_cells = statistics.valid_cells,
                mean = ?statistics.mean,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Analysis job complete"
            );
            return Ok(RunOutcome::Completed);
        }

        // Completion was refused: either a cancel arrived during the write
        // or the claim moved elsewhere.
        if self.ctx.store.is_cancel_requested(job_id).await? {
            return self.finish_cancelled(job_id).await;
        }
        self.release_orphaned_artifact(job_id).await?;
        warn!("Claim lost before completion");
        Ok(RunOutcome::ClaimLost)
    }

    /// Resolve the request on a blocking thread; the AOI mask is a per-cell pass.
    async fn build_plan(&self, request: &JobRequest) -> SuitResult<AnalysisPlan> {
        let request = request.clone();
        let catalog = self.ctx.catalog.clone();
        let engine = self.ctx.engine.clone();
        tokio::task::spawn_blocking(move || AnalysisPlan::build(&request, &catalog, &engine))
            .await
            .map_err(|e| SuitError::ComputeFailure(format!("plan task failed: {}", e)))?
    }

    /// Run one stage, retrying failures the retry policy allows.
    async fn run_stage(
        &self,
        pipeline: &Pipeline,
        state: &PipelineState,
        stage: PipelineStage,
    ) -> SuitResult<PipelineState> {
        let retry = &self.ctx.config.retry;
        let mut retries = 0;
        loop {
            match pipeline.step(state).await {
                Ok(next) => return Ok(next),
                Err(e) => {
                    let kind = e.kind();
                    if !retry.should_retry(kind, retries) {
                        return Err(e);
                    }
                    let delay = retry.calculate_delay(retries);
                    retries += 1;
                    warn!(
                        stage = %stage,
                        error = %e,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "Stage failed, retrying"
                    );
                    metrics::counter!("analysis_retries_total", "kind" => kind.as_str())
                        .increment(1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn timed_out(&self, stage: PipelineStage) -> SuitError {
        SuitError::ComputeFailure(format!(
            "job exceeded its {}s time limit during {}",
            self.ctx.config.job_timeout.as_secs(),
            stage
        ))
    }

    async fn finish_failed(&self, job_id: Uuid, err: &SuitError) -> SuitResult<RunOutcome> {
        let job_error = JobError::from(err);
        if !self.ctx.store.fail(job_id, &self.worker_id, &job_error).await? {
            warn!(error = %err, "Claim lost before failure could be recorded");
            self.release_orphaned_artifact(job_id).await?;
            return Ok(RunOutcome::ClaimLost);
        }
        error!(kind = %job_error.kind, error = %err, "Analysis job failed");
        self.discard_artifact(job_id).await;
        Ok(RunOutcome::Failed(job_error.kind))
    }

    async fn finish_cancelled(&self, job_id: Uuid) -> SuitResult<RunOutcome> {
        if !self.ctx.store.mark_cancelled(job_id, &self.worker_id).await? {
            self.release_orphaned_artifact(job_id).await?;
            return Ok(RunOutcome::ClaimLost);
        }
        self.discard_artifact(job_id).await;
        info!("Analysis job cancelled");
        Ok(RunOutcome::Cancelled)
    }

    /// Delete our artifact after losing the claim, unless the job has moved
    /// on to a state where the artifact path belongs to someone else.
    async fn release_orphaned_artifact(&self, job_id: Uuid) -> SuitResult<()> {
        let status = self.ctx.store.get(job_id).await?.map(|job| job.status);
        match status {
            Some(JobStatus::Failed) | Some(JobStatus::Cancelled) | None => {
                self.discard_artifact(job_id).await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn discard_artifact(&self, job_id: Uuid) {
        if let Err(e) = self.ctx.artifacts.delete(job_id).await {
            warn!(error = %e, "Failed to delete result artifact");
        }
    }

    fn spawn_heartbeat(&self, job_id: Uuid) -> JoinHandle<()> {
        let store = self.ctx.store.clone();
        let worker_id = self.worker_id.clone();
        let period = self.ctx.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick fires immediately; the claim already set the heartbeat
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.heartbeat(job_id, &worker_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(job_id = %job_id, "Heartbeat refused, stopping");
                        break;
                    }
                    Err(e) => warn!(job_id = %job_id, error = %e, "Heartbeat failed"),
                }
            }
        })
    }
}

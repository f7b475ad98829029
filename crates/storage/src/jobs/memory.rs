//! In-memory job store for tests and single-process runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use suit_common::{
    AnalysisJob, JobError, JobStatus, PipelineStage, ResultArtifact, ResultStatistics,
    SuitError, SuitResult,
};

use super::{last_seen, owned_by, CancelOutcome, JobStore};

/// Job store backed by a map behind an async lock.
///
/// Each operation holds the write lock for its whole read-check-write,
/// which gives the same compare-and-set behaviour as the SQL store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, AnalysisJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Overwrite a job's heartbeat (tests simulate a dead worker with this).
    pub async fn set_heartbeat(&self, job_id: Uuid, at: DateTime<Utc>) {
        if let Some(job) = self.jobs.write().await.get_mut(&job_id) {
            job.heartbeat_at = Some(at);
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &AnalysisJob) -> SuitResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(SuitError::DatabaseError(format!(
                "job {} already exists",
                job.id
            )));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> SuitResult<Option<AnalysisJob>> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn list_for_project(&self, project_id: Uuid) -> SuitResult<Vec<AnalysisJob>> {
        let jobs = self.jobs.read().await;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.project_id == project_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn try_claim(&self, job_id: Uuid, worker_id: &str) -> SuitResult<Option<AnalysisJob>> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            return Ok(None);
        }

        let now = Utc::now();
        job.transition(JobStatus::Running, now, Some(format!("claimed by {}", worker_id)))?;
        job.owner = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.heartbeat_at = Some(now);
        job.stage = None;
        Ok(Some(job.clone()))
    }

    async fn record_stage(
        &self,
        job_id: Uuid,
        worker_id: &str,
        stage: PipelineStage,
    ) -> SuitResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            Some(job) if owned_by(job, worker_id) => {
                job.enter_stage(stage, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> SuitResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            Some(job) if owned_by(job, worker_id) => {
                job.heartbeat_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn request_cancel(&self, job_id: Uuid) -> SuitResult<CancelOutcome> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| SuitError::JobNotFound(job_id.to_string()))?;

        match job.status {
            JobStatus::Pending => {
                job.transition(
                    JobStatus::Cancelled,
                    Utc::now(),
                    Some("cancelled before start".to_string()),
                )?;
                job.cancel_requested = true;
                Ok(CancelOutcome::Cancelled)
            }
            JobStatus::Running => {
                job.cancel_requested = true;
                Ok(CancelOutcome::Requested)
            }
            status => Err(SuitError::InvalidTransition(format!(
                "cannot cancel job {} in state {}",
                job_id, status
            ))),
        }
    }

    async fn is_cancel_requested(&self, job_id: Uuid) -> SuitResult<bool> {
        Ok(self
            .jobs
            .read()
            .await
            .get(&job_id)
            .map(|j| j.cancel_requested)
            .unwrap_or(false))
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        artifact: &ResultArtifact,
        statistics: &ResultStatistics,
    ) -> SuitResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            Some(job) if owned_by(job, worker_id) && !job.cancel_requested => {
                job.transition(JobStatus::Complete, Utc::now(), None)?;
                job.artifact = Some(artifact.clone());
                job.statistics = Some(statistics.clone());
                job.owner = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(&self, job_id: Uuid, worker_id: &str, error: &JobError) -> SuitResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            Some(job) if owned_by(job, worker_id) => {
                job.transition(JobStatus::Failed, Utc::now(), Some(error.message.clone()))?;
                job.error = Some(error.clone());
                job.owner = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_cancelled(&self, job_id: Uuid, worker_id: &str) -> SuitResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            Some(job) if owned_by(job, worker_id) => {
                job.transition(
                    JobStatus::Cancelled,
                    Utc::now(),
                    Some("cancelled by request".to_string()),
                )?;
                job.owner = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_stale(&self, stale_before: DateTime<Utc>) -> SuitResult<Vec<Uuid>> {
        let mut jobs = self.jobs.write().await;
        let now = Utc::now();
        let mut reclaimed = Vec::new();

        for job in jobs.values_mut() {
            let stale = job.status == JobStatus::Running
                && last_seen(job).map_or(true, |t| t < stale_before);
            if !stale {
                continue;
            }
            let previous = job.owner.take().unwrap_or_default();
            job.transition(
                JobStatus::Pending,
                now,
                Some(format!("reclaimed from unresponsive worker {}", previous)),
            )?;
            job.attempt += 1;
            job.stage = None;
            job.heartbeat_at = None;
            reclaimed.push(job.id);
        }

        Ok(reclaimed)
    }

    async fn delete(&self, job_id: Uuid) -> SuitResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get(&job_id) {
            None => Ok(false),
            Some(job) if !job.status.is_terminal() => Err(SuitError::InvalidTransition(format!(
                "cannot delete job {} in state {}",
                job_id, job.status
            ))),
            Some(_) => {
                jobs.remove(&job_id);
                Ok(true)
            }
        }
    }
}

//! Persisted analysis job records.
//!
//! The job store is the single source of truth for job status. Every
//! mutation of a RUNNING job is a compare-and-set on status plus owner,
//! so a worker that lost its claim can never overwrite another worker's
//! progress. This replaces in-process locking: workers may live in
//! different processes or on different machines.

mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use suit_common::{
    AnalysisJob, JobError, JobStatus, PipelineStage, ResultArtifact, ResultStatistics,
    SuitResult,
};

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was PENDING and is now CANCELLED.
    Cancelled,
    /// The job is RUNNING; its worker stops at the next stage boundary.
    Requested,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new PENDING job.
    async fn insert(&self, job: &AnalysisJob) -> SuitResult<()>;

    /// Get a job by ID.
    async fn get(&self, job_id: Uuid) -> SuitResult<Option<AnalysisJob>>;

    /// Jobs of a project, newest first.
    async fn list_for_project(&self, project_id: Uuid) -> SuitResult<Vec<AnalysisJob>>;

    /// Atomically move a PENDING job to RUNNING owned by `worker_id`.
    ///
    /// Returns `None` if the job is not PENDING (already claimed, cancelled
    /// or finished). At most one concurrent caller gets `Some`.
    async fn try_claim(&self, job_id: Uuid, worker_id: &str) -> SuitResult<Option<AnalysisJob>>;

    /// Record entry into a pipeline stage. Returns false if the claim was lost.
    async fn record_stage(
        &self,
        job_id: Uuid,
        worker_id: &str,
        stage: PipelineStage,
    ) -> SuitResult<bool>;

    /// Refresh the liveness timestamp. Returns false if the claim was lost.
    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> SuitResult<bool>;

    /// Request cancellation of a non-terminal job.
    ///
    /// Fails with `InvalidTransition` for terminal jobs and `JobNotFound`
    /// for unknown ones.
    async fn request_cancel(&self, job_id: Uuid) -> SuitResult<CancelOutcome>;

    async fn is_cancel_requested(&self, job_id: Uuid) -> SuitResult<bool>;

    /// RUNNING -> COMPLETE with result reference and statistics in one write.
    ///
    /// Only succeeds while `worker_id` still owns the job and no
    /// cancellation was requested.
    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        artifact: &ResultArtifact,
        statistics: &ResultStatistics,
    ) -> SuitResult<bool>;

    /// RUNNING -> FAILED with the classified error.
    async fn fail(&self, job_id: Uuid, worker_id: &str, error: &JobError) -> SuitResult<bool>;

    /// RUNNING -> CANCELLED after the worker observed the cancel flag.
    async fn mark_cancelled(&self, job_id: Uuid, worker_id: &str) -> SuitResult<bool>;

    /// Reset RUNNING jobs whose heartbeat is older than `stale_before` to PENDING.
    ///
    /// Increments `attempt` and clears the owner. Returns the reset job ids.
    async fn reclaim_stale(&self, stale_before: DateTime<Utc>) -> SuitResult<Vec<Uuid>>;

    /// Delete a terminal job record. Returns false if no such job exists.
    async fn delete(&self, job_id: Uuid) -> SuitResult<bool>;
}

/// Liveness reference time of a RUNNING job.
pub(crate) fn last_seen(job: &AnalysisJob) -> Option<DateTime<Utc>> {
    job.heartbeat_at.or(job.started_at)
}

/// Whether `worker_id` currently owns the RUNNING job.
pub(crate) fn owned_by(job: &AnalysisJob, worker_id: &str) -> bool {
    job.status == JobStatus::Running && job.owner.as_deref() == Some(worker_id)
}

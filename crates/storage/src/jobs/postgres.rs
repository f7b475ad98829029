//! PostgreSQL job store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, FromRow, PgPool, Postgres, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use suit_common::{
    AnalysisJob, ErrorKind, JobError, JobRequest, JobStatus, PipelineStage, ResultArtifact,
    ResultStatistics, StatusEvent, SuitError, SuitResult,
};

use super::{CancelOutcome, JobStore};

const JOB_COLUMNS: &str = "id, project_id, aoi_id, request, status, owner, attempt, \
     cancel_requested, stage, created_at, started_at, finished_at, heartbeat_at, \
     error_kind, error_message, artifact, statistics";

/// Job store backed by PostgreSQL.
///
/// Status transitions are conditional `UPDATE`s, each committed together
/// with its history row.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    /// Create a new job store connection from database URL.
    pub async fn connect(database_url: &str, max_connections: u32) -> SuitResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| SuitError::DatabaseError(format!("Connection failed: {}", e)))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> SuitResult<()> {
        for statement in SCHEMA_SQL.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| SuitError::DatabaseError(format!("Migration failed: {}", e)))?;
            }
        }
        info!("Job store schema ready");
        Ok(())
    }

    async fn begin(&self) -> SuitResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| SuitError::DatabaseError(format!("Begin failed: {}", e)))
    }

    async fn load_history(&self, job_id: Uuid) -> SuitResult<Vec<StatusEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT status, stage, message, at FROM analysis_job_events \
             WHERE job_id = $1 ORDER BY id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SuitError::DatabaseError(format!("Query failed: {}", e)))?;

        rows.into_iter().map(StatusEvent::try_from).collect()
    }
}

async fn record_event(
    tx: &mut Transaction<'static, Postgres>,
    job_id: Uuid,
    status: JobStatus,
    stage: Option<PipelineStage>,
    message: Option<&str>,
    at: DateTime<Utc>,
) -> SuitResult<()> {
    sqlx::query(
        "INSERT INTO analysis_job_events (job_id, status, stage, message, at) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(job_id)
    .bind(status.as_str())
    .bind(stage.map(|s| s.as_str()))
    .bind(message)
    .bind(at)
    .execute(&mut **tx)
    .await
    .map_err(|e| SuitError::DatabaseError(format!("Event insert failed: {}", e)))?;
    Ok(())
}

async fn commit(tx: Transaction<'static, Postgres>) -> SuitResult<()> {
    tx.commit()
        .await
        .map_err(|e| SuitError::DatabaseError(format!("Commit failed: {}", e)))
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn insert(&self, job: &AnalysisJob) -> SuitResult<()> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO analysis_jobs (
                id, project_id, aoi_id, request, status, attempt,
                cancel_requested, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.id)
        .bind(job.project_id)
        .bind(job.aoi_id)
        .bind(Json(&job.request))
        .bind(job.status.as_str())
        .bind(job.attempt as i32)
        .bind(job.cancel_requested)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| SuitError::DatabaseError(format!("Insert failed: {}", e)))?;

        for event in &job.history {
            record_event(
                &mut tx,
                job.id,
                event.status,
                event.stage,
                event.message.as_deref(),
                event.at,
            )
            .await?;
        }

        commit(tx).await
    }

    async fn get(&self, job_id: Uuid) -> SuitResult<Option<AnalysisJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM analysis_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SuitError::DatabaseError(format!("Query failed: {}", e)))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let history = self.load_history(job_id).await?;
                Ok(Some(row.into_job(history)?))
            }
        }
    }

    async fn list_for_project(&self, project_id: Uuid) -> SuitResult<Vec<AnalysisJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM analysis_jobs WHERE project_id = $1 ORDER BY created_at DESC",
            JOB_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SuitError::DatabaseError(format!("Query failed: {}", e)))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let history = self.load_history(row.id).await?;
            jobs.push(row.into_job(history)?);
        }
        Ok(jobs)
    }

    #[instrument(skip(self))]
    async fn try_claim(&self, job_id: Uuid, worker_id: &str) -> SuitResult<Option<AnalysisJob>> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            "UPDATE analysis_jobs \
             SET status = 'RUNNING', owner = $2, started_at = $3, heartbeat_at = $3, stage = NULL \
             WHERE id = $1 AND status = 'PENDING' \
             RETURNING id",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| SuitError::DatabaseError(format!("Claim failed: {}", e)))?;

        if claimed.is_none() {
            debug!("Job not claimable");
            return Ok(None);
        }

        let message = format!("claimed by {}", worker_id);
        record_event(&mut tx, job_id, JobStatus::Running, None, Some(&message), now).await?;
        commit(tx).await?;

        self.get(job_id).await
    }

    async fn record_stage(
        &self,
        job_id: Uuid,
        worker_id: &str,
        stage: PipelineStage,
    ) -> SuitResult<bool> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let updated = sqlx::query(
            "UPDATE analysis_jobs SET stage = $3, heartbeat_at = $4 \
             WHERE id = $1 AND status = 'RUNNING' AND owner = $2",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(stage.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| SuitError::DatabaseError(format!("Stage update failed: {}", e)))?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }
        record_event(&mut tx, job_id, JobStatus::Running, Some(stage), None, now).await?;
        commit(tx).await?;
        Ok(true)
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> SuitResult<bool> {
        let updated = sqlx::query(
            "UPDATE analysis_jobs SET heartbeat_at = $3 \
             WHERE id = $1 AND status = 'RUNNING' AND owner = $2",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| SuitError::DatabaseError(format!("Heartbeat failed: {}", e)))?
        .rows_affected();

        Ok(updated > 0)
    }

    #[instrument(skip(self))]
    async fn request_cancel(&self, job_id: Uuid) -> SuitResult<CancelOutcome> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM analysis_jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| SuitError::DatabaseError(format!("Query failed: {}", e)))?;

        let status = status
            .and_then(|(s,)| JobStatus::from_str(&s))
            .ok_or_else(|| SuitError::JobNotFound(job_id.to_string()))?;

        let outcome = match status {
            JobStatus::Pending => {
                sqlx::query(
                    "UPDATE analysis_jobs \
                     SET status = 'CANCELLED', cancel_requested = TRUE, finished_at = $2 \
                     WHERE id = $1",
                )
                .bind(job_id)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| SuitError::DatabaseError(format!("Cancel failed: {}", e)))?;
                record_event(
                    &mut tx,
                    job_id,
                    JobStatus::Cancelled,
                    None,
                    Some("cancelled before start"),
                    now,
                )
                .await?;
                CancelOutcome::Cancelled
            }
            JobStatus::Running => {
                sqlx::query("UPDATE analysis_jobs SET cancel_requested = TRUE WHERE id = $1")
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| SuitError::DatabaseError(format!("Cancel failed: {}", e)))?;
                CancelOutcome::Requested
            }
            status => {
                return Err(SuitError::InvalidTransition(format!(
                    "cannot cancel job {} in state {}",
                    job_id, status
                )))
            }
        };

        commit(tx).await?;
        Ok(outcome)
    }

    async fn is_cancel_requested(&self, job_id: Uuid) -> SuitResult<bool> {
        let flag: Option<(bool,)> =
            sqlx::query_as("SELECT cancel_requested FROM analysis_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| SuitError::DatabaseError(format!("Query failed: {}", e)))?;

        Ok(flag.map(|(f,)| f).unwrap_or(false))
    }

    #[instrument(skip(self, artifact, statistics))]
    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        artifact: &ResultArtifact,
        statistics: &ResultStatistics,
    ) -> SuitResult<bool> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let updated = sqlx::query(
            "UPDATE analysis_jobs \
             SET status = 'COMPLETE', owner = NULL, finished_at = $3, artifact = $4, statistics = $5 \
             WHERE id = $1 AND status = 'RUNNING' AND owner = $2 AND NOT cancel_requested",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(now)
        .bind(Json(artifact))
        .bind(Json(statistics))
        .execute(&mut *tx)
        .await
        .map_err(|e| SuitError::DatabaseError(format!("Complete failed: {}", e)))?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }
        record_event(
            &mut tx,
            job_id,
            JobStatus::Complete,
            Some(PipelineStage::Writing),
            None,
            now,
        )
        .await?;
        commit(tx).await?;
        Ok(true)
    }

    #[instrument(skip(self, error))]
    async fn fail(&self, job_id: Uuid, worker_id: &str, error: &JobError) -> SuitResult<bool> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let stage: Option<(Option<String>,)> = sqlx::query_as(
            "UPDATE analysis_jobs \
             SET status = 'FAILED', owner = NULL, finished_at = $3, error_kind = $4, error_message = $5 \
             WHERE id = $1 AND status = 'RUNNING' AND owner = $2 \
             RETURNING stage",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(now)
        .bind(error.kind.as_str())
        .bind(&error.message)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| SuitError::DatabaseError(format!("Fail update failed: {}", e)))?;

        let Some((stage,)) = stage else {
            return Ok(false);
        };
        let stage = stage.as_deref().and_then(PipelineStage::from_str);
        record_event(
            &mut tx,
            job_id,
            JobStatus::Failed,
            stage,
            Some(&error.message),
            now,
        )
        .await?;
        commit(tx).await?;
        Ok(true)
    }

    async fn mark_cancelled(&self, job_id: Uuid, worker_id: &str) -> SuitResult<bool> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let stage: Option<(Option<String>,)> = sqlx::query_as(
            "UPDATE analysis_jobs \
             SET status = 'CANCELLED', owner = NULL, finished_at = $3 \
             WHERE id = $1 AND status = 'RUNNING' AND owner = $2 \
             RETURNING stage",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| SuitError::DatabaseError(format!("Cancel update failed: {}", e)))?;

        let Some((stage,)) = stage else {
            return Ok(false);
        };
        let stage = stage.as_deref().and_then(PipelineStage::from_str);
        record_event(
            &mut tx,
            job_id,
            JobStatus::Cancelled,
            stage,
            Some("cancelled by request"),
            now,
        )
        .await?;
        commit(tx).await?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn reclaim_stale(&self, stale_before: DateTime<Utc>) -> SuitResult<Vec<Uuid>> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let rows: Vec<(Uuid, Option<String>)> = sqlx::query_as(
            "UPDATE analysis_jobs j \
             SET status = 'PENDING', owner = NULL, attempt = j.attempt + 1, \
                 stage = NULL, heartbeat_at = NULL \
             FROM (SELECT id, owner FROM analysis_jobs \
                   WHERE status = 'RUNNING' AND COALESCE(heartbeat_at, started_at) < $1 \
                   FOR UPDATE) old \
             WHERE j.id = old.id \
             RETURNING j.id, old.owner",
        )
        .bind(stale_before)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| SuitError::DatabaseError(format!("Reclaim failed: {}", e)))?;

        for (job_id, owner) in &rows {
            let message = format!(
                "reclaimed from unresponsive worker {}",
                owner.as_deref().unwrap_or_default()
            );
            record_event(&mut tx, *job_id, JobStatus::Pending, None, Some(&message), now).await?;
        }
        commit(tx).await?;

        Ok(rows.into_iter().map(|(id, _)| id).collect())
    }

    async fn delete(&self, job_id: Uuid) -> SuitResult<bool> {
        let deleted: Option<(Uuid,)> = sqlx::query_as(
            "DELETE FROM analysis_jobs \
             WHERE id = $1 AND status IN ('COMPLETE', 'FAILED', 'CANCELLED') \
             RETURNING id",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SuitError::DatabaseError(format!("Delete failed: {}", e)))?;

        if deleted.is_some() {
            return Ok(true);
        }
        match self.get(job_id).await? {
            None => Ok(false),
            Some(job) => Err(SuitError::InvalidTransition(format!(
                "cannot delete job {} in state {}",
                job_id, job.status
            ))),
        }
    }
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    project_id: Uuid,
    aoi_id: Uuid,
    request: Json<JobRequest>,
    status: String,
    owner: Option<String>,
    attempt: i32,
    cancel_requested: bool,
    stage: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    error_kind: Option<String>,
    error_message: Option<String>,
    artifact: Option<Json<ResultArtifact>>,
    statistics: Option<Json<ResultStatistics>>,
}

impl JobRow {
    fn into_job(self, history: Vec<StatusEvent>) -> SuitResult<AnalysisJob> {
        let status = JobStatus::from_str(&self.status).ok_or_else(|| {
            SuitError::DatabaseError(format!("unknown job status '{}'", self.status))
        })?;
        let error = match (self.error_kind, self.error_message) {
            (Some(kind), message) => Some(JobError {
                kind: ErrorKind::from_str(&kind).ok_or_else(|| {
                    SuitError::DatabaseError(format!("unknown error kind '{}'", kind))
                })?,
                message: message.unwrap_or_default(),
            }),
            (None, _) => None,
        };

        Ok(AnalysisJob {
            id: self.id,
            project_id: self.project_id,
            aoi_id: self.aoi_id,
            request: self.request.0,
            status,
            owner: self.owner,
            attempt: self.attempt.max(0) as u32,
            cancel_requested: self.cancel_requested,
            stage: self.stage.as_deref().and_then(PipelineStage::from_str),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            heartbeat_at: self.heartbeat_at,
            error,
            artifact: self.artifact.map(|a| a.0),
            statistics: self.statistics.map(|s| s.0),
            history,
        })
    }
}

#[derive(FromRow)]
struct EventRow {
    status: String,
    stage: Option<String>,
    message: Option<String>,
    at: DateTime<Utc>,
}

impl TryFrom<EventRow> for StatusEvent {
    type Error = SuitError;

    fn try_from(row: EventRow) -> SuitResult<Self> {
        Ok(StatusEvent {
            status: JobStatus::from_str(&row.status).ok_or_else(|| {
                SuitError::DatabaseError(format!("unknown job status '{}'", row.status))
            })?,
            stage: row.stage.as_deref().and_then(PipelineStage::from_str),
            at: row.at,
            message: row.message,
        })
    }
}

/// Database schema.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS analysis_jobs (
    id UUID PRIMARY KEY,
    project_id UUID NOT NULL,
    aoi_id UUID NOT NULL,
    request JSONB NOT NULL,
    status VARCHAR(20) NOT NULL,
    owner VARCHAR(200),
    attempt INTEGER NOT NULL DEFAULT 0,
    cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
    stage VARCHAR(20),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    heartbeat_at TIMESTAMPTZ,
    error_kind VARCHAR(32),
    error_message TEXT,
    artifact JSONB,
    statistics JSONB
);

CREATE INDEX IF NOT EXISTS idx_analysis_jobs_project ON analysis_jobs(project_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_analysis_jobs_running ON analysis_jobs(status, heartbeat_at);

CREATE TABLE IF NOT EXISTS analysis_job_events (
    id BIGSERIAL PRIMARY KEY,
    job_id UUID NOT NULL REFERENCES analysis_jobs(id) ON DELETE CASCADE,
    status VARCHAR(20) NOT NULL,
    stage VARCHAR(20),
    message TEXT,
    at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_analysis_job_events_job ON analysis_job_events(job_id, id)
"#;

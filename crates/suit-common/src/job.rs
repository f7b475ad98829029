//! Analysis job records and their lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BoundingBox, CrsCode, ErrorKind, JobRequest, SuitError, SuitResult};

/// Persisted status of an analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Check if a transition is allowed.
    ///
    /// `Running -> Pending` is the only backward edge and is used solely
    /// for retry-triggered re-entry after a worker is lost.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Complete)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "RUNNING" => Some(JobStatus::Running),
            "COMPLETE" => Some(JobStatus::Complete),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELLED" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline stage a running job is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Fetching,
    Aligning,
    Normalizing,
    Masking,
    Combining,
    Writing,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 6] = [
        PipelineStage::Fetching,
        PipelineStage::Aligning,
        PipelineStage::Normalizing,
        PipelineStage::Masking,
        PipelineStage::Combining,
        PipelineStage::Writing,
    ];

    /// Zero-based position in the fixed stage order.
    pub fn ordinal(&self) -> usize {
        match self {
            PipelineStage::Fetching => 0,
            PipelineStage::Aligning => 1,
            PipelineStage::Normalizing => 2,
            PipelineStage::Masking => 3,
            PipelineStage::Combining => 4,
            PipelineStage::Writing => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Fetching => "fetching",
            PipelineStage::Aligning => "aligning",
            PipelineStage::Normalizing => "normalizing",
            PipelineStage::Masking => "masking",
            PipelineStage::Combining => "combining",
            PipelineStage::Writing => "writing",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|stage| stage.as_str() == s)
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of a job's status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<PipelineStage>,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Terminal error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SuitError> for JobError {
    fn from(err: &SuitError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Summary statistics of a suitability result.
///
/// `mean`, `min`, `max` and `std_dev` are `None` when no cell is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResultStatistics {
    /// Cells inside the AOI polygon
    pub total_cells: u64,
    /// Cells with a score
    pub valid_cells: u64,
    /// Cells removed by a constraint
    pub excluded_cells: u64,
    /// Cells without a score for lack of input data
    pub nodata_cells: u64,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub std_dev: Option<f64>,
    /// Mean ground area of one cell
    pub cell_area_km2: f64,
    pub total_area_km2: f64,
    pub excluded_area_km2: f64,
    /// Area of valid cells scoring at least the suitability threshold
    pub suitable_area_km2: f64,
    pub suitable_threshold: f64,
}

impl ResultStatistics {
    /// Excluded cells as a percentage of AOI cells.
    pub fn excluded_percent(&self) -> f64 {
        if self.total_cells == 0 {
            0.0
        } else {
            self.excluded_cells as f64 / self.total_cells as f64 * 100.0
        }
    }
}

/// Reference to a persisted suitability raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultArtifact {
    pub job_id: Uuid,
    /// Storage prefix of the artifact (Zarr group)
    pub location: String,
    pub crs: CrsCode,
    /// Cell size of the full-resolution level
    pub resolution: f64,
    pub bbox: BoundingBox,
    pub width: usize,
    pub height: usize,
    pub value_range: (f64, f64),
    pub nodata: f32,
    /// Number of resolution levels including full resolution
    pub levels: usize,
    pub created_at: DateTime<Utc>,
}

/// The central mutable job entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub project_id: Uuid,
    pub aoi_id: Uuid,
    pub request: JobRequest,
    pub status: JobStatus,
    /// Worker holding the claim while RUNNING
    pub owner: Option<String>,
    /// Number of times the job has been (re)started
    pub attempt: u32,
    pub cancel_requested: bool,
    pub stage: Option<PipelineStage>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub error: Option<JobError>,
    pub artifact: Option<ResultArtifact>,
    pub statistics: Option<ResultStatistics>,
    pub history: Vec<StatusEvent>,
}

impl AnalysisJob {
    /// New PENDING job for a validated request.
    pub fn new(request: JobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: request.job_id,
            project_id: request.project_id,
            aoi_id: request.aoi.id,
            request,
            status: JobStatus::Pending,
            owner: None,
            attempt: 0,
            cancel_requested: false,
            stage: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            heartbeat_at: None,
            error: None,
            artifact: None,
            statistics: None,
            history: vec![StatusEvent {
                status: JobStatus::Pending,
                stage: None,
                at: now,
                message: None,
            }],
        }
    }

    /// Move to `next`, recording the transition in the history.
    pub fn transition(
        &mut self,
        next: JobStatus,
        at: DateTime<Utc>,
        message: Option<String>,
    ) -> SuitResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SuitError::InvalidTransition(format!(
                "{} -> {} for job {}",
                self.status, next, self.id
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(at);
        }
        self.history.push(StatusEvent {
            status: next,
            stage: self.stage,
            at,
            message,
        });
        Ok(())
    }

    /// Record entry into a pipeline stage.
    pub fn enter_stage(&mut self, stage: PipelineStage, at: DateTime<Utc>) {
        self.stage = Some(stage);
        self.history.push(StatusEvent {
            status: self.status,
            stage: Some(stage),
            at,
            message: None,
        });
    }

    /// Coarse progress from the number of completed stages.
    pub fn progress_percent(&self) -> u8 {
        match self.status {
            JobStatus::Complete => 100,
            JobStatus::Pending => 0,
            _ => self
                .stage
                .map(|s| (s.ordinal() * 100 / PipelineStage::ALL.len()) as u8)
                .unwrap_or(0),
        }
    }

    pub fn view(&self) -> JobStatusView {
        JobStatusView::from(self)
    }
}

/// Read-only status record exposed to the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub project_id: Uuid,
    pub status: JobStatus,
    pub stage: Option<PipelineStage>,
    pub progress_percent: u8,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub artifact: Option<ResultArtifact>,
    pub statistics: Option<ResultStatistics>,
    pub history: Vec<StatusEvent>,
}

impl From<&AnalysisJob> for JobStatusView {
    fn from(job: &AnalysisJob) -> Self {
        Self {
            job_id: job.id,
            project_id: job.project_id,
            status: job.status,
            stage: job.stage,
            progress_percent: job.progress_percent(),
            attempt: job.attempt,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            error_kind: job.error.as_ref().map(|e| e.kind),
            error_message: job.error.as_ref().map(|e| e.message.clone()),
            artifact: job.artifact.clone(),
            statistics: job.statistics.clone(),
            history: job.history.clone(),
        }
    }
}

//! End-to-end job runs against in-memory stores, queue and rasters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use orchestrator::{Dispatcher, JobRunner, JobService, OrchestratorConfig, RunOutcome, WorkerContext};
use raster_engine::{
    ArtifactStore, EngineConfig, EngineError, MemoryArtifactStore, MemoryRasterSource,
    RasterSource, RasterWindow,
};
use storage::{CancelOutcome, JobStore, LayerCatalog, MemoryJobStore, MemoryQueue};
use suit_common::{
    AnalysisJob, AreaOfInterest, BoundingBox, Comparison, ConstraintSpec, CrsCode, Derivation,
    ErrorKind, FactorSpec, GridSpec, JobRequest, JobStatus, LayerDescriptor, LayerId, LayerKind,
    PipelineStage, ResultArtifact, ResultStatistics, RetryPolicy,
};

fn layer(id: &str, range: (f64, f64), higher_is_better: bool) -> LayerDescriptor {
    LayerDescriptor {
        id: LayerId::new(id),
        name: id.to_string(),
        storage_path: format!("test/{}", id),
        unit: "unit".to_string(),
        native_resolution: 0.01,
        value_range: range,
        higher_is_better,
        kind: LayerKind::Continuous,
        derivation: None,
    }
}

fn catalog() -> LayerCatalog {
    let mut dem_slope = layer("dem_slope", (0.0, 10.0), false);
    dem_slope.storage_path = String::new();
    dem_slope.derivation = Some(Derivation::SlopeDegrees {
        source: LayerId::new("dem"),
    });
    LayerCatalog::new(vec![
        layer("ghi", (1000.0, 2500.0), true),
        layer("slope", (0.0, 10.0), false),
        layer("dem", (0.0, 5000.0), false),
        dem_slope,
    ])
    .unwrap()
}

/// Constant layer on a 0.01° grid around the test AOI.
fn constant(value: f32) -> RasterWindow {
    RasterWindow::filled(
        GridSpec::new(CrsCode::Epsg4326, 9.5, 20.6, 0.01, 0.01, 110, 110),
        value,
    )
}

fn solar_source() -> MemoryRasterSource {
    MemoryRasterSource::new()
        .with_layer("ghi", constant(2200.0))
        .with_layer("slope", constant(2.0))
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        },
        poll_wait: Duration::from_millis(50),
        ..Default::default()
    }
}

fn engine() -> EngineConfig {
    EngineConfig {
        output_resolution: 0.01,
        ..Default::default()
    }
}

/// 0.1° square AOI: a 10x10 analysis grid at 0.01°.
fn solar_request(constraints: Vec<ConstraintSpec>) -> JobRequest {
    let aoi = AreaOfInterest::from_bbox(Uuid::new_v4(), &BoundingBox::new(10.0, 20.0, 10.1, 20.1));
    JobRequest::new(
        aoi,
        vec![FactorSpec::new("ghi", 70.0), FactorSpec::new("slope", 30.0)],
        constraints,
    )
}

struct Harness {
    store: Arc<MemoryJobStore>,
    queue: Arc<MemoryQueue>,
    artifacts: Arc<MemoryArtifactStore>,
    catalog: Arc<LayerCatalog>,
    config: OrchestratorConfig,
    service: JobService,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(config())
    }

    fn with_config(config: OrchestratorConfig) -> Self {
        let store = MemoryJobStore::arc();
        let queue = Arc::new(MemoryQueue::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let catalog = Arc::new(catalog());
        let service = JobService::new(
            store.clone(),
            queue.clone(),
            catalog.clone(),
            artifacts.clone(),
            config.clone(),
            engine(),
        );
        Self {
            store,
            queue,
            artifacts,
            catalog,
            config,
            service,
        }
    }

    fn runner(&self, worker: &str, source: Arc<dyn RasterSource>) -> JobRunner {
        self.runner_with(worker, source, self.artifacts.clone())
    }

    fn runner_with(
        &self,
        worker: &str,
        source: Arc<dyn RasterSource>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> JobRunner {
        let ctx = WorkerContext {
            store: self.store.clone(),
            source,
            artifacts,
            catalog: self.catalog.clone(),
            engine: engine(),
            config: self.config.clone(),
        };
        JobRunner::new(worker, Arc::new(ctx))
    }

    async fn job(&self, job_id: Uuid) -> AnalysisJob {
        self.store.get(job_id).await.unwrap().unwrap()
    }
}

/// Requests cancellation of a job as soon as any layer is read.
struct CancellingSource {
    inner: MemoryRasterSource,
    store: Arc<MemoryJobStore>,
    job_id: Uuid,
}

#[async_trait]
impl RasterSource for CancellingSource {
    async fn fetch_window(
        &self,
        layer: &LayerDescriptor,
        bbox: &BoundingBox,
    ) -> raster_engine::Result<RasterWindow> {
        let _ = self.store.request_cancel(self.job_id).await;
        self.inner.fetch_window(layer, bbox).await
    }
}

/// Source whose reads take longer than the job timeout.
struct SlowSource {
    inner: MemoryRasterSource,
    delay: Duration,
}

#[async_trait]
impl RasterSource for SlowSource {
    async fn fetch_window(
        &self,
        layer: &LayerDescriptor,
        bbox: &BoundingBox,
    ) -> raster_engine::Result<RasterWindow> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch_window(layer, bbox).await
    }
}

/// Artifact store that receives a cancellation right after each write.
struct CancelOnWrite {
    inner: Arc<MemoryArtifactStore>,
    store: Arc<MemoryJobStore>,
}

#[async_trait]
impl ArtifactStore for CancelOnWrite {
    async fn write(
        &self,
        job_id: Uuid,
        result: &RasterWindow,
        statistics: &ResultStatistics,
    ) -> raster_engine::Result<ResultArtifact> {
        let artifact = self.inner.write(job_id, result, statistics).await?;
        self.store
            .request_cancel(job_id)
            .await
            .map_err(EngineError::storage)?;
        Ok(artifact)
    }

    async fn delete(&self, job_id: Uuid) -> raster_engine::Result<()> {
        self.inner.delete(job_id).await
    }

    async fn exists(&self, job_id: Uuid) -> raster_engine::Result<bool> {
        self.inner.exists(job_id).await
    }
}

/// Artifact store whose writes stall before reaching the inner store.
struct StalledWriter {
    inner: Arc<MemoryArtifactStore>,
    delay: Duration,
}

#[async_trait]
impl ArtifactStore for StalledWriter {
    async fn write(
        &self,
        job_id: Uuid,
        result: &RasterWindow,
        statistics: &ResultStatistics,
    ) -> raster_engine::Result<ResultArtifact> {
        tokio::time::sleep(self.delay).await;
        self.inner.write(job_id, result, statistics).await
    }

    async fn delete(&self, job_id: Uuid) -> raster_engine::Result<()> {
        self.inner.delete(job_id).await
    }

    async fn exists(&self, job_id: Uuid) -> raster_engine::Result<bool> {
        self.inner.exists(job_id).await
    }
}

#[tokio::test]
async fn test_weighted_overlay_completes() {
    let h = Harness::new();
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();

    let outcome = h.runner("w1", Arc::new(solar_source())).run(job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let view = h.service.status(job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Complete);
    assert_eq!(view.progress_percent, 100);
    assert!(view.error_kind.is_none());

    // ghi 2200 in [1000, 2500] scores 80; slope 2 in [0, 10], lower is better, scores 80
    let stats = view.statistics.unwrap();
    assert_eq!(stats.total_cells, 100);
    assert_eq!(stats.valid_cells, 100);
    assert_eq!(stats.excluded_cells, 0);
    assert!((stats.mean.unwrap() - 80.0).abs() < 1e-3);

    let stored = h.artifacts.get(job_id).await.unwrap();
    assert_eq!((stored.result.width(), stored.result.height()), (10, 10));
    assert_eq!(view.artifact.unwrap().location, stored.artifact.location);

    let stages: Vec<PipelineStage> = view
        .history
        .iter()
        .filter(|e| e.status == JobStatus::Running)
        .filter_map(|e| e.stage)
        .collect();
    assert_eq!(stages, PipelineStage::ALL.to_vec());
}

#[tokio::test]
async fn test_constraint_excludes_everything() {
    let h = Harness::new();
    let request = solar_request(vec![ConstraintSpec::new("slope", Comparison::Gt(15.0))]);
    let job_id = h.service.submit(request).await.unwrap();

    let source = MemoryRasterSource::new()
        .with_layer("ghi", constant(2200.0))
        .with_layer("slope", constant(20.0));
    let outcome = h.runner("w1", Arc::new(source)).run(job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let stats = h.job(job_id).await.statistics.unwrap();
    assert_eq!(stats.valid_cells, 0);
    assert_eq!(stats.excluded_cells, 100);
    assert_eq!(stats.excluded_percent(), 100.0);
    assert!(stats.mean.is_none());
    assert_eq!(stats.suitable_area_km2, 0.0);
}

#[tokio::test]
async fn test_nodata_in_any_factor_propagates() {
    let h = Harness::new();
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();

    // ghi is missing west of 10.03°E
    let mut ghi = constant(2200.0);
    let width = ghi.grid.width;
    for (i, v) in ghi.data.iter_mut().enumerate() {
        if i % width < 53 {
            *v = f32::NAN;
        }
    }
    let source = MemoryRasterSource::new()
        .with_layer("ghi", ghi)
        .with_layer("slope", constant(2.0));
    h.runner("w1", Arc::new(source)).run(job_id).await.unwrap();

    let stored = h.artifacts.get(job_id).await.unwrap();
    assert!(stored.result.get(0, 0).is_none());
    assert!((stored.result.get(9, 0).unwrap() - 80.0).abs() < 1e-3);

    let stats = stored.statistics;
    assert!(stats.nodata_cells > 0);
    assert!(stats.valid_cells > 0);
    assert_eq!(stats.valid_cells + stats.nodata_cells, 100);
}

#[tokio::test]
async fn test_missing_layer_fails_after_retries() {
    let h = Harness::new();
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();

    let source = MemoryRasterSource::new().with_layer("ghi", constant(2200.0));
    let outcome = h.runner("w1", Arc::new(source)).run(job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Failed(ErrorKind::DataUnavailable));

    let view = h.service.status(job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.error_kind, Some(ErrorKind::DataUnavailable));
    assert!(view.error_message.unwrap().contains("slope"));
    assert!(view.artifact.is_none());
    assert!(h.artifacts.is_empty().await);
}

#[tokio::test]
async fn test_aoi_outside_layer_is_not_retried() {
    let h = Harness::new();
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();

    // slope starts just east of the AOI
    let slope = RasterWindow::filled(
        GridSpec::new(CrsCode::Epsg4326, 10.105, 20.6, 0.01, 0.01, 50, 110),
        2.0,
    );
    let source = Arc::new(
        MemoryRasterSource::new()
            .with_layer("ghi", constant(2200.0))
            .with_layer("slope", slope),
    );
    let outcome = h.runner("w1", source.clone()).run(job_id).await.unwrap();

    assert_eq!(outcome, RunOutcome::Failed(ErrorKind::AlignmentFailure));
    // One fetch per layer, and the fetch stage is never repeated
    assert_eq!(source.fetch_count(), 2);
    assert_eq!(h.job(job_id).await.stage, Some(PipelineStage::Aligning));
}

#[tokio::test]
async fn test_transient_read_failure_is_retried() {
    let h = Harness::new();
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();

    let source = solar_source();
    source.fail_next("ghi", 1).await;
    let outcome = h.runner("w1", Arc::new(source)).run(job_id).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(h.job(job_id).await.status, JobStatus::Complete);
}

#[tokio::test]
async fn test_storage_failure_leaves_no_artifact() {
    let h = Harness::new();
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();
    h.artifacts.fail_next(10);

    let outcome = h.runner("w1", Arc::new(solar_source())).run(job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Failed(ErrorKind::StorageFailure));

    // First write plus two retries
    assert_eq!(h.artifacts.write_count(), 3);
    assert!(h.artifacts.is_empty().await);
    let job = h.job(job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.artifact.is_none());
    assert!(job.statistics.is_none());
}

#[tokio::test]
async fn test_cancel_pending_job_never_runs() {
    let h = Harness::new();
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();

    assert_eq!(h.service.cancel(job_id).await.unwrap(), CancelOutcome::Cancelled);

    let source = Arc::new(solar_source());
    let outcome = h.runner("w1", source.clone()).run(job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Skipped);
    assert_eq!(source.fetch_count(), 0);
    assert_eq!(h.job(job_id).await.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_running_job_stops_at_stage_boundary() {
    let h = Harness::new();
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();

    let source = CancellingSource {
        inner: solar_source(),
        store: h.store.clone(),
        job_id,
    };
    let outcome = h.runner("w1", Arc::new(source)).run(job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);

    let job = h.job(job_id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.stage, Some(PipelineStage::Fetching));
    assert!(job.artifact.is_none());
    assert_eq!(h.artifacts.write_count(), 0);
}

#[tokio::test]
async fn test_cancel_during_write_discards_artifact() {
    let h = Harness::new();
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();

    let artifacts = Arc::new(CancelOnWrite {
        inner: h.artifacts.clone(),
        store: h.store.clone(),
    });
    let outcome = h
        .runner_with("w1", Arc::new(solar_source()), artifacts)
        .run(job_id)
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);

    assert_eq!(h.artifacts.write_count(), 1);
    assert!(!h.artifacts.exists(job_id).await.unwrap());
    let job = h.job(job_id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.statistics.is_none());
}

#[tokio::test]
async fn test_only_one_worker_claims_a_job() {
    let h = Harness::new();
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();

    let a = h.runner("w1", Arc::new(solar_source()));
    let b = h.runner("w2", Arc::new(solar_source()));
    let (ra, rb) = tokio::join!(a.run(job_id), b.run(job_id));

    let mut outcomes = vec![ra.unwrap(), rb.unwrap()];
    outcomes.sort_by_key(|o| o.as_str());
    assert_eq!(outcomes, vec![RunOutcome::Completed, RunOutcome::Skipped]);
    assert_eq!(h.artifacts.write_count(), 1);
}

#[tokio::test]
async fn test_job_timeout_fails_with_compute_failure() {
    let h = Harness::with_config(OrchestratorConfig {
        job_timeout: Duration::from_millis(50),
        ..config()
    });
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();

    let source = SlowSource {
        inner: solar_source(),
        delay: Duration::from_millis(500),
    };
    let outcome = h.runner("w1", Arc::new(source)).run(job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Failed(ErrorKind::ComputeFailure));

    let view = h.service.status(job_id).await.unwrap();
    assert!(view.error_message.unwrap().contains("time limit"));
    assert!(h.artifacts.is_empty().await);
}

#[tokio::test]
async fn test_stalled_write_counts_against_timeout() {
    let h = Harness::with_config(OrchestratorConfig {
        job_timeout: Duration::from_millis(300),
        ..config()
    });
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();

    let writer = StalledWriter {
        inner: h.artifacts.clone(),
        delay: Duration::from_secs(3),
    };
    let started = std::time::Instant::now();
    let outcome = h
        .runner_with("w1", Arc::new(solar_source()), Arc::new(writer))
        .run(job_id)
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Failed(ErrorKind::ComputeFailure));
    assert!(started.elapsed() < Duration::from_secs(2));

    let job = h.job(job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ComputeFailure);
    assert!(error.message.contains("writing"), "{}", error.message);
    assert!(!h.artifacts.exists(job_id).await.unwrap());
}

#[tokio::test]
async fn test_oversized_grid_fails_without_fetching() {
    let h = Harness::new();
    // Small area, but its bounding box spans 160° x 120°
    let aoi = AreaOfInterest::new(
        Uuid::new_v4(),
        vec![vec![(-80.0, -60.0), (80.0, 60.0), (80.0, 59.999)]],
    );
    let job = AnalysisJob::new(JobRequest::new(
        aoi,
        vec![FactorSpec::new("ghi", 100.0)],
        Vec::new(),
    ));
    h.store.insert(&job).await.unwrap();

    let source = Arc::new(solar_source());
    let outcome = h.runner("w1", source.clone()).run(job.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Failed(ErrorKind::Validation));
    assert_eq!(source.fetch_count(), 0);

    let job = h.job(job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().message.contains("analysis grid"));
}

#[tokio::test]
async fn test_slope_derived_from_flat_dem() {
    let h = Harness::new();
    let aoi = AreaOfInterest::from_bbox(Uuid::new_v4(), &BoundingBox::new(10.0, 20.0, 10.1, 20.1));
    let request = JobRequest::new(
        aoi,
        vec![FactorSpec::new("dem_slope", 100.0)],
        vec![ConstraintSpec::new("dem_slope", Comparison::Gt(15.0))],
    );
    let job_id = h.service.submit(request).await.unwrap();

    let source = MemoryRasterSource::new().with_layer("dem", constant(350.0));
    let outcome = h.runner("w1", Arc::new(source)).run(job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let stats = h.job(job_id).await.statistics.unwrap();
    assert_eq!(stats.valid_cells, 100);
    assert_eq!(stats.excluded_cells, 0);
    assert!((stats.mean.unwrap() - 100.0).abs() < 1e-3);
}

#[tokio::test]
async fn test_stale_job_is_reclaimed_and_rerun() {
    let h = Harness::new();
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();

    // A worker claims the job and dies
    h.store.try_claim(job_id, "dead-worker").await.unwrap().unwrap();
    h.store
        .set_heartbeat(job_id, Utc::now() - chrono::Duration::hours(1))
        .await;

    let dispatcher = Dispatcher::new(
        Arc::new(h.runner("w1", Arc::new(solar_source()))),
        h.queue.clone(),
    );
    assert_eq!(dispatcher.reap_once().await.unwrap(), 1);
    let job = h.job(job_id).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt, 1);
    assert!(job.owner.is_none());

    // The original ticket and the reclaim ticket; the second is skipped
    assert_eq!(dispatcher.run_until_idle().await.unwrap(), 2);
    let job = h.job(job_id).await;
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.attempt, 1);
    assert_eq!(h.queue.in_flight().await, 0);
}

#[tokio::test]
async fn test_job_abandoned_after_max_runs() {
    let h = Harness::with_config(OrchestratorConfig {
        max_job_runs: 1,
        ..config()
    });
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();

    h.store.try_claim(job_id, "dead-worker").await.unwrap().unwrap();
    h.store
        .set_heartbeat(job_id, Utc::now() - chrono::Duration::hours(1))
        .await;
    h.store
        .reclaim_stale(Utc::now() - chrono::Duration::minutes(5))
        .await
        .unwrap();

    let source = Arc::new(solar_source());
    let outcome = h.runner("w1", source.clone()).run(job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Failed(ErrorKind::ComputeFailure));
    assert_eq!(source.fetch_count(), 0);
}

#[tokio::test]
async fn test_dispatcher_serves_queue_until_shutdown() {
    let h = Harness::new();
    let mut job_ids = Vec::new();
    for _ in 0..3 {
        job_ids.push(h.service.submit(solar_request(Vec::new())).await.unwrap());
    }

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(h.runner("w1", Arc::new(solar_source()))),
        h.queue.clone(),
    ));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run(shutdown_rx).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut done = 0;
        for id in &job_ids {
            if h.job(*id).await.status == JobStatus::Complete {
                done += 1;
            }
        }
        if done == job_ids.len() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "jobs did not complete");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn test_delete_completed_job_removes_artifact() {
    let h = Harness::new();
    let job_id = h.service.submit(solar_request(Vec::new())).await.unwrap();
    h.runner("w1", Arc::new(solar_source())).run(job_id).await.unwrap();
    assert!(h.artifacts.exists(job_id).await.unwrap());

    h.service.delete(job_id).await.unwrap();
    assert!(!h.artifacts.exists(job_id).await.unwrap());
    assert!(h.store.get(job_id).await.unwrap().is_none());
}

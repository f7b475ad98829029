//! In-memory artifact store for tests and local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use suit_common::{ResultArtifact, ResultStatistics};

use super::ArtifactStore;
use crate::error::{EngineError, Result};
use crate::types::{RasterWindow, RESULT_NODATA};

/// A stored result with its statistics.
#[derive(Debug, Clone)]
pub struct StoredResult {
    pub artifact: ResultArtifact,
    pub result: RasterWindow,
    pub statistics: ResultStatistics,
}

/// Artifact store keeping results in a map.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    results: RwLock<HashMap<Uuid, StoredResult>>,
    failures: AtomicU32,
    writes: AtomicUsize,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail as if storage were unreachable.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of write attempts so far, failed ones included.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn get(&self, job_id: Uuid) -> Option<StoredResult> {
        self.results.read().await.get(&job_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn write(
        &self,
        job_id: Uuid,
        result: &RasterWindow,
        statistics: &ResultStatistics,
    ) -> Result<ResultArtifact> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EngineError::storage("injected write failure"));
        }

        let artifact = ResultArtifact {
            job_id,
            location: format!("memory://results/{}", job_id),
            crs: result.grid.crs,
            resolution: result.grid.res_x,
            bbox: result.bbox(),
            width: result.width(),
            height: result.height(),
            value_range: result
                .value_range()
                .map(|(lo, hi)| (lo as f64, hi as f64))
                .unwrap_or((0.0, 0.0)),
            nodata: RESULT_NODATA,
            levels: 1,
            created_at: Utc::now(),
        };

        self.results.write().await.insert(
            job_id,
            StoredResult {
                artifact: artifact.clone(),
                result: result.clone(),
                statistics: statistics.clone(),
            },
        );
        Ok(artifact)
    }

    async fn delete(&self, job_id: Uuid) -> Result<()> {
        self.results.write().await.remove(&job_id);
        Ok(())
    }

    async fn exists(&self, job_id: Uuid) -> Result<bool> {
        Ok(self.results.read().await.contains_key(&job_id))
    }
}

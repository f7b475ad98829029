//! In-memory raster source for tests and local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use suit_common::{BoundingBox, LayerDescriptor, LayerId, RetryPolicy};

use super::{not_stored, window_for_bbox, with_read_retries, RasterSource, WINDOW_MARGIN};
use crate::error::{EngineError, Result};
use crate::types::RasterWindow;

/// Layers held as full in-memory grids, keyed by layer id.
#[derive(Default)]
pub struct MemoryRasterSource {
    layers: HashMap<LayerId, RasterWindow>,
    /// Remaining injected read failures per layer
    failures: Mutex<HashMap<LayerId, u32>>,
    retry: RetryPolicy,
    fetches: AtomicUsize,
}

impl MemoryRasterSource {
    pub fn new() -> Self {
        Self {
            retry: RetryPolicy::none(),
            ..Default::default()
        }
    }

    /// Register the full grid of a layer.
    pub fn with_layer(mut self, id: impl Into<String>, window: RasterWindow) -> Self {
        self.layers.insert(LayerId::new(id), window);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Make the next `count` reads of `id` fail as if the store were unreachable.
    pub async fn fail_next(&self, id: impl Into<String>, count: u32) {
        self.failures.lock().await.insert(LayerId::new(id), count);
    }

    /// Number of read attempts so far, retries included.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn read_once(&self, layer: &LayerDescriptor, bbox: &BoundingBox) -> Result<RasterWindow> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        {
            let mut failures = self.failures.lock().await;
            if let Some(remaining) = failures.get_mut(&layer.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(EngineError::read_failed(
                        layer.id.as_str(),
                        "injected store failure",
                    ));
                }
            }
        }

        let full = self
            .layers
            .get(&layer.id)
            .ok_or_else(|| EngineError::LayerMissing(layer.id.to_string()))?;

        let window = window_for_bbox(&full.grid, bbox, WINDOW_MARGIN)
            .ok_or_else(|| EngineError::NoIntersection(layer.id.to_string()))?;

        let mut data = Vec::with_capacity(window.width() * window.height());
        for row in window.min_row..window.max_row {
            let start = full.grid.flat_index(window.min_col, row);
            data.extend_from_slice(&full.data[start..start + window.width()]);
        }

        Ok(RasterWindow::new(data, window.grid(&full.grid)))
    }
}

#[async_trait]
impl RasterSource for MemoryRasterSource {
    async fn fetch_window(
        &self,
        layer: &LayerDescriptor,
        bbox: &BoundingBox,
    ) -> Result<RasterWindow> {
        if !layer.is_stored() {
            return Err(not_stored(layer));
        }
        with_read_retries(&self.retry, layer.id.as_str(), || self.read_once(layer, bbox)).await
    }
}

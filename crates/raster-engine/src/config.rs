//! Configuration for the raster engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use suit_common::{CrsCode, RetryPolicy};

use crate::downsample::DownsampleMethod;

/// Configuration for reading layers and writing results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// CRS of the analysis grid and the result raster.
    pub output_crs: CrsCode,

    /// Cell size of the analysis grid, in units of `output_crs`.
    pub output_resolution: f64,

    /// Largest analysis grid (width x height) a job may request.
    pub max_grid_cells: usize,

    /// Memory budget for the chunk cache in megabytes.
    pub chunk_cache_size_mb: usize,

    /// Chunk dimension for result Zarr arrays (square chunks).
    pub zarr_chunk_size: usize,

    /// Compression codec for result Zarr arrays.
    pub zarr_compression: ZarrCompression,

    /// Compression level (1-9).
    pub zarr_compression_level: u8,

    /// Enable byte shuffle filter for better compression.
    pub zarr_shuffle: bool,

    /// Stop adding overview levels once the smaller dimension would drop below this.
    pub overview_min_dimension: usize,

    /// Downsampling method for overview levels.
    pub overview_method: DownsampleMethod,

    /// Score at or above which a valid cell counts as suitable.
    pub suitable_threshold: f64,

    /// Retries for a failed layer read before giving up.
    pub fetch_retries: u32,

    /// Delay before the first read retry in milliseconds.
    pub fetch_retry_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_crs: CrsCode::Epsg4326,
            // ~90 m at the equator
            output_resolution: 0.000833,
            // ~100 MB per f32 window
            max_grid_cells: 25_000_000,
            chunk_cache_size_mb: 512,
            zarr_chunk_size: 512,
            zarr_compression: ZarrCompression::BloscZstd,
            zarr_compression_level: 1,
            zarr_shuffle: true,
            overview_min_dimension: 256,
            overview_method: DownsampleMethod::Mean,
            suitable_threshold: 50.0,
            fetch_retries: 3,
            fetch_retry_delay_ms: 200,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("OUTPUT_CRS") {
            if let Ok(crs) = CrsCode::parse(&val) {
                config.output_crs = crs;
            }
        }

        if let Ok(val) = std::env::var("OUTPUT_RESOLUTION") {
            if let Ok(res) = val.parse() {
                config.output_resolution = res;
            }
        }

        if let Ok(val) = std::env::var("MAX_GRID_CELLS") {
            if let Ok(cells) = val.parse() {
                config.max_grid_cells = cells;
            }
        }

        if let Ok(val) = std::env::var("CHUNK_CACHE_SIZE_MB") {
            if let Ok(size) = val.parse() {
                config.chunk_cache_size_mb = size;
            }
        }

        if let Ok(val) = std::env::var("ZARR_CHUNK_SIZE") {
            if let Ok(size) = val.parse() {
                config.zarr_chunk_size = size;
            }
        }

        if let Ok(val) = std::env::var("ZARR_COMPRESSION") {
            config.zarr_compression = ZarrCompression::from_str(&val);
        }

        if let Ok(val) = std::env::var("ZARR_COMPRESSION_LEVEL") {
            if let Ok(level) = val.parse() {
                config.zarr_compression_level = level;
            }
        }

        if let Ok(val) = std::env::var("ZARR_SHUFFLE") {
            config.zarr_shuffle = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = std::env::var("OVERVIEW_MIN_DIMENSION") {
            if let Ok(size) = val.parse() {
                config.overview_min_dimension = size;
            }
        }

        if let Ok(val) = std::env::var("OVERVIEW_METHOD") {
            config.overview_method = DownsampleMethod::from_str(&val);
        }

        if let Ok(val) = std::env::var("SUITABLE_THRESHOLD") {
            if let Ok(threshold) = val.parse() {
                config.suitable_threshold = threshold;
            }
        }

        if let Ok(val) = std::env::var("FETCH_RETRIES") {
            if let Ok(retries) = val.parse() {
                config.fetch_retries = retries;
            }
        }

        if let Ok(val) = std::env::var("FETCH_RETRY_DELAY_MS") {
            if let Ok(ms) = val.parse() {
                config.fetch_retry_delay_ms = ms;
            }
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.output_resolution.is_finite() && self.output_resolution > 0.0) {
            return Err("output_resolution must be a positive number".to_string());
        }

        if self.max_grid_cells == 0 {
            return Err("max_grid_cells must be > 0".to_string());
        }

        if self.chunk_cache_size_mb == 0 {
            return Err("chunk_cache_size_mb must be > 0".to_string());
        }

        if self.zarr_chunk_size == 0 {
            return Err("zarr_chunk_size must be > 0".to_string());
        }

        if self.zarr_compression_level == 0 || self.zarr_compression_level > 9 {
            return Err("zarr_compression_level must be 1-9".to_string());
        }

        if self.overview_min_dimension == 0 {
            return Err("overview_min_dimension must be > 0".to_string());
        }

        if !(0.0..=100.0).contains(&self.suitable_threshold) {
            return Err("suitable_threshold must be within 0-100".to_string());
        }

        Ok(())
    }

    /// Get the chunk cache size in bytes.
    pub fn chunk_cache_size_bytes(&self) -> usize {
        self.chunk_cache_size_mb * 1024 * 1024
    }

    /// Backoff policy for layer reads.
    pub fn read_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch_retries,
            initial_delay: Duration::from_millis(self.fetch_retry_delay_ms),
            ..Default::default()
        }
    }
}

/// Compression codec for Zarr files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ZarrCompression {
    /// No compression.
    None,
    /// Blosc with LZ4.
    BloscLz4,
    /// Blosc with Zstd (recommended).
    #[default]
    BloscZstd,
}

impl ZarrCompression {
    /// Parse from string (case-insensitive).
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "none" => Self::None,
            "lz4" | "blosc_lz4" => Self::BloscLz4,
            _ => Self::BloscZstd,
        }
    }

    /// Get the codec name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::BloscLz4 => "blosc_lz4",
            Self::BloscZstd => "blosc_zstd",
        }
    }
}

impl std::fmt::Display for ZarrCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//! Object storage settings and key layout for layers and results
//! (MinIO/S3 compatible).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration for object storage connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStorageConfig {
    /// S3/MinIO endpoint URL
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// AWS region (use "us-east-1" for MinIO)
    pub region: String,
    /// Allow HTTP (for local MinIO)
    pub allow_http: bool,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://minio:9000".to_string(),
            bucket: "suitability".to_string(),
            access_key_id: "minioadmin".to_string(),
            secret_access_key: "minioadmin".to_string(),
            region: "us-east-1".to_string(),
            allow_http: true,
        }
    }
}

impl ObjectStorageConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: std::env::var("S3_ENDPOINT").unwrap_or(defaults.endpoint),
            bucket: std::env::var("S3_BUCKET").unwrap_or(defaults.bucket),
            access_key_id: std::env::var("S3_ACCESS_KEY").unwrap_or(defaults.access_key_id),
            secret_access_key: std::env::var("S3_SECRET_KEY")
                .unwrap_or(defaults.secret_access_key),
            region: std::env::var("S3_REGION").unwrap_or(defaults.region),
            allow_http: std::env::var("S3_ALLOW_HTTP")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(defaults.allow_http),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.is_empty() {
            return Err("S3 endpoint must not be empty".to_string());
        }
        if self.bucket.is_empty() {
            return Err("S3 bucket must not be empty".to_string());
        }
        if self.endpoint.starts_with("http://") && !self.allow_http {
            return Err(format!(
                "endpoint {} uses plain HTTP but S3_ALLOW_HTTP is false",
                self.endpoint
            ));
        }
        Ok(())
    }
}

/// Path builder for consistent storage layout.
pub struct StoragePath;

impl StoragePath {
    /// Zarr group of a source layer.
    /// Format: layers/{storage_path}
    pub fn layer(storage_path: &str) -> String {
        format!("layers/{}", storage_path.trim_matches('/'))
    }

    /// Zarr V3 metadata document of a source layer.
    pub fn layer_metadata(storage_path: &str) -> String {
        format!("{}/zarr.json", Self::layer(storage_path))
    }

    /// Prefix holding every object of a job's result artifact.
    /// Format: results/{job_id}
    pub fn result_prefix(job_id: &Uuid) -> String {
        format!("results/{}", job_id)
    }

    /// Array path of one resolution level of a result.
    /// Format: results/{job_id}/{level}
    pub fn result_level(job_id: &Uuid, level: usize) -> String {
        format!("{}/{}", Self::result_prefix(job_id), level)
    }
}

//! Zarr store backends: MinIO/S3 for deployments, local filesystem for development.

use std::path::Path;
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use zarrs_filesystem::FilesystemStore;
use zarrs_object_store::AsyncObjectStore;
use zarrs_storage::storage_adapter::async_to_sync::{
    AsyncToSyncBlockOn, AsyncToSyncStorageAdapter,
};

use storage::ObjectStorageConfig;

use crate::error::{EngineError, Result};

/// Blocking executor usable from inside a tokio runtime.
///
/// Requires the multi-threaded runtime: `block_in_place` moves the current
/// task off the async worker before driving the future.
#[derive(Clone, Copy)]
pub struct TokioBlockOn;

impl AsyncToSyncBlockOn for TokioBlockOn {
    fn block_on<F: core::future::Future>(&self, future: F) -> F::Output {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
    }
}

pub type AsyncMinioStorage = AsyncObjectStore<object_store::aws::AmazonS3>;

/// Synchronous view over the S3 store, usable by the zarrs array API.
pub type MinioStorage = AsyncToSyncStorageAdapter<AsyncMinioStorage, TokioBlockOn>;

/// Create a MinIO/S3 backed Zarr store.
pub fn create_minio_storage(config: &ObjectStorageConfig) -> Result<Arc<MinioStorage>> {
    config.validate().map_err(EngineError::ConfigError)?;

    let s3 = AmazonS3Builder::new()
        .with_endpoint(&config.endpoint)
        .with_bucket_name(&config.bucket)
        .with_access_key_id(&config.access_key_id)
        .with_secret_access_key(&config.secret_access_key)
        .with_region(&config.region)
        .with_allow_http(config.allow_http)
        .build()
        .map_err(|e| EngineError::storage(format!("failed to create S3 client: {}", e)))?;

    let async_store = Arc::new(AsyncObjectStore::new(s3));
    Ok(Arc::new(AsyncToSyncStorageAdapter::new(async_store, TokioBlockOn)))
}

/// Create a Zarr store rooted at a local directory, creating it if needed.
pub fn create_filesystem_storage(root: impl AsRef<Path>) -> Result<Arc<FilesystemStore>> {
    let root = root.as_ref();
    std::fs::create_dir_all(root)
        .map_err(|e| EngineError::storage(format!("{}: {}", root.display(), e)))?;
    FilesystemStore::new(root)
        .map(Arc::new)
        .map_err(|e| EngineError::storage(format!("{}: {}", root.display(), e)))
}

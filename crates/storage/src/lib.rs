//! Storage abstractions for the site suitability services.
//!
//! Provides unified interfaces for:
//! - Object storage (MinIO/S3) settings and key layout
//! - PostgreSQL for analysis job records
//! - Redis Streams for the job dispatch queue
//! - The static layer catalog

pub mod catalog;
pub mod jobs;
pub mod object_store;
pub mod queue;

pub use self::object_store::{ObjectStorageConfig, StoragePath};
pub use catalog::LayerCatalog;
pub use jobs::{CancelOutcome, JobStore, MemoryJobStore, PgJobStore};
pub use queue::{Delivery, JobTicket, MemoryQueue, RedisJobQueue, WorkQueue};

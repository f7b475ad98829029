//! Chunk caching for layer reads.

mod chunk_cache;

pub use chunk_cache::{hash_path, ChunkCache, ChunkKey};

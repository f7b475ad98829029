//! LRU cache for decompressed layer chunks.
//!
//! Layers are read-only reference data shared by every job, so decoded
//! chunks can be reused across jobs whose AOIs touch the same tiles.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::CacheStats;

/// Cache key for chunks: (array_path_hash, chunk_x, chunk_y).
pub type ChunkKey = (u64, usize, usize);

/// Lower bound on cache entries regardless of memory budget.
const MIN_ENTRIES: usize = 16;

/// LRU cache for decompressed chunks with memory-bounded eviction.
pub struct ChunkCache {
    cache: LruCache<ChunkKey, Vec<f32>>,
    memory_limit: usize,
    current_memory: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ChunkCache {
    /// Create a cache bounded to `memory_limit` bytes of chunk data.
    pub fn new(memory_limit: usize) -> Self {
        // Assume 512x512 f32 chunks when sizing the entry table
        let chunk_size_estimate = 512 * 512 * 4;
        let max_entries = NonZeroUsize::new((memory_limit / chunk_size_estimate).max(MIN_ENTRIES))
            .unwrap_or(NonZeroUsize::MIN);

        Self {
            cache: LruCache::new(max_entries),
            memory_limit,
            current_memory: 0,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a chunk, updating LRU order and hit/miss counters.
    pub fn get(&mut self, key: &ChunkKey) -> Option<&Vec<f32>> {
        if let Some(data) = self.cache.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("raster_chunk_cache_hits_total").increment(1);
            Some(data)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("raster_chunk_cache_misses_total").increment(1);
            None
        }
    }

    /// Insert a chunk, evicting least recently used entries to stay in budget.
    ///
    /// Chunks larger than the whole budget are not cached.
    pub fn insert(&mut self, key: ChunkKey, data: Vec<f32>) {
        let data_size = data.len() * std::mem::size_of::<f32>();
        if data_size > self.memory_limit {
            return;
        }

        while self.current_memory + data_size > self.memory_limit && !self.cache.is_empty() {
            self.pop_lru();
        }

        if let Some((_, replaced)) = self.cache.push(key, data) {
            // Either an older value for `key` or an entry pushed out by the entry cap
            self.current_memory = self
                .current_memory
                .saturating_sub(replaced.len() * std::mem::size_of::<f32>());
        }
        self.current_memory += data_size;
    }

    fn pop_lru(&mut self) {
        if let Some((_, evicted)) = self.cache.pop_lru() {
            let evicted_size = evicted.len() * std::mem::size_of::<f32>();
            self.current_memory = self.current_memory.saturating_sub(evicted_size);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.len(),
            memory_bytes: self.current_memory as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.current_memory = 0;
    }

    pub fn memory_usage(&self) -> usize {
        self.current_memory
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Hash of an array path, used to keep chunks of different layers apart.
pub fn hash_path(path: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

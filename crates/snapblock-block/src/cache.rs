//! Block cache for remote snapshot blocks
//!
//! The export protocol transfers much smaller units than a remote block, so
//! consecutive requests keep landing on the same few blocks. Entries are
//! bounded by count and evicted with moka's TinyLFU admission over an LRU
//! window, which keeps both recently fetched blocks and frequently revisited
//! ones. Eviction only costs a re-fetch.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use moka::future::Cache;
use tracing::trace;

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Number of blocks inserted
    pub inserts: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Bounded map of block index → block bytes
pub struct BlockCache {
    entries: Cache<u64, Bytes>,
    capacity: u64,
    stats: CacheStats,
}

impl BlockCache {
    /// Create a cache holding at most `capacity` blocks (minimum 1)
    pub fn new(capacity: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Cache::builder().max_capacity(capacity).build(),
            capacity,
            stats: CacheStats::default(),
        }
    }

    /// Look up a block
    pub async fn get(&self, block_index: u64) -> Option<Bytes> {
        let hit = self.entries.get(&block_index).await;
        if hit.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            trace!("block cache hit: block={block_index}");
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Look up a block without counting a hit or miss
    pub async fn peek(&self, block_index: u64) -> Option<Bytes> {
        self.entries.get(&block_index).await
    }

    /// Insert a fully fetched block
    pub async fn insert(&self, block_index: u64, data: Bytes) {
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(block_index, data).await;
    }

    /// Maximum number of cached blocks
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Approximate number of cached blocks
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Apply pending evictions so `entry_count` is exact
    pub async fn sync(&self) {
        self.entries.run_pending_tasks().await;
    }
}

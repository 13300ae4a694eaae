//! Per-region cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for one cache region. Updated without locking.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
    removals: AtomicU64,
}

impl CacheStats {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn removed(&self, n: u64) {
        self.removals.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, size: usize) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            size,
        }
    }
}

/// Point-in-time copy of [`CacheStats`]. Counts are approximate under concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    /// Entries dropped by size, idle or ttl limits.
    pub evictions: u64,
    /// Entries dropped by write invalidation or explicit removal.
    pub removals: u64,
    pub size: usize,
}

impl CacheStatsSnapshot {
    /// Hit rate as a fraction (0.0–1.0). Returns 0.0 when there were no lookups.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

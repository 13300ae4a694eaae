//! Statement caching for generated plans.
//!
//! Plans are keyed by their shape hash, so repeated queries (and lazy-load
//! batches padded to the same size) reuse generated SQL instead of rebuilding
//! it. The cache is shared by every flow of a server.

use crate::plan::QueryPlan;
use beanorm_core::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug)]
struct CachedStatement {
    plan: Arc<QueryPlan>,
    last_used: Instant,
    hit_count: u64,
}

/// LRU-style cache for generated plans.
///
/// When the cache exceeds `max_size`, the least-recently-used entry is evicted.
///
/// ```
/// use beanorm_query::StatementCache;
///
/// let cache = StatementCache::new(100);
/// assert!(cache.is_empty());
/// ```
#[derive(Debug)]
pub struct StatementCache {
    cache: Mutex<HashMap<u64, CachedStatement>>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StatementCache {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: Mutex::new(HashMap::with_capacity(max_size.min(256))),
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get a cached plan or build and insert it.
    ///
    /// The `builder` closure is only called on cache miss. Build errors are
    /// returned and nothing is cached.
    pub fn get_or_build(
        &self,
        key: u64,
        builder: impl FnOnce() -> Result<QueryPlan>,
    ) -> Result<Arc<QueryPlan>> {
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.get_mut(&key) {
                entry.last_used = Instant::now();
                entry.hit_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&entry.plan));
            }
        }

        // Build outside the lock; a racing builder for the same key just loses.
        let plan = Arc::new(builder()?);
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(key, sql = %plan.sql, "Statement cache miss");

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if !cache.contains_key(&key) && cache.len() >= self.max_size {
            Self::evict_lru(&mut cache);
        }
        let entry = cache.entry(key).or_insert_with(|| CachedStatement {
            plan,
            last_used: Instant::now(),
            hit_count: 0,
        });
        Ok(Arc::clone(&entry.plan))
    }

    /// Check if a plan is cached.
    pub fn contains(&self, key: u64) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Clear all cached plans.
    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn evict_lru(cache: &mut HashMap<u64, CachedStatement>) {
        if let Some((&lru_key, _)) = cache.iter().min_by_key(|(_, entry)| entry.last_used) {
            cache.remove(&lru_key);
        }
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

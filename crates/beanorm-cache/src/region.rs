//! One concurrent cache space with lazy size/idle/ttl eviction.

use crate::clock::Clock;
use crate::stats::{CacheStats, CacheStatsSnapshot};
use beanorm_core::CachePolicy;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted: Instant,
    last_access: Instant,
    /// Insertion sequence; matches the entry's slot in the order queue.
    seq: u64,
}

/// A concurrent key/value cache region.
///
/// Single-key `get`/`put`/`remove` need no external locking. Expiry is
/// checked on access: an entry past its idle or ttl limit is dropped by the
/// lookup that finds it. Overflowing `max_size` drops the oldest-inserted
/// entries. Sizes are approximate while puts race.
#[derive(Debug)]
pub struct CacheRegion<K, V>
where
    K: Eq + Hash,
{
    name: String,
    policy: CachePolicy,
    map: DashMap<K, Entry<V>>,
    order: Mutex<VecDeque<(K, u64)>>,
    seq: AtomicU64,
    stats: CacheStats,
    clock: Arc<dyn Clock>,
}

impl<K, V> CacheRegion<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: impl Into<String>, policy: CachePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            policy,
            map: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            seq: AtomicU64::new(0),
            stats: CacheStats::default(),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        if let Some(ttl) = self.policy.ttl_limit() {
            if now.saturating_duration_since(entry.inserted) > ttl {
                return true;
            }
        }
        if let Some(idle) = self.policy.idle_limit() {
            if now.saturating_duration_since(entry.last_access) > idle {
                return true;
            }
        }
        false
    }

    /// Look up a key, refreshing its idle timer on hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let expired = match self.map.get_mut(key) {
            None => false,
            Some(mut entry) => {
                if self.is_expired(&entry, now) {
                    true
                } else {
                    entry.last_access = now;
                    self.stats.hit();
                    return Some(entry.value.clone());
                }
            }
        };
        if expired
            && self
                .map
                .remove_if(key, |_, entry| self.is_expired(entry, now))
                .is_some()
        {
            self.stats.evicted(1);
            tracing::trace!(region = %self.name, "Cache entry expired on access");
        }
        self.stats.miss();
        None
    }

    /// Insert or replace an entry, then enforce the size limit.
    pub fn put(&self, key: K, value: V) {
        let now = self.clock.now();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.map.insert(
            key.clone(),
            Entry {
                value,
                inserted: now,
                last_access: now,
                seq,
            },
        );
        self.stats.put();

        // Unbounded regions never evict by size, so no insertion order is kept.
        let max = self.policy.max_size;
        if max == 0 {
            return;
        }
        let mut order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        order.push_back((key, seq));
        let mut evicted = 0;
        while self.map.len() > max {
            let Some((old_key, old_seq)) = order.pop_front() else {
                break;
            };
            if self
                .map
                .remove_if(&old_key, |_, entry| entry.seq == old_seq)
                .is_some()
            {
                evicted += 1;
            }
        }
        // Replaced and removed keys leave stale slots behind.
        if order.len() > max.saturating_mul(2) + 16 {
            order.retain(|(k, s)| self.map.get(k).is_some_and(|e| e.seq == *s));
        }
        drop(order);
        if evicted > 0 {
            self.stats.evicted(evicted);
            tracing::debug!(region = %self.name, evicted, "Cache size limit reached");
        }
    }

    pub fn remove(&self, key: &K) -> bool {
        let removed = self.map.remove(key).is_some();
        if removed {
            self.stats.removed(1);
        }
        removed
    }

    /// Drop every entry.
    pub fn remove_all(&self) -> usize {
        let n = self.map.len();
        self.map.clear();
        self.order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.stats.removed(n as u64);
        n
    }

    /// Keep only entries for which `keep` returns true. Returns the number removed.
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        let before = self.map.len();
        self.map.retain(|k, entry| keep(k, &entry.value));
        let removed = before.saturating_sub(self.map.len());
        self.stats.removed(removed as u64);
        removed
    }

    /// Sweep expired entries. Optional; lookups already drop what they find expired.
    pub fn trim(&self) -> usize {
        let now = self.clock.now();
        let before = self.map.len();
        self.map.retain(|_, entry| !self.is_expired(entry, now));
        let trimmed = before.saturating_sub(self.map.len());
        self.stats.evicted(trimmed as u64);
        trimmed
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot(self.map.len())
    }
}

//! Server-wide caches: beans by id, query results by plan, natural key to id.

use crate::clock::{Clock, SystemClock};
use crate::region::CacheRegion;
use crate::stats::CacheStatsSnapshot;
use beanorm_core::{
    BeanSnapshot, CachePolicy, ChangeEvent, DescriptorRegistry, EntityId, ServerConfig, Value,
};
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Query-cache key: the plan shape and the bound values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryCacheKey {
    pub entity: &'static str,
    pub plan_hash: u64,
    pub bind_hash: u64,
}

impl QueryCacheKey {
    pub fn new(entity: &'static str, plan_hash: u64, bind_hash: u64) -> Self {
        Self {
            entity,
            plan_hash,
            bind_hash,
        }
    }
}

/// A cached query result.
#[derive(Debug, Clone)]
pub enum QueryResultSnapshot {
    /// Bean list in result order.
    Beans(Vec<Arc<BeanSnapshot>>),
    Ids(Vec<EntityId>),
    Count(u64),
}

impl QueryResultSnapshot {
    pub fn len(&self) -> usize {
        match self {
            QueryResultSnapshot::Beans(beans) => beans.len(),
            QueryResultSnapshot::Ids(ids) => ids.len(),
            QueryResultSnapshot::Count(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Natural-key cache key. Integer widths compare equal, like ids do.
#[derive(Debug, Clone)]
pub struct NaturalKey(pub Value);

impl PartialEq for NaturalKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.key_eq(&other.0)
    }
}

impl Eq for NaturalKey {}

impl Hash for NaturalKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_key(state);
    }
}

/// Statistics of the three regions of one entity type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityCacheStats {
    pub beans: CacheStatsSnapshot,
    pub queries: CacheStatsSnapshot,
    pub natural_keys: CacheStatsSnapshot,
}

#[derive(Debug)]
struct EntityCaches {
    policy: CachePolicy,
    natural_key: Option<usize>,
    beans: Option<CacheRegion<EntityId, Arc<BeanSnapshot>>>,
    queries: Option<CacheRegion<QueryCacheKey, Arc<QueryResultSnapshot>>>,
    natural: Option<CacheRegion<NaturalKey, EntityId>>,
}

/// The bean, query and natural-key caches of a server.
///
/// Regions are created at startup for every entity type whose effective
/// policy enables them; operations on other types are no-ops returning
/// misses. Lookups and puts never take a manager-wide lock.
#[derive(Debug)]
pub struct CacheManager {
    entities: HashMap<&'static str, EntityCaches>,
}

impl CacheManager {
    pub fn new(registry: &DescriptorRegistry, config: &ServerConfig) -> Self {
        Self::with_clock(registry, config, Arc::new(SystemClock))
    }

    /// Build with an explicit time source.
    pub fn with_clock(
        registry: &DescriptorRegistry,
        config: &ServerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut entities = HashMap::new();
        for desc in registry.iter() {
            let policy = config.cache_policy_for(desc.name, desc.cache_policy.as_ref());
            let natural_key = desc.natural_key_property().map(|p| p.index);
            let beans = policy.bean_cache.then(|| {
                CacheRegion::new(format!("{}.bean", desc.name), policy.clone(), clock.clone())
            });
            let queries = policy.query_cache.then(|| {
                CacheRegion::new(format!("{}.query", desc.name), policy.clone(), clock.clone())
            });
            let natural = (policy.bean_cache && natural_key.is_some()).then(|| {
                CacheRegion::new(
                    format!("{}.natural", desc.name),
                    policy.clone(),
                    clock.clone(),
                )
            });
            if policy.is_cached() {
                tracing::debug!(
                    entity = desc.name,
                    bean_cache = policy.bean_cache,
                    query_cache = policy.query_cache,
                    read_only = policy.read_only,
                    max_size = policy.max_size,
                    "Cache regions configured"
                );
            }
            entities.insert(
                desc.name,
                EntityCaches {
                    policy,
                    natural_key,
                    beans,
                    queries,
                    natural,
                },
            );
        }
        Self { entities }
    }

    /// Effective policy of an entity type.
    pub fn policy(&self, entity: &str) -> Option<&CachePolicy> {
        self.entities.get(entity).map(|e| &e.policy)
    }

    pub fn bean_cache_enabled(&self, entity: &str) -> bool {
        self.entities.get(entity).is_some_and(|e| e.beans.is_some())
    }

    pub fn query_cache_enabled(&self, entity: &str) -> bool {
        self.entities.get(entity).is_some_and(|e| e.queries.is_some())
    }

    /// Hits of this type may be handed out as shared instances.
    pub fn is_read_only(&self, entity: &str) -> bool {
        self.entities.get(entity).is_some_and(|e| e.policy.read_only)
    }

    // ==================== Bean cache ====================

    pub fn bean_get(&self, entity: &str, id: &EntityId) -> Option<Arc<BeanSnapshot>> {
        let region = self.entities.get(entity)?.beans.as_ref()?;
        let hit = region.get(id);
        tracing::debug!(entity, id = %id, hit = hit.is_some(), "Bean cache lookup");
        hit
    }

    /// Cache a bean snapshot and, when it carries the natural key, its mapping.
    pub fn bean_put(&self, snapshot: Arc<BeanSnapshot>) {
        let Some(caches) = self.entities.get(snapshot.entity) else {
            return;
        };
        let Some(region) = caches.beans.as_ref() else {
            return;
        };
        if let (Some(index), Some(natural)) = (caches.natural_key, caches.natural.as_ref()) {
            let loaded = snapshot
                .loaded
                .as_ref()
                .is_none_or(|set: &BTreeSet<usize>| set.contains(&index));
            if let Some(value) = snapshot.values.get(index).filter(|v| loaded && !v.is_null()) {
                natural.put(NaturalKey(value.clone()), snapshot.id.clone());
            }
        }
        tracing::trace!(entity = snapshot.entity, id = %snapshot.id, "Bean cache put");
        region.put(snapshot.id.clone(), snapshot);
    }

    pub fn bean_remove(&self, entity: &str, id: &EntityId) -> bool {
        self.entities
            .get(entity)
            .and_then(|e| e.beans.as_ref())
            .is_some_and(|r| r.remove(id))
    }

    pub fn bean_remove_all(&self, entity: &str) -> usize {
        self.entities
            .get(entity)
            .and_then(|e| e.beans.as_ref())
            .map_or(0, CacheRegion::remove_all)
    }

    // ==================== Query cache ====================

    pub fn query_get(&self, key: &QueryCacheKey) -> Option<Arc<QueryResultSnapshot>> {
        let region = self.entities.get(key.entity)?.queries.as_ref()?;
        let hit = region.get(key);
        tracing::debug!(
            entity = key.entity,
            plan = key.plan_hash,
            hit = hit.is_some(),
            "Query cache lookup"
        );
        hit
    }

    pub fn query_put(&self, key: QueryCacheKey, result: QueryResultSnapshot) {
        if let Some(region) = self
            .entities
            .get(key.entity)
            .and_then(|e| e.queries.as_ref())
        {
            region.put(key, Arc::new(result));
        }
    }

    /// Drop every cached query result of an entity type.
    pub fn query_clear(&self, entity: &str) -> usize {
        self.entities
            .get(entity)
            .and_then(|e| e.queries.as_ref())
            .map_or(0, CacheRegion::remove_all)
    }

    // ==================== Natural-key cache ====================

    pub fn natural_get(&self, entity: &str, value: &Value) -> Option<EntityId> {
        let region = self.entities.get(entity)?.natural.as_ref()?;
        region.get(&NaturalKey(value.clone()))
    }

    pub fn natural_put(&self, entity: &str, value: Value, id: EntityId) {
        if let Some(region) = self.entities.get(entity).and_then(|e| e.natural.as_ref()) {
            region.put(NaturalKey(value), id);
        }
    }

    /// Drop every natural key mapping to `id`.
    pub fn natural_remove_id(&self, entity: &str, id: &EntityId) -> usize {
        self.entities
            .get(entity)
            .and_then(|e| e.natural.as_ref())
            .map_or(0, |r| r.retain(|_, mapped| mapped != id))
    }

    /// Natural-key property index of a type whose natural-key cache is active.
    pub fn natural_key_index(&self, entity: &str) -> Option<usize> {
        let caches = self.entities.get(entity)?;
        caches.natural.as_ref().and(caches.natural_key)
    }

    // ==================== Write side ====================

    /// Apply the writes of a committed transaction.
    ///
    /// Written ids leave the bean and natural-key caches; every written type
    /// loses its whole query cache.
    pub fn on_commit(&self, events: &[ChangeEvent]) {
        let mut cleared: Vec<&'static str> = Vec::new();
        for event in events {
            self.bean_remove(event.entity, &event.id);
            self.natural_remove_id(event.entity, &event.id);
            if !cleared.contains(&event.entity) {
                cleared.push(event.entity);
                let dropped = self.query_clear(event.entity);
                if dropped > 0 {
                    tracing::debug!(entity = event.entity, dropped, "Query cache invalidated");
                }
            }
        }
    }

    /// Sweep expired entries from every region.
    pub fn trim(&self) -> usize {
        let mut trimmed = 0;
        for caches in self.entities.values() {
            if let Some(r) = &caches.beans {
                trimmed += r.trim();
            }
            if let Some(r) = &caches.queries {
                trimmed += r.trim();
            }
            if let Some(r) = &caches.natural {
                trimmed += r.trim();
            }
        }
        if trimmed > 0 {
            tracing::debug!(trimmed, "Cache trim");
        }
        trimmed
    }

    pub fn stats(&self, entity: &str) -> Option<EntityCacheStats> {
        let caches = self.entities.get(entity)?;
        Some(EntityCacheStats {
            beans: caches.beans.as_ref().map(|r| r.stats()).unwrap_or_default(),
            queries: caches.queries.as_ref().map(|r| r.stats()).unwrap_or_default(),
            natural_keys: caches.natural.as_ref().map(|r| r.stats()).unwrap_or_default(),
        })
    }
}

//! Lazy-load batching.
//!
//! Beans with unloaded data are queued per [`BatchKey`] when they are
//! materialized. Touching one of them through [`Engine::ensure_loaded`]
//! drains the queue: the requesting bean plus whatever else is pending for the
//! same key, up to the batch size, is loaded with a single query.
//!
//! Id lists are padded to a canonical size (repeating the last id) so every
//! batch of a key shares one plan and one generated statement.

use crate::context::{ContextHandle, PersistenceContext};
use crate::engine::Engine;
use crate::load::LoadOptions;
use crate::transaction::Transaction;
use beanorm_core::{
    BatchIntegrityError, BeanRef, BeanSnapshot, Cx, EntityDescriptor, EntityId, Error, Outcome,
    PropertyKind, Result, Statement, Value, WeakBeanRef, try_outcome, try_result,
};
use beanorm_query::{PlanKind, Query, bind_values, ids_predicate};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Batch sizes ids are padded to.
pub const CANONICAL_BATCH_SIZES: [usize; 8] = [1, 5, 10, 20, 50, 100, 200, 500];

/// Round `n` up to the next canonical batch size. Demands above the largest
/// size are served in chunks of the largest size.
pub fn canonical_batch_size(n: usize) -> usize {
    CANONICAL_BATCH_SIZES
        .iter()
        .copied()
        .find(|&size| size >= n)
        .unwrap_or(CANONICAL_BATCH_SIZES[CANONICAL_BATCH_SIZES.len() - 1])
}

/// Pad an id list to `target` entries by repeating the last id.
pub fn pad_ids(mut ids: Vec<Vec<Value>>, target: usize) -> Vec<Vec<Value>> {
    if let Some(last) = ids.last().cloned() {
        while ids.len() < target {
            ids.push(last.clone());
        }
    }
    ids
}

/// What a queued load fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKey {
    /// Unloaded scalar properties of beans of one type.
    BeanRefresh(&'static str),
    /// One to-many collection of one owner type.
    Association {
        entity: &'static str,
        property: &'static str,
    },
}

impl BatchKey {
    pub fn entity(&self) -> &'static str {
        match self {
            BatchKey::BeanRefresh(entity) | BatchKey::Association { entity, .. } => entity,
        }
    }
}

#[derive(Debug)]
struct Waiter {
    bean: WeakBeanRef,
    origin: ContextHandle,
    batch_size: Option<usize>,
}

#[derive(Debug, Default)]
struct PendingBatch {
    waiters: VecDeque<Waiter>,
}

#[derive(Debug, Default)]
struct KeyCounters {
    batches: AtomicU64,
    ids: AtomicU64,
    rows: AtomicU64,
    single_loads: AtomicU64,
}

/// Load statistics of one batch key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LazyLoadStats {
    /// Queries issued.
    pub batches: u64,
    /// Distinct ids requested across all batches.
    pub ids: u64,
    /// Rows returned.
    pub rows: u64,
    /// Batches that carried a single id.
    pub single_loads: u64,
}

/// Server-wide pending-load queues.
///
/// Enqueueing is concurrent; each drain takes its waiters out of the queue
/// under the key's mutex, so a waiter is loaded by one drain only. Waiters are
/// held weakly and only drained by a flow of the context that queued them, or
/// by any flow once that context has ended.
#[derive(Debug)]
pub struct LazyLoader {
    pending: DashMap<BatchKey, Mutex<PendingBatch>>,
    counters: DashMap<BatchKey, KeyCounters>,
    max_pending: usize,
    n1_threshold: usize,
}

impl LazyLoader {
    pub fn new(max_pending: usize, n1_threshold: usize) -> Self {
        Self {
            pending: DashMap::new(),
            counters: DashMap::new(),
            max_pending: max_pending.max(1),
            n1_threshold,
        }
    }

    fn with_batch<R>(&self, key: BatchKey, f: impl FnOnce(&mut PendingBatch) -> R) -> R {
        if let Some(batch) = self.pending.get(&key) {
            let mut guard = batch.lock().unwrap_or_else(|e| e.into_inner());
            return f(&mut guard);
        }
        let batch = self.pending.entry(key).or_default();
        let mut guard = batch.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Queue a bean for a later batched load.
    pub fn enqueue(
        &self,
        key: BatchKey,
        bean: &BeanRef,
        origin: ContextHandle,
        batch_size: Option<usize>,
    ) {
        let max = self.max_pending;
        let dropped = self.with_batch(key, |batch| {
            let mut dropped = 0;
            while batch.waiters.len() >= max {
                batch.waiters.pop_front();
                dropped += 1;
            }
            batch.waiters.push_back(Waiter {
                bean: bean.downgrade(),
                origin,
                batch_size,
            });
            dropped
        });
        if dropped > 0 {
            tracing::warn!(
                ?key,
                dropped,
                max_pending = max,
                "Lazy-load queue full; oldest requests dropped"
            );
        }
    }

    /// Live waiters queued under `key`.
    pub fn pending(&self, key: BatchKey) -> usize {
        self.pending.get(&key).map_or(0, |batch| {
            batch
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .waiters
                .iter()
                .filter(|w| w.bean.is_alive())
                .count()
        })
    }

    /// The batch size hint `bean` was queued with under `key`, if any.
    fn hint_for(&self, key: BatchKey, bean: &BeanRef) -> Option<usize> {
        let batch = self.pending.get(&key)?;
        let guard = batch.lock().unwrap_or_else(|e| e.into_inner());
        let addr = bean.addr();
        guard
            .waiters
            .iter()
            .filter(|w| w.bean.addr() == addr)
            .find_map(|w| w.batch_size)
    }

    /// Take up to `limit` waiters eligible for `context` that still need
    /// loading. Dead and already-loaded waiters are pruned on the way.
    fn take(
        &self,
        key: BatchKey,
        context: &PersistenceContext,
        limit: usize,
        exclude: &HashSet<usize>,
        needs_load: impl Fn(&BeanRef) -> bool,
    ) -> Vec<(BeanRef, Option<usize>)> {
        if self.pending.get(&key).is_none() {
            return Vec::new();
        }
        self.with_batch(key, |batch| {
            let mut taken = Vec::new();
            let mut seen = exclude.clone();
            let mut kept = VecDeque::with_capacity(batch.waiters.len());
            while let Some(waiter) = batch.waiters.pop_front() {
                let Some(bean) = waiter.bean.upgrade() else {
                    continue;
                };
                if !needs_load(&bean) {
                    continue;
                }
                let eligible = waiter.origin.refers_to(context) || waiter.origin.is_closed();
                if taken.len() >= limit || !eligible {
                    kept.push_back(waiter);
                    continue;
                }
                if seen.insert(bean.addr()) {
                    taken.push((bean, waiter.batch_size));
                }
            }
            batch.waiters = kept;
            taken
        })
    }

    fn record(&self, key: BatchKey, ids: usize, rows: usize) {
        let counters = self.counters.entry(key).or_default();
        counters.batches.fetch_add(1, Ordering::Relaxed);
        counters.ids.fetch_add(ids as u64, Ordering::Relaxed);
        counters.rows.fetch_add(rows as u64, Ordering::Relaxed);
        if ids == 1 {
            let singles = counters.single_loads.fetch_add(1, Ordering::Relaxed) + 1;
            if self.n1_threshold > 0 && singles == self.n1_threshold as u64 {
                tracing::warn!(
                    target: "beanorm::n1",
                    ?key,
                    single_loads = singles,
                    threshold = self.n1_threshold,
                    "N+1 load pattern detected; consider prefetch or a larger lazy batch size"
                );
            }
        }
    }

    pub fn stats(&self, key: BatchKey) -> LazyLoadStats {
        self.counters
            .get(&key)
            .map(|c| LazyLoadStats {
                batches: c.batches.load(Ordering::Relaxed),
                ids: c.ids.load(Ordering::Relaxed),
                rows: c.rows.load(Ordering::Relaxed),
                single_loads: c.single_loads.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }
}

fn needs_refresh(bean: &BeanRef) -> bool {
    let guard = bean.read();
    !guard.is_fully_loaded() && !guard.is_new() && !guard.is_deleted()
}

fn needs_collection(index: usize) -> impl Fn(&BeanRef) -> bool {
    move |bean| {
        let guard = bean.read();
        !guard.is_loaded_at(index) && !guard.is_new() && !guard.is_deleted()
    }
}

impl Engine {
    /// Make `property` of `bean` available, loading it together with other
    /// pending beans of the same key.
    #[tracing::instrument(level = "debug", skip(self, cx, tx, bean), fields(entity = bean.entity()))]
    pub async fn ensure_loaded(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        bean: &BeanRef,
        property: &str,
    ) -> Outcome<(), Error> {
        let (desc, index, loaded) = {
            let guard = bean.read();
            let desc = Arc::clone(guard.descriptor());
            let index = try_result!(desc.property_index(property));
            let loaded = guard.is_new() || guard.is_loaded_at(index);
            (desc, index, loaded)
        };
        if loaded {
            return Outcome::Ok(());
        }
        match desc.property_at(index).kind {
            PropertyKind::ToMany { .. } => self.load_collection(cx, tx, &desc, index, bean).await,
            _ => self.refresh_now(cx, tx, &desc, bean).await,
        }
    }

    /// Load every unloaded property of `bean`.
    pub async fn ensure_bean_loaded(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        bean: &BeanRef,
    ) -> Outcome<(), Error> {
        if !needs_refresh(bean) {
            return Outcome::Ok(());
        }
        let desc = Arc::clone(bean.read().descriptor());
        self.refresh_now(cx, tx, &desc, bean).await
    }

    /// The bean a to-one association points at, loaded.
    ///
    /// A bean assigned with `set_association` and not yet saved is returned as is.
    pub async fn find_one(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        bean: &BeanRef,
        property: &str,
    ) -> Outcome<Option<BeanRef>, Error> {
        try_outcome!(self.ensure_loaded(cx, tx, bean, property).await);
        let (target, fk, pending) = {
            let guard = bean.read();
            let desc = guard.descriptor();
            let index = try_result!(desc.property_index(property));
            let PropertyKind::ToOne { target } = desc.property_at(index).kind else {
                return Outcome::Err(Error::Custom(format!(
                    "{}.{property} is not a to-one association",
                    desc.name
                )));
            };
            (
                target,
                guard.value_at(index).clone(),
                guard.association(property).cloned(),
            )
        };
        if let Some(pending) = pending {
            return Outcome::Ok(Some(pending));
        }
        if fk.is_null() {
            return Outcome::Ok(None);
        }
        let target_bean = try_result!(self.resolve_reference(
            tx,
            target,
            EntityId::from(fk),
            &LoadOptions::default()
        ));
        try_outcome!(self.ensure_bean_loaded(cx, tx, &target_bean).await);
        Outcome::Ok(Some(target_bean))
    }

    /// Load everything pending under `key` for this transaction, in
    /// full-size chunks. Returns the number of beans loaded.
    #[tracing::instrument(level = "debug", skip(self, cx, tx))]
    pub async fn drain_all(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        key: BatchKey,
    ) -> Outcome<usize, Error> {
        let desc = Arc::clone(try_result!(self.descriptor(key.entity())));
        let waiters = match key {
            BatchKey::BeanRefresh(_) => {
                self.lazy()
                    .take(key, tx.context(), usize::MAX, &HashSet::new(), needs_refresh)
            }
            BatchKey::Association { property, .. } => {
                let index = try_result!(desc.property_index(property));
                self.lazy().take(
                    key,
                    tx.context(),
                    usize::MAX,
                    &HashSet::new(),
                    needs_collection(index),
                )
            }
        };
        if waiters.is_empty() {
            return Outcome::Ok(0);
        }
        let hint = waiters.iter().find_map(|(_, size)| *size);
        let target = canonical_batch_size(self.batch_size_for(desc.name, hint));
        let beans: Vec<BeanRef> = waiters.into_iter().map(|(b, _)| b).collect();
        let count = beans.len();
        match key {
            BatchKey::BeanRefresh(_) => {
                try_outcome!(self.refresh_batch(cx, tx, &desc, beans, target).await);
            }
            BatchKey::Association { property, .. } => {
                let index = try_result!(desc.property_index(property));
                try_outcome!(self.load_collections(cx, tx, &desc, index, beans, target).await);
            }
        }
        Outcome::Ok(count)
    }

    async fn refresh_now(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        desc: &Arc<EntityDescriptor>,
        bean: &BeanRef,
    ) -> Outcome<(), Error> {
        let key = BatchKey::BeanRefresh(desc.name);
        let hint = self.lazy().hint_for(key, bean);
        let target = canonical_batch_size(self.batch_size_for(desc.name, hint));
        let exclude = HashSet::from([bean.addr()]);
        let mut beans = vec![bean.clone()];
        beans.extend(
            self.lazy()
                .take(key, tx.context(), target - 1, &exclude, needs_refresh)
                .into_iter()
                .map(|(b, _)| b),
        );
        self.refresh_batch(cx, tx, desc, beans, target).await
    }

    async fn load_collection(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        desc: &Arc<EntityDescriptor>,
        index: usize,
        bean: &BeanRef,
    ) -> Outcome<(), Error> {
        let key = BatchKey::Association {
            entity: desc.name,
            property: desc.property_at(index).name,
        };
        let hint = self.lazy().hint_for(key, bean);
        let target = canonical_batch_size(self.batch_size_for(desc.name, hint));
        let exclude = HashSet::from([bean.addr()]);
        let mut owners = vec![bean.clone()];
        owners.extend(
            self.lazy()
                .take(key, tx.context(), target - 1, &exclude, needs_collection(index))
                .into_iter()
                .map(|(b, _)| b),
        );
        self.load_collections(cx, tx, desc, index, owners, target).await
    }

    /// Refresh `beans` by id. Nothing is applied unless every distinct id was found.
    async fn refresh_batch(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        desc: &Arc<EntityDescriptor>,
        beans: Vec<BeanRef>,
        target: usize,
    ) -> Outcome<(), Error> {
        let key = BatchKey::BeanRefresh(desc.name);
        let mut ids: Vec<EntityId> = Vec::new();
        let mut waiters: HashMap<EntityId, Vec<BeanRef>> = HashMap::new();
        for bean in beans {
            let id = bean.read().id();
            let slot = waiters.entry(id.clone()).or_default();
            if slot.is_empty() {
                ids.push(id);
            }
            slot.push(bean);
        }

        let mut fetched: HashMap<EntityId, Vec<Value>> = HashMap::with_capacity(ids.len());
        let mut row_count = 0;
        for chunk in ids.chunks(target) {
            let id_values = try_result!(
                chunk
                    .iter()
                    .map(|id| desc.id_values(id))
                    .collect::<Result<Vec<_>>>()
            );
            let query = Query::new(desc.name).filter(ids_predicate(desc, &pad_ids(id_values, target)));
            let plan = try_result!(self.plan(&query, PlanKind::Select));
            let binds = try_result!(bind_values(desc, &query, self.types()));
            let rows = try_outcome!(tx.query(cx, &Statement::new(Arc::clone(&plan.sql), binds)).await);
            row_count += rows.len();
            for row in &rows {
                let values = try_result!(self.read_values(desc, &plan, row));
                fetched.insert(desc.id_from_values(&values), values);
            }
            self.lazy().record(key, chunk.len(), rows.len());
        }

        let missing: Vec<EntityId> = ids
            .iter()
            .filter(|id| !fetched.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            tracing::warn!(
                entity = desc.name,
                requested = ids.len(),
                found = ids.len() - missing.len(),
                "Lazy-load batch incomplete"
            );
            return Outcome::Err(Error::BatchIntegrity(BatchIntegrityError {
                entity: desc.name,
                requested: ids.len(),
                found: ids.len() - missing.len(),
                missing,
            }));
        }

        let cacheable =
            self.cache().bean_cache_enabled(desc.name) && !tx.has_written(desc.name);
        let options = LoadOptions::default();
        for (id, values) in fetched {
            let Some(beans) = waiters.remove(&id) else {
                continue;
            };
            for bean in &beans {
                bean.write().merge_fetched(&values, None);
                tx.context_mut().put(bean.clone());
                try_result!(self.after_load(tx, desc, bean, &options));
            }
            if cacheable {
                self.cache().bean_put(Arc::new(BeanSnapshot {
                    entity: desc.name,
                    id,
                    values: Arc::new(values),
                    loaded: None,
                }));
            }
        }
        tracing::debug!(entity = desc.name, ids = ids.len(), rows = row_count, "Beans refreshed");
        Outcome::Ok(())
    }

    /// Load collection `index` of every owner with one query per chunk.
    async fn load_collections(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        desc: &Arc<EntityDescriptor>,
        index: usize,
        owners: Vec<BeanRef>,
        target: usize,
    ) -> Outcome<(), Error> {
        let property = desc.property_at(index);
        let PropertyKind::ToMany { target: child_entity, mapped_by } = property.kind else {
            return Outcome::Err(Error::Custom(format!(
                "{}.{} is not a collection",
                desc.name, property.name
            )));
        };
        let key = BatchKey::Association {
            entity: desc.name,
            property: property.name,
        };
        let child_desc = Arc::clone(try_result!(self.descriptor(child_entity)));
        let fk_index = try_result!(child_desc.property_index(mapped_by));

        let mut owner_ids: Vec<EntityId> = Vec::new();
        let mut by_id: HashMap<EntityId, Vec<BeanRef>> = HashMap::new();
        for owner in owners {
            let id = owner.read().id();
            if id.is_null() {
                continue;
            }
            let owner = tx.context_mut().put(owner);
            let slot = by_id.entry(id.clone()).or_default();
            if slot.is_empty() {
                owner_ids.push(id);
            }
            if !slot.iter().any(|b| BeanRef::ptr_eq(b, &owner)) {
                slot.push(owner);
            }
        }

        let options = LoadOptions::default();
        let mut children: HashMap<EntityId, Vec<BeanRef>> = HashMap::new();
        for chunk in owner_ids.chunks(target) {
            let fk_values: Vec<Value> = try_result!(
                chunk
                    .iter()
                    .map(|id| {
                        id.as_single().cloned().ok_or_else(|| {
                            Error::Custom(format!(
                                "{}.{} cannot be loaded for composite id {id}",
                                desc.name, property.name
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            );
            let mut padded = fk_values;
            if let Some(last) = padded.last().cloned() {
                padded.resize(target, last);
            }
            let mut query = Query::new(child_entity).where_in(mapped_by, padded);
            for &i in child_desc.id_indexes() {
                query = query.order_by(child_desc.property_at(i).name);
            }
            let plan = try_result!(self.plan(&query, PlanKind::Select));
            let binds = try_result!(bind_values(&child_desc, &query, self.types()));
            let rows = try_outcome!(tx.query(cx, &Statement::new(Arc::clone(&plan.sql), binds)).await);
            let loaded = try_result!(self.materialize(tx, &plan, &rows, &options));
            self.lazy().record(key, chunk.len(), rows.len());
            for child in loaded {
                let fk = child.read().value_at(fk_index).clone();
                let list = children.entry(EntityId::from(fk)).or_default();
                if !list.iter().any(|c| BeanRef::ptr_eq(c, &child)) {
                    list.push(child);
                }
            }
        }

        for (id, owners) in by_id {
            let list = children.remove(&id).unwrap_or_default();
            for owner in owners {
                let mut guard = owner.write();
                if !guard.is_loaded_at(index) {
                    guard.set_many(index, list.clone());
                }
            }
        }
        tracing::debug!(
            entity = desc.name,
            property = property.name,
            owners = owner_ids.len(),
            "Collections loaded"
        );
        Outcome::Ok(())
    }
}

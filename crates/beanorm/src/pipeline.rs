//! The query request pipeline.
//!
//! A read goes plan → cache → store → materialize → register:
//!
//! 1. the query's plan is resolved from the statement cache
//! 2. the natural-key cache (single equality on the natural key) and the
//!    query cache are consulted, unless this transaction wrote the type
//! 3. on a miss the plan runs against the store
//! 4. rows become context-registered beans, which feed the bean cache
//! 5. the result is put in the query cache and requested prefetches drain
//!    the lazy-load queues
//!
//! The free functions take the [`Engine`] directly so background workers
//! can run them without a [`Server`].

use crate::server::Server;
use beanorm_cache::{QueryCacheKey, QueryResultSnapshot};
use beanorm_core::{
    BeanRef, Cx, EntityDescriptor, EntityId, EntityKey, Error, Outcome, PropertyKind, Result,
    Row, Statement, check_cancelled, try_outcome, try_result,
};
use beanorm_query::{PlanKind, Query, QueryPlan, bind_values, ids_predicate};
use beanorm_session::{BatchKey, Engine, LoadOptions, Transaction};
use std::sync::Arc;

impl Server {
    /// The bean with `id`: persistence context, then bean cache, then store.
    #[tracing::instrument(level = "debug", skip(self, cx, tx, id), fields(id = tracing::field::Empty))]
    pub async fn find_by_id(
        &self,
        cx: &Cx,
        tx: Option<&mut Transaction>,
        entity: &str,
        id: impl Into<EntityId>,
    ) -> Outcome<Option<BeanRef>, Error> {
        let id = id.into();
        tracing::Span::current().record("id", tracing::field::display(&id));
        self.in_transaction(cx, tx, true, async |tx| {
            find_by_id_in(&self.engine, cx, tx, entity, id).await
        })
        .await
    }

    /// Like [`find_by_id`](Self::find_by_id), failing with `NotFound` when absent.
    pub async fn find_required(
        &self,
        cx: &Cx,
        tx: Option<&mut Transaction>,
        entity: &str,
        id: impl Into<EntityId>,
    ) -> Outcome<BeanRef, Error> {
        let id = id.into();
        let desc = Arc::clone(try_result!(self.engine.descriptor(entity)));
        match try_outcome!(self.find_by_id(cx, tx, entity, id.clone()).await) {
            Some(bean) => Outcome::Ok(bean),
            None => Outcome::Err(Error::NotFound {
                entity: desc.name,
                id,
            }),
        }
    }

    /// Beans matching `query`, in result order.
    #[tracing::instrument(level = "debug", skip(self, cx, tx, query), fields(entity = query.entity()))]
    pub async fn find_list(
        &self,
        cx: &Cx,
        tx: Option<&mut Transaction>,
        query: &Query,
    ) -> Outcome<Vec<BeanRef>, Error> {
        self.in_transaction(cx, tx, true, async |tx| {
            find_list_in(&self.engine, cx, tx, query).await
        })
        .await
    }

    /// The single bean matching `query`; `NonUniqueResult` when several match.
    pub async fn find_unique(
        &self,
        cx: &Cx,
        tx: Option<&mut Transaction>,
        query: &Query,
    ) -> Outcome<Option<BeanRef>, Error> {
        let mut beans = try_outcome!(self.find_list(cx, tx, query).await);
        if beans.len() > 1 {
            return Outcome::Err(Error::NonUniqueResult {
                entity: query.entity(),
                rows: beans.len(),
            });
        }
        Outcome::Ok(beans.pop())
    }

    /// Number of rows matching `query`.
    #[tracing::instrument(level = "debug", skip(self, cx, tx, query), fields(entity = query.entity()))]
    pub async fn find_count(
        &self,
        cx: &Cx,
        tx: Option<&mut Transaction>,
        query: &Query,
    ) -> Outcome<u64, Error> {
        self.in_transaction(cx, tx, true, async |tx| {
            find_count_in(&self.engine, cx, tx, query).await
        })
        .await
    }

    /// Ids of the rows matching `query`.
    #[tracing::instrument(level = "debug", skip(self, cx, tx, query), fields(entity = query.entity()))]
    pub async fn find_ids(
        &self,
        cx: &Cx,
        tx: Option<&mut Transaction>,
        query: &Query,
    ) -> Outcome<Vec<EntityId>, Error> {
        self.in_transaction(cx, tx, true, async |tx| {
            find_ids_in(&self.engine, cx, tx, query).await
        })
        .await
    }

    /// Raw rows of `query`, bypassing materialization and every cache.
    pub async fn find_rows(
        &self,
        cx: &Cx,
        tx: Option<&mut Transaction>,
        query: &Query,
    ) -> Outcome<Vec<Row>, Error> {
        self.in_transaction(cx, tx, true, async |tx| {
            find_rows_in(&self.engine, cx, tx, query).await
        })
        .await
    }
}

fn statement(engine: &Engine, desc: &EntityDescriptor, plan: &QueryPlan, query: &Query) -> Result<Statement> {
    let binds = bind_values(desc, query, engine.types())?;
    Ok(Statement::new(Arc::clone(&plan.sql), binds))
}

/// Query-cache key when this read may use the query cache.
fn query_cache_key(engine: &Engine, tx: &Transaction, query: &Query, plan: &QueryPlan) -> Option<QueryCacheKey> {
    (query.query_cache_enabled()
        && engine.cache().query_cache_enabled(plan.entity)
        && !tx.has_written(plan.entity))
    .then(|| QueryCacheKey::new(plan.entity, plan.hash, query.bind_hash()))
}

pub(crate) async fn find_by_id_in(
    engine: &Engine,
    cx: &Cx,
    tx: &mut Transaction,
    entity: &str,
    id: EntityId,
) -> Outcome<Option<BeanRef>, Error> {
    check_cancelled!(cx);
    let desc = Arc::clone(try_result!(engine.descriptor(entity)));
    if id.is_null() {
        return Outcome::Ok(None);
    }
    if tx.context().is_deleted(&EntityKey::new(desc.name, id.clone())) {
        return Outcome::Ok(None);
    }

    if let Some(bean) = tx.context().get(desc.name, &id) {
        if !bean.read().is_reference() {
            tracing::debug!(entity = desc.name, "Persistence context hit");
            return Outcome::Ok(Some(bean));
        }
        return match engine.ensure_bean_loaded(cx, tx, &bean).await {
            Outcome::Ok(()) => Outcome::Ok(Some(bean)),
            Outcome::Err(Error::BatchIntegrity(_)) => Outcome::Ok(None),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        };
    }

    let options = LoadOptions::default();
    if !tx.has_written(desc.name) {
        if let Some(snapshot) = engine.cache().bean_get(desc.name, &id) {
            return Outcome::Ok(Some(try_result!(engine.register_snapshot(tx, &snapshot, &options))));
        }
    }

    let id_values = try_result!(desc.id_values(&id));
    let query = Query::new(desc.name).filter(ids_predicate(&desc, &[id_values]));
    let plan = try_result!(engine.plan(&query, PlanKind::Select));
    let stmt = try_result!(statement(engine, &desc, &plan, &query));
    let rows = try_outcome!(tx.query(cx, &stmt).await);
    if rows.len() > 1 {
        return Outcome::Err(Error::NonUniqueResult {
            entity: desc.name,
            rows: rows.len(),
        });
    }
    let mut beans = try_result!(engine.materialize(tx, &plan, &rows, &options));
    Outcome::Ok(beans.pop())
}

pub(crate) async fn find_list_in(
    engine: &Engine,
    cx: &Cx,
    tx: &mut Transaction,
    query: &Query,
) -> Outcome<Vec<BeanRef>, Error> {
    check_cancelled!(cx);
    let desc = Arc::clone(try_result!(engine.descriptor(query.entity())));
    let options = LoadOptions::from_query(query);

    if let Some(beans) = try_result!(natural_key_lookup(engine, tx, &desc, query, &options)) {
        try_outcome!(prefetch(engine, cx, tx, &desc, query).await);
        return Outcome::Ok(beans);
    }

    let plan = try_result!(engine.plan(query, PlanKind::Select));
    let cache_key = query_cache_key(engine, tx, query, &plan);
    if let Some(key) = &cache_key {
        if let Some(hit) = engine.cache().query_get(key) {
            if let QueryResultSnapshot::Beans(snapshots) = hit.as_ref() {
                let mut beans = Vec::with_capacity(snapshots.len());
                for snapshot in snapshots {
                    beans.push(try_result!(engine.register_snapshot(tx, snapshot, &options)));
                }
                try_outcome!(prefetch(engine, cx, tx, &desc, query).await);
                return Outcome::Ok(beans);
            }
        }
    }

    let stmt = try_result!(statement(engine, &desc, &plan, query));
    let rows = try_outcome!(tx.query(cx, &stmt).await);
    let beans = try_result!(engine.materialize(tx, &plan, &rows, &options));
    tracing::debug!(entity = desc.name, rows = rows.len(), "Query executed");

    if let Some(key) = cache_key.filter(|_| !plan.partial) {
        let snapshots: Option<Vec<_>> = beans
            .iter()
            .map(|bean| {
                let guard = bean.read();
                (guard.is_fully_loaded() && !guard.is_dirty())
                    .then(|| guard.snapshot().map(Arc::new))
                    .flatten()
            })
            .collect();
        if let Some(snapshots) = snapshots {
            engine.cache().query_put(key, QueryResultSnapshot::Beans(snapshots));
        }
    }

    try_outcome!(prefetch(engine, cx, tx, &desc, query).await);
    Outcome::Ok(beans)
}

/// Answer a lone equality on the natural key from the natural-key and bean caches.
fn natural_key_lookup(
    engine: &Engine,
    tx: &mut Transaction,
    desc: &Arc<EntityDescriptor>,
    query: &Query,
    options: &LoadOptions,
) -> Result<Option<Vec<BeanRef>>> {
    if !query.bean_cache_enabled() || query.selected().is_some() || tx.has_written(desc.name) {
        return Ok(None);
    }
    let Some((property, value)) = query.single_equality() else {
        return Ok(None);
    };
    let Some(index) = engine.cache().natural_key_index(desc.name) else {
        return Ok(None);
    };
    if desc.property_index(property)? != index {
        return Ok(None);
    }
    let Some(id) = engine.cache().natural_get(desc.name, value) else {
        return Ok(None);
    };
    if let Some(bean) = tx.context().get(desc.name, &id) {
        if bean.read().is_fully_loaded() {
            tracing::debug!(entity = desc.name, "Natural key resolved from persistence context");
            return Ok(Some(vec![bean]));
        }
        return Ok(None);
    }
    let Some(snapshot) = engine.cache().bean_get(desc.name, &id) else {
        return Ok(None);
    };
    tracing::debug!(entity = desc.name, "Natural key resolved from bean cache");
    Ok(Some(vec![engine.register_snapshot(tx, &snapshot, options)?]))
}

/// Drain the lazy-load queues named by the query's prefetch list.
async fn prefetch(
    engine: &Engine,
    cx: &Cx,
    tx: &mut Transaction,
    desc: &EntityDescriptor,
    query: &Query,
) -> Outcome<(), Error> {
    for name in query.prefetches() {
        let property = match desc.property(name) {
            Some(property) => property,
            None => return Outcome::Err(Error::unknown_property(desc.name, name)),
        };
        let key = match property.kind {
            PropertyKind::ToMany { .. } => BatchKey::Association {
                entity: desc.name,
                property: property.name,
            },
            PropertyKind::ToOne { target } => BatchKey::BeanRefresh(target),
            _ => {
                tracing::debug!(entity = desc.name, property = name.as_str(), "Prefetch of a scalar ignored");
                continue;
            }
        };
        let loaded = try_outcome!(engine.drain_all(cx, tx, key).await);
        tracing::debug!(entity = desc.name, property = name.as_str(), loaded, "Prefetched");
    }
    Outcome::Ok(())
}

pub(crate) async fn find_count_in(
    engine: &Engine,
    cx: &Cx,
    tx: &mut Transaction,
    query: &Query,
) -> Outcome<u64, Error> {
    check_cancelled!(cx);
    let desc = Arc::clone(try_result!(engine.descriptor(query.entity())));
    let plan = try_result!(engine.plan(query, PlanKind::Count));
    let cache_key = query_cache_key(engine, tx, query, &plan);
    if let Some(key) = &cache_key {
        if let Some(hit) = engine.cache().query_get(key) {
            if let QueryResultSnapshot::Count(count) = hit.as_ref() {
                return Outcome::Ok(*count);
            }
        }
    }
    let stmt = try_result!(statement(engine, &desc, &plan, query));
    let rows = try_outcome!(tx.query(cx, &stmt).await);
    let count = rows
        .first()
        .and_then(|row| row.get(0))
        .and_then(|v| v.as_i64())
        .map_or(0, |n| n.max(0) as u64);
    if let Some(key) = cache_key {
        engine.cache().query_put(key, QueryResultSnapshot::Count(count));
    }
    Outcome::Ok(count)
}

pub(crate) async fn find_ids_in(
    engine: &Engine,
    cx: &Cx,
    tx: &mut Transaction,
    query: &Query,
) -> Outcome<Vec<EntityId>, Error> {
    check_cancelled!(cx);
    let desc = Arc::clone(try_result!(engine.descriptor(query.entity())));
    let plan = try_result!(engine.plan(query, PlanKind::Ids));
    let cache_key = query_cache_key(engine, tx, query, &plan);
    if let Some(key) = &cache_key {
        if let Some(hit) = engine.cache().query_get(key) {
            if let QueryResultSnapshot::Ids(ids) = hit.as_ref() {
                return Outcome::Ok(ids.clone());
            }
        }
    }
    let stmt = try_result!(statement(engine, &desc, &plan, query));
    let rows = try_outcome!(tx.query(cx, &stmt).await);
    let mut ids = Vec::with_capacity(rows.len());
    for row in &rows {
        let values = try_result!(engine.read_values(&desc, &plan, row));
        ids.push(desc.id_from_values(&values));
    }
    if let Some(key) = cache_key {
        engine.cache().query_put(key, QueryResultSnapshot::Ids(ids.clone()));
    }
    Outcome::Ok(ids)
}

pub(crate) async fn find_rows_in(
    engine: &Engine,
    cx: &Cx,
    tx: &mut Transaction,
    query: &Query,
) -> Outcome<Vec<Row>, Error> {
    check_cancelled!(cx);
    let desc = Arc::clone(try_result!(engine.descriptor(query.entity())));
    let plan = try_result!(engine.plan(query, PlanKind::Select));
    let stmt = try_result!(statement(engine, &desc, &plan, query));
    tx.query(cx, &stmt).await
}

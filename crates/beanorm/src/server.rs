//! The `Server`: entry point of an application into beanorm.

use crate::background::WorkerPool;
use beanorm_cache::{CacheManager, Clock};
use beanorm_core::{
    BeanRef, ChangeListener, Cx, DescriptorRegistry, EntityId, Error, Outcome, Result,
    ScalarTypeRegistry, ServerConfig, Store, try_outcome,
};
use beanorm_session::{BatchKey, Engine, EngineBuilder, LazyLoadStats, ScopeManager, Transaction};
use std::sync::Arc;

/// Reads, writes and background queries over one store.
///
/// Cheap to clone; clones share caches, lazy-load queues and workers.
#[derive(Clone)]
pub struct Server {
    pub(crate) engine: Arc<Engine>,
    pub(crate) workers: Arc<WorkerPool>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("engine", &self.engine)
            .field("workers", &self.workers.size())
            .finish()
    }
}

impl Server {
    pub fn builder(registry: Arc<DescriptorRegistry>, store: Arc<dyn Store>) -> ServerBuilder {
        ServerBuilder {
            engine: Engine::builder(registry, store),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn cache(&self) -> &CacheManager {
        self.engine.cache()
    }

    pub fn config(&self) -> &ServerConfig {
        self.engine.config()
    }

    /// Start an explicit transaction.
    pub async fn begin(&self, cx: &Cx, read_only: bool) -> Outcome<Transaction, Error> {
        self.engine.begin(cx, read_only).await
    }

    /// A scope manager for one logical flow.
    pub fn scope_manager(&self) -> ScopeManager {
        ScopeManager::new(Arc::clone(&self.engine))
    }

    /// Load statistics of a lazy-load batch key.
    pub fn lazy_stats(&self, key: BatchKey) -> LazyLoadStats {
        self.engine.lazy().stats(key)
    }

    /// Run `f` in `tx`, or in a transaction of its own that is committed on
    /// success and rolled back otherwise.
    pub(crate) async fn in_transaction<T, F>(
        &self,
        cx: &Cx,
        tx: Option<&mut Transaction>,
        read_only: bool,
        f: F,
    ) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut Transaction) -> Outcome<T, Error>,
    {
        if let Some(tx) = tx {
            return f(tx).await;
        }
        let mut implicit = try_outcome!(self.engine.begin(cx, read_only).await);
        let outcome = f(&mut implicit).await;
        if let Outcome::Ok(_) = outcome {
            try_outcome!(implicit.commit(cx).await);
        } else if let Outcome::Err(e) = implicit.rollback(cx).await {
            tracing::warn!(error = %e, "Rollback of implicit transaction failed");
        }
        outcome
    }

    // ==================== Writes ====================

    /// Insert or update `bean` and its cascade-save associations.
    pub async fn save(&self, cx: &Cx, tx: Option<&mut Transaction>, bean: &BeanRef) -> Outcome<(), Error> {
        self.in_transaction(cx, tx, false, async |tx| self.engine.save(cx, tx, bean).await)
            .await
    }

    /// Delete `bean` and its cascade-delete associations.
    pub async fn delete(&self, cx: &Cx, tx: Option<&mut Transaction>, bean: &BeanRef) -> Outcome<(), Error> {
        self.in_transaction(cx, tx, false, async |tx| self.engine.delete(cx, tx, bean).await)
            .await
    }

    /// Delete by id without an optimistic check. Returns whether a row was deleted.
    pub async fn delete_by_id(
        &self,
        cx: &Cx,
        tx: Option<&mut Transaction>,
        entity: &str,
        id: impl Into<EntityId>,
    ) -> Outcome<bool, Error> {
        let id = id.into();
        self.in_transaction(cx, tx, false, async |tx| {
            self.engine.delete_by_id(cx, tx, entity, id).await
        })
        .await
    }

    // ==================== Lazy loading ====================

    /// Load an unloaded property of `bean`, batched with other pending beans.
    pub async fn ensure_loaded(
        &self,
        cx: &Cx,
        tx: Option<&mut Transaction>,
        bean: &BeanRef,
        property: &str,
    ) -> Outcome<(), Error> {
        self.in_transaction(cx, tx, true, async |tx| {
            self.engine.ensure_loaded(cx, tx, bean, property).await
        })
        .await
    }

    /// The loaded target of a to-one association.
    pub async fn find_one(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        bean: &BeanRef,
        property: &str,
    ) -> Outcome<Option<BeanRef>, Error> {
        self.engine.find_one(cx, tx, bean, property).await
    }

    /// Sweep expired entries from every cache region.
    pub fn trim_caches(&self) -> usize {
        self.engine.cache().trim()
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    engine: EngineBuilder,
}

impl ServerBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.engine = self.engine.config(config);
        self
    }

    pub fn types(mut self, types: Arc<dyn ScalarTypeRegistry>) -> Self {
        self.engine = self.engine.types(types);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ChangeListener>) -> Self {
        self.engine = self.engine.listener(listener);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.engine = self.engine.clock(clock);
        self
    }

    pub fn build(self) -> Result<Server> {
        let engine = Arc::new(self.engine.build()?);
        Ok(Server {
            workers: Arc::new(WorkerPool::new(engine.config().background_workers)?),
            engine,
        })
    }
}

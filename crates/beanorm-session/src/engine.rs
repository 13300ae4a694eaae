//! The shared state every flow of a server works against.

use crate::lazy::LazyLoader;
use crate::transaction::Transaction;
use beanorm_cache::{CacheManager, Clock, SystemClock};
use beanorm_core::{
    ChangeListener, Cx, DescriptorRegistry, EntityDescriptor, Error, Outcome, Result, ScalarTypeRegistry,
    ServerConfig, StandardTypes, Store, check_cancelled, try_outcome,
};
use beanorm_query::{DmlShape, PlanKind, Query, QueryPlan, StatementCache, build_plan, plan_hash};
use std::sync::Arc;

/// Immutable metadata plus the server-wide caches, lazy-load queues and store.
///
/// Built once at startup and shared by `Arc`. All interior state is
/// concurrency-safe; an `Engine` never holds per-flow state.
pub struct Engine {
    registry: Arc<DescriptorRegistry>,
    config: Arc<ServerConfig>,
    types: Arc<dyn ScalarTypeRegistry>,
    store: Arc<dyn Store>,
    cache: Arc<CacheManager>,
    statements: StatementCache,
    lazy: LazyLoader,
    listeners: Arc<[Arc<dyn ChangeListener>]>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("entities", &self.registry.len())
            .field("store", &self.store.name())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder(registry: Arc<DescriptorRegistry>, store: Arc<dyn Store>) -> EngineBuilder {
        EngineBuilder {
            registry,
            store,
            config: ServerConfig::default(),
            types: None,
            listeners: Vec::new(),
            clock: None,
        }
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn types(&self) -> &dyn ScalarTypeRegistry {
        self.types.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn statements(&self) -> &StatementCache {
        &self.statements
    }

    pub fn lazy(&self) -> &LazyLoader {
        &self.lazy
    }

    pub fn descriptor(&self, entity: &str) -> Result<&Arc<EntityDescriptor>> {
        self.registry.get(entity)
    }

    /// Resolve the cached plan of a read query, generating it on first use.
    pub fn plan(&self, query: &Query, kind: PlanKind) -> Result<Arc<QueryPlan>> {
        let desc = self.descriptor(query.entity())?;
        self.statements
            .get_or_build(plan_hash(query, kind), || build_plan(desc, query, kind))
    }

    /// Resolve the cached plan of a DML shape.
    pub fn dml_plan(&self, desc: &EntityDescriptor, shape: &DmlShape) -> Result<Arc<QueryPlan>> {
        self.statements
            .get_or_build(shape.key(), || Ok(shape.build(desc)))
    }

    /// Start a transaction with its own persistence context.
    pub async fn begin(&self, cx: &Cx, read_only: bool) -> Outcome<Transaction, Error> {
        check_cancelled!(cx);
        let store_tx = try_outcome!(self.store.begin(cx, read_only).await);
        tracing::debug!(tx = store_tx.id(), read_only, "Transaction started");
        Outcome::Ok(Transaction::new(
            store_tx,
            read_only,
            Arc::clone(&self.cache),
            Arc::clone(&self.listeners),
        ))
    }

    /// Effective lazy-load batch size for an entity type.
    pub fn batch_size_for(&self, entity: &str, hint: Option<usize>) -> usize {
        hint.or_else(|| {
            self.registry
                .get(entity)
                .ok()
                .and_then(|d| d.lazy_batch_size)
        })
        .unwrap_or(self.config.lazy_batch_size)
        .max(1)
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    registry: Arc<DescriptorRegistry>,
    store: Arc<dyn Store>,
    config: ServerConfig,
    types: Option<Arc<dyn ScalarTypeRegistry>>,
    listeners: Vec<Arc<dyn ChangeListener>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Scalar conversion; [`StandardTypes`] when not set.
    pub fn types(mut self, types: Arc<dyn ScalarTypeRegistry>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ChangeListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Time source for cache expiry.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache = CacheManager::with_clock(&self.registry, &self.config, clock);
        tracing::info!(
            entities = self.registry.len(),
            store = self.store.name(),
            lazy_batch_size = self.config.lazy_batch_size,
            "Engine started"
        );
        Ok(Engine {
            statements: StatementCache::new(self.config.statement_cache_capacity),
            lazy: LazyLoader::new(self.config.max_pending_lazy, self.config.n1_warn_threshold),
            cache: Arc::new(cache),
            types: self.types.unwrap_or_else(|| Arc::new(StandardTypes)),
            listeners: self.listeners.into(),
            config: Arc::new(self.config),
            registry: self.registry,
            store: self.store,
        })
    }
}

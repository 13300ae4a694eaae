//! Transactions: a store transaction, its persistence context and its writes.

use crate::context::PersistenceContext;
use beanorm_cache::CacheManager;
use beanorm_core::{
    ChangeEvent, ChangeListener, Cx, Error, Outcome, Row, Statement, StoreTransaction,
    TransactionError, TransactionErrorKind, Value, check_cancelled, try_outcome,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// One unit of work.
///
/// Owns the persistence context of the flow that runs it. Writes append
/// [`ChangeEvent`]s; commit applies them to the server caches and then to
/// the change listeners. A rolled-back transaction touches neither.
pub struct Transaction {
    store: Box<dyn StoreTransaction>,
    context: PersistenceContext,
    events: Vec<ChangeEvent>,
    written: HashSet<&'static str>,
    read_only: bool,
    rollback_only: bool,
    state: TransactionState,
    cache: Arc<CacheManager>,
    listeners: Arc<[Arc<dyn ChangeListener>]>,
    started: Instant,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.store.id())
            .field("state", &self.state)
            .field("read_only", &self.read_only)
            .field("rollback_only", &self.rollback_only)
            .field("beans", &self.context.len())
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(
        store: Box<dyn StoreTransaction>,
        read_only: bool,
        cache: Arc<CacheManager>,
        listeners: Arc<[Arc<dyn ChangeListener>]>,
    ) -> Self {
        Self {
            store,
            context: PersistenceContext::new(),
            events: Vec::new(),
            written: HashSet::new(),
            read_only,
            rollback_only: false,
            state: TransactionState::Active,
            cache,
            listeners,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.store.id()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Make the eventual commit roll back instead.
    pub fn set_rollback_only(&mut self) {
        if !self.rollback_only {
            tracing::debug!(tx = self.id(), "Transaction marked rollback-only");
        }
        self.rollback_only = true;
    }

    pub fn context(&self) -> &PersistenceContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut PersistenceContext {
        &mut self.context
    }

    /// Writes made so far, in execution order.
    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    /// Has this transaction written to `entity`? Cache reads are skipped for such types.
    pub fn has_written(&self, entity: &str) -> bool {
        self.written.contains(entity)
    }

    pub(crate) fn record(&mut self, event: ChangeEvent) {
        tracing::trace!(tx = self.id(), entity = event.entity, op = %event.op, id = %event.id, "Change recorded");
        self.written.insert(event.entity);
        self.events.push(event);
    }

    fn ensure_active(&self) -> Result<(), Error> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committed => Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyCommitted,
                message: format!("transaction {} already committed", self.id()),
            })),
            TransactionState::RolledBack => Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyRolledBack,
                message: format!("transaction {} already rolled back", self.id()),
            })),
        }
    }

    /// Fail unless writes are allowed.
    pub(crate) fn ensure_writable(&self) -> Result<(), Error> {
        self.ensure_active()?;
        if self.read_only {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::ReadOnly,
                message: format!("transaction {} is read-only", self.id()),
            }));
        }
        Ok(())
    }

    pub async fn query(&self, cx: &Cx, statement: &Statement) -> Outcome<Vec<Row>, Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        check_cancelled!(cx);
        tracing::trace!(tx = self.id(), sql = %statement.sql, "Query");
        self.store.query(cx, statement).await
    }

    pub async fn execute(&self, cx: &Cx, statement: &Statement) -> Outcome<u64, Error> {
        if let Err(e) = self.ensure_writable() {
            return Outcome::Err(e);
        }
        check_cancelled!(cx);
        tracing::trace!(tx = self.id(), sql = %statement.sql, "Execute");
        self.store.execute(cx, statement).await
    }

    pub async fn insert(&self, cx: &Cx, statement: &Statement) -> Outcome<Option<Value>, Error> {
        if let Err(e) = self.ensure_writable() {
            return Outcome::Err(e);
        }
        check_cancelled!(cx);
        tracing::trace!(tx = self.id(), sql = %statement.sql, "Insert");
        self.store.insert(cx, statement).await
    }

    /// Commit: store first, then cache invalidation, then listeners.
    ///
    /// A rollback-only transaction is rolled back and reported as an error.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(tx = self.id()))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        if self.rollback_only {
            try_outcome!(self.rollback(cx).await);
            return Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::RollbackOnly,
                message: format!("transaction {} was marked rollback-only", self.id()),
            }));
        }

        match self.store.commit(cx).await {
            Outcome::Ok(()) => {}
            other => {
                // Store state is unknown after a failed commit; nothing is published.
                self.state = TransactionState::RolledBack;
                self.events.clear();
                return other;
            }
        }
        self.state = TransactionState::Committed;

        self.cache.on_commit(&self.events);
        for event in &self.events {
            for listener in self.listeners.iter() {
                listener.notify(event.entity, event.op, &event.id);
            }
        }
        tracing::info!(
            tx = self.id(),
            events = self.events.len(),
            beans = self.context.len(),
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "Transaction committed"
        );
        Outcome::Ok(())
    }

    /// Roll back and discard recorded writes.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(tx = self.id()))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        self.state = TransactionState::RolledBack;
        let discarded = self.events.len();
        self.events.clear();
        let outcome = self.store.rollback(cx).await;
        tracing::debug!(tx = self.id(), discarded, "Transaction rolled back");
        outcome
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            tracing::warn!(
                tx = self.store.id(),
                events = self.events.len(),
                "Transaction dropped while active; the store rolls it back"
            );
        }
    }
}

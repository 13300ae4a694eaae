//! beanorm - the runtime core of an object-relational mapper.
//!
//! beanorm turns entity metadata into executed queries and managed writes
//! against a relational store, keeping three layers of state consistent:
//!
//! - per-transaction object identity (the persistence context)
//! - cross-transaction bean, query and natural-key caches
//! - batched lazy loading of associations that were not fetched
//!
//! Within one transaction a row is never represented by two diverging
//! in-memory beans.
//!
//! # Quick Start
//!
//! ```ignore
//! use beanorm::prelude::*;
//!
//! let registry = DescriptorRegistry::builder()
//!     .register(
//!         EntityDescriptor::builder("order", "orders")
//!             .property(PropertyDescriptor::id("id", SqlType::BigInt).identity())
//!             .property(PropertyDescriptor::scalar("status", SqlType::Text))
//!             .property(PropertyDescriptor::version("version"))
//!             .cache(CachePolicy::cached()),
//!     )
//!     .build()?;
//! let server = Server::builder(Arc::new(registry), Arc::new(store)).build()?;
//!
//! let cx = Cx::for_request();
//! let mut tx = server.begin(&cx, false).await?;
//! let open = server
//!     .find_list(&cx, Some(&mut tx), &Query::new("order").where_eq("status", "OPEN"))
//!     .await?;
//! open[0].set("status", "SHIPPED")?;
//! server.save(&cx, Some(&mut tx), &open[0]).await?;
//! tx.commit(&cx).await?;
//! ```
//!
//! # Crates
//!
//! - `beanorm-core`: values, ids, descriptors, managed beans, the store contract
//! - `beanorm-query`: query definitions, plans and SQL generation
//! - `beanorm-cache`: the server cache manager
//! - `beanorm-session`: persistence context, lazy loading, persister, transactions
//! - `beanorm-memory`: an in-memory store for tests

pub use beanorm_cache::{
    CacheManager, CacheStatsSnapshot, Clock, EntityCacheStats, ManualClock, QueryCacheKey,
    QueryResultSnapshot, SystemClock,
};
pub use beanorm_core::{
    BeanLifecycle, BeanRef, BeanSnapshot, CachePolicy, Cascade, ChangeEvent, ChangeListener,
    ChangeOp, ConcurrencyMode, Cx, DescriptorRegistry, EntityDescriptor, EntityId, EntityKey,
    Error, GeneratedValue, LoadState, ManagedBean, Outcome, PropertyDescriptor, PropertyKind,
    Result, Row, ScalarTypeRegistry, ServerConfig, SqlType, StandardTypes, Statement, Store,
    StoreTransaction, UpdatePolicy, Value,
};
pub use beanorm_query::{Op, Predicate, Query};
pub use beanorm_session::{
    BatchKey, Engine, LazyLoadStats, PersistenceContext, Propagation, ScopeHandle, ScopeManager,
    Transaction, TransactionState, TxScope,
};

pub mod background;
pub mod pipeline;
pub mod server;

pub use background::BackgroundQuery;
pub use server::{Server, ServerBuilder};

/// The types most applications need.
pub mod prelude {
    pub use crate::{
        BackgroundQuery, BeanRef, CachePolicy, Cx, DescriptorRegistry, EntityDescriptor,
        EntityId, Error, Outcome, PropertyDescriptor, Propagation, Query, Result, Server,
        ServerConfig, SqlType, Transaction, TxScope, Value,
    };
    pub use std::sync::Arc;
}

//! Sessions for beanorm.
//!
//! `beanorm-session` is the **unit-of-work layer**. Everything that happens
//! between `begin` and `commit` lives here:
//!
//! - [`PersistenceContext`]: one managed instance per (entity, id) per transaction
//! - [`Engine::materialize`]: rows and cache snapshots into context-registered beans
//! - [`LazyLoader`]: batched loading of references and collections
//! - [`Engine::save`] / [`Engine::delete`]: DML with cascades and optimistic checks
//! - [`Transaction`] / [`ScopeManager`]: commit, rollback and propagation
//!
//! # Design
//!
//! - **Explicit transactions**: every operation takes `&mut Transaction`; the
//!   [`ScopeManager`] is a thin per-flow convenience on top.
//! - **Explicit loading**: unloaded properties are reported by the bean and
//!   filled through [`Engine::ensure_loaded`]; nothing is intercepted.
//! - **Cancel-correct**: store access goes through `Cx` + `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let mut tx = engine.begin(&cx, false).await?;
//! let order = tx.context().get("order", &EntityId::from(42_i64)).unwrap();
//! engine.ensure_loaded(&cx, &mut tx, &order, "lines").await?;
//! order.set("status", "SHIPPED")?;
//! engine.save(&cx, &mut tx, &order).await?;
//! tx.commit(&cx).await?;
//! ```

pub mod context;
pub mod engine;
pub mod lazy;
pub mod load;
pub mod persister;
pub mod scope;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{ContextHandle, PersistenceContext};
pub use engine::{Engine, EngineBuilder};
pub use lazy::{BatchKey, CANONICAL_BATCH_SIZES, LazyLoadStats, LazyLoader, canonical_batch_size, pad_ids};
pub use load::LoadOptions;
pub use scope::{Propagation, ScopeHandle, ScopeManager, TxScope};
pub use transaction::{Transaction, TransactionState};

//! In-memory store for beanorm.
//!
//! `MemoryStore` implements the `Store` contract from beanorm-core by
//! interpreting the SQL the statement generator emits. It is the store used
//! by beanorm's own tests and is handy for application tests that should not
//! need a database server.
//!
//! # Example
//!
//! ```rust,ignore
//! use beanorm_memory::MemoryStore;
//! use beanorm_core::Value;
//!
//! let store = MemoryStore::new();
//! store.seed("customers", &["id", "email"], vec![
//!     vec![Value::BigInt(1), Value::from("ada@example.com")],
//! ]);
//! ```
//!
//! # Behaviour
//!
//! - Writes apply immediately and are undone on rollback, or when a
//!   transaction is dropped without commit.
//! - Every statement is logged; tests assert on [`MemoryStore::statements`].
//! - [`MemoryStore::set_query_delay`] slows queries down so cancellation can
//!   be exercised; a cancel hint ends a delayed query with a `Cancelled`
//!   query error.
//! - NULL never compares equal to anything, as in SQL.

pub mod sql;
pub mod store;

pub use store::{MemoryStore, MemoryTransaction};

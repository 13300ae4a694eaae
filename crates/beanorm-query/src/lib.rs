//! Query definitions and plans for beanorm.
//!
//! `beanorm-query` is the **statement layer**. It turns a [`Query`] and an
//! entity descriptor into a [`QueryPlan`] (generated SQL keyed by a
//! bind-independent shape hash) and generates DML for the persister.
//!
//! - [`Query`] / [`Predicate`]: what to fetch
//! - [`build_plan`] / [`bind_values`]: SELECT, COUNT and id-list statements
//! - [`DmlShape`]: INSERT, UPDATE and DELETE statements with optimistic checks
//! - [`StatementCache`]: server-wide plan cache
//!
//! # Design
//!
//! - **Shape hashing**: the plan hash covers predicates, ordering, selected
//!   properties and limits but never bind values, so `status = 'OPEN'` and
//!   `status = 'SHIPPED'` share one plan.
//! - **Quoted identifiers** and `$n` placeholders throughout.
//! - **Fixed batch shapes**: id lists are padded before planning, so a lazy
//!   load of 3 ids and one of 10 reuse the same statement.
//!
//! # Example
//!
//! ```rust,ignore
//! use beanorm_query::{PlanKind, Query, build_plan};
//!
//! let query = Query::new("order").where_eq("status", "OPEN").order_by("id");
//! let plan = build_plan(registry.get("order")?, &query, PlanKind::Select)?;
//! assert!(plan.sql.starts_with("SELECT"));
//! ```

pub mod cache;
pub mod dml;
pub mod plan;
pub mod query;

pub use cache::StatementCache;
pub use dml::{ConcurrencyCheck, DmlShape};
pub use plan::{PlanKind, QueryPlan, bind_values, build_plan, ids_predicate, plan_hash, render_where};
pub use query::{Op, OrderBy, Predicate, Query};

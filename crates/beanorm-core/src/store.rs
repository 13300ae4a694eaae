//! The statement-execution contract.
//!
//! A [`Store`] hands out [`StoreTransaction`]s; every read and write the
//! runtime performs runs inside one. Futures are boxed so both traits are
//! object-safe and a server can hold an `Arc<dyn Store>`.
//!
//! All operations take a `Cx` for cancellation and return an asupersync
//! `Outcome`.

use crate::error::Error;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Outcome<T, Error>> + Send + 'a>>;

/// Generated SQL plus its ordered bind values.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL text with `$1..$n` placeholders. Shared with the statement cache.
    pub sql: Arc<str>,
    pub binds: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<Arc<str>>, binds: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            binds,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)?;
        if !self.binds.is_empty() {
            f.write_str(" -- binds: [")?;
            for (i, bind) in self.binds.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{bind}")?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

/// A relational store.
pub trait Store: Send + Sync {
    /// Start a transaction. Read-only transactions reject DML.
    fn begin<'a>(&'a self, cx: &'a Cx, read_only: bool) -> StoreFuture<'a, Box<dyn StoreTransaction>>;

    /// Ask the backend to cancel statements running in transaction `tx_id`.
    ///
    /// Backends without cancellation support ignore the request.
    fn cancel_hint(&self, tx_id: u64) {
        let _ = tx_id;
    }

    /// Short name used in log fields.
    fn name(&self) -> &str {
        "store"
    }
}

/// One open store transaction.
///
/// Dropping it without `commit` or `rollback` must roll it back.
pub trait StoreTransaction: Send + Sync {
    /// Identifier for [`Store::cancel_hint`].
    fn id(&self) -> u64;

    /// Run a query and return its rows.
    fn query<'a>(&'a self, cx: &'a Cx, statement: &'a Statement) -> StoreFuture<'a, Vec<Row>>;

    /// Run DML and return the affected row count.
    fn execute<'a>(&'a self, cx: &'a Cx, statement: &'a Statement) -> StoreFuture<'a, u64>;

    /// Run an INSERT and return the generated key, if the store assigned one.
    fn insert<'a>(&'a self, cx: &'a Cx, statement: &'a Statement) -> StoreFuture<'a, Option<Value>>;

    fn commit<'a>(&'a self, cx: &'a Cx) -> StoreFuture<'a, ()>;

    fn rollback<'a>(&'a self, cx: &'a Cx) -> StoreFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_display_lists_binds() {
        let stmt = Statement::new(
            "UPDATE \"orders\" SET \"status\" = $1 WHERE \"id\" = $2",
            vec![Value::from("SHIPPED"), Value::BigInt(42)],
        );
        assert_eq!(
            stmt.to_string(),
            "UPDATE \"orders\" SET \"status\" = $1 WHERE \"id\" = $2 -- binds: ['SHIPPED', 42]"
        );
        assert_eq!(Statement::new("SELECT 1", vec![]).to_string(), "SELECT 1");
    }
}

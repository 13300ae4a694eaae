//! Error types for beanorm operations.

use crate::bean::BeanRef;
use crate::id::EntityId;
use std::fmt;

/// The primary error type for all beanorm operations.
#[derive(Debug)]
pub enum Error {
    /// A by-id lookup that required a row found none.
    NotFound {
        /// Entity type name.
        entity: &'static str,
        /// The id that was looked up.
        id: EntityId,
    },
    /// A unique-result query produced more than one row.
    NonUniqueResult {
        /// Entity type name.
        entity: &'static str,
        /// Number of rows the query produced.
        rows: usize,
    },
    /// An UPDATE or DELETE did not affect exactly one row.
    OptimisticLock(OptimisticLockError),
    /// A lazy-load batch came back with fewer rows than distinct ids requested.
    BatchIntegrity(BatchIntegrityError),
    /// Store-side statement execution failure
    Query(QueryError),
    /// Store connection failure
    Connection(ConnectionError),
    /// Transaction propagation rule violated
    Propagation(PropagationError),
    /// Transaction misuse
    Transaction(TransactionError),
    /// Scalar conversion failure
    Type(TypeError),
    /// Unknown entity/property or malformed descriptor
    Metadata(MetadataError),
    /// A setter was called on a bean shared with the cache.
    ReadOnly {
        /// Entity type name.
        entity: &'static str,
    },
    /// Configuration errors
    Config(ConfigError),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct OptimisticLockError {
    pub entity: &'static str,
    pub id: EntityId,
    /// Rows the statement actually affected.
    pub affected: u64,
    pub sql: String,
    /// The bean whose write was rejected. Its state is left as it was before the write.
    pub bean: Option<BeanRef>,
}

#[derive(Debug, Clone)]
pub struct BatchIntegrityError {
    /// Entity type that was being loaded.
    pub entity: &'static str,
    /// Distinct ids requested by the batch.
    pub requested: usize,
    /// Distinct ids the store returned.
    pub found: usize,
    /// Requested ids with no matching row.
    pub missing: Vec<EntityId>,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Cancelled
    Cancelled,
    /// Other database error
    Database,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationErrorKind {
    /// MANDATORY scope entered without an active transaction.
    MandatoryWithoutTransaction,
    /// NEVER scope entered while a transaction is active.
    NeverWithTransaction,
}

#[derive(Debug)]
pub struct PropagationError {
    pub kind: PropagationErrorKind,
    pub message: String,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Already committed
    AlreadyCommitted,
    /// Already rolled back
    AlreadyRolledBack,
    /// Write attempted inside a read-only transaction
    ReadOnly,
    /// Commit attempted on a transaction marked rollback-only
    RollbackOnly,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct MetadataError {
    pub entity: Option<String>,
    pub property: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this a retryable store error (deadlock, serialization, timeouts)?
    ///
    /// Optimistic lock failures are never retryable here: resolving them needs
    /// application-level conflict handling.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::Disconnected),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Did this error come from the store itself?
    pub fn is_store_error(&self) -> bool {
        matches!(self, Error::Query(_) | Error::Connection(_))
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::OptimisticLock(e) => Some(&e.sql),
            _ => None,
        }
    }

    /// Shorthand for a metadata error about an unknown entity type.
    pub fn unknown_entity(entity: &str) -> Self {
        Error::Metadata(MetadataError {
            entity: Some(entity.to_string()),
            property: None,
            message: format!("no descriptor registered for entity '{entity}'"),
        })
    }

    /// Shorthand for a metadata error about an unknown property.
    pub fn unknown_property(entity: &str, property: &str) -> Self {
        Error::Metadata(MetadataError {
            entity: Some(entity.to_string()),
            property: Some(property.to_string()),
            message: format!("entity '{entity}' has no property '{property}'"),
        })
    }

    /// Shorthand for a store execution failure.
    pub fn store(kind: QueryErrorKind, sql: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            sql: Some(sql.into()),
            sqlstate: None,
            message: message.into(),
            source: None,
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound { entity, id } => write!(f, "{entity} with id {id} not found"),
            Error::NonUniqueResult { entity, rows } => write!(
                f,
                "unique query on {entity} returned {rows} rows, expected at most one"
            ),
            Error::OptimisticLock(e) => write!(f, "Optimistic lock failure: {e}"),
            Error::BatchIntegrity(e) => write!(f, "Lazy-load batch integrity error: {e}"),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Propagation(e) => write!(f, "Propagation error: {}", e.message),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {e}"),
            Error::Metadata(e) => write!(f, "Metadata error: {}", e.message),
            Error::ReadOnly { entity } => {
                write!(f, "{entity} bean is read-only (shared with the cache)")
            }
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} id {} affected {} rows, expected 1",
            self.entity, self.id, self.affected
        )
    }
}

impl fmt::Display for BatchIntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: requested {} ids, store returned {}",
            self.entity, self.requested, self.found
        )
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<PropagationError> for Error {
    fn from(err: PropagationError) -> Self {
        Error::Propagation(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

/// Result type alias for beanorm operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn retryable_flags() {
        let deadlock = Error::store(QueryErrorKind::Deadlock, "UPDATE t", "deadlock detected");
        assert!(deadlock.is_retryable());
        assert!(deadlock.is_store_error());
        assert_eq!(deadlock.sql(), Some("UPDATE t"));

        let syntax = Error::store(QueryErrorKind::Syntax, "SELEC", "bad syntax");
        assert!(!syntax.is_retryable());

        let lock = Error::OptimisticLock(OptimisticLockError {
            entity: "order",
            id: EntityId::single(Value::BigInt(42)),
            affected: 0,
            sql: "UPDATE \"orders\" SET ...".to_string(),
            bean: None,
        });
        assert!(!lock.is_retryable());
        assert!(!lock.is_store_error());
    }

    #[test]
    fn display_messages() {
        let err = Error::NotFound {
            entity: "order",
            id: EntityId::single(Value::BigInt(7)),
        };
        assert_eq!(err.to_string(), "order with id 7 not found");

        let err = Error::NonUniqueResult {
            entity: "order",
            rows: 3,
        };
        assert!(err.to_string().contains("returned 3 rows"));

        let err = Error::unknown_property("order", "colour");
        assert!(err.to_string().contains("no property 'colour'"));
    }
}

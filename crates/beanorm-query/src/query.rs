//! Query definitions: the entity, a conjunction of predicates, ordering and fetch options.

use beanorm_core::Value;
use std::hash::{Hash, Hasher};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Equal (=)
    Eq,
    /// Not equal (<>)
    Ne,
    /// Less than (<)
    Lt,
    /// Less than or equal (<=)
    Le,
    /// Greater than (>)
    Gt,
    /// Greater than or equal (>=)
    Ge,
    /// LIKE with `%` and `_` wildcards
    Like,
}

impl Op {
    /// Get the SQL representation of this operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "<>",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Like => "LIKE",
        }
    }
}

/// One WHERE term. Terms of a [`Query`] are ANDed together.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        property: String,
        op: Op,
        value: Value,
    },
    In {
        property: String,
        values: Vec<Value>,
    },
    IsNull {
        property: String,
        negated: bool,
    },
    /// OR of AND-groups, used for batches over composite ids.
    AnyOf(Vec<Vec<Predicate>>),
}

impl Predicate {
    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            property: property.into(),
            op: Op::Eq,
            value: value.into(),
        }
    }

    /// Feed the bind-independent shape into a hasher.
    pub fn hash_shape<H: Hasher>(&self, state: &mut H) {
        match self {
            Predicate::Compare { property, op, .. } => {
                0u8.hash(state);
                property.hash(state);
                op.hash(state);
            }
            Predicate::In { property, values } => {
                1u8.hash(state);
                property.hash(state);
                values.len().hash(state);
            }
            Predicate::IsNull { property, negated } => {
                2u8.hash(state);
                property.hash(state);
                negated.hash(state);
            }
            Predicate::AnyOf(groups) => {
                3u8.hash(state);
                groups.len().hash(state);
                for group in groups {
                    group.len().hash(state);
                    for p in group {
                        p.hash_shape(state);
                    }
                }
            }
        }
    }

    /// Feed the bound values into a hasher.
    pub fn hash_binds<H: Hasher>(&self, state: &mut H) {
        match self {
            Predicate::Compare { value, .. } => value.hash_key(state),
            Predicate::In { values, .. } => {
                for v in values {
                    v.hash_key(state);
                }
            }
            Predicate::IsNull { .. } => {}
            Predicate::AnyOf(groups) => {
                for p in groups.iter().flatten() {
                    p.hash_binds(state);
                }
            }
        }
    }
}

/// Ordering term.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderBy {
    pub property: String,
    pub descending: bool,
}

/// A query against one entity type.
///
/// ```
/// use beanorm_query::Query;
///
/// let q = Query::new("order")
///     .where_eq("status", "OPEN")
///     .order_by_desc("id")
///     .max_rows(10);
/// assert_eq!(q.predicates().len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    entity: &'static str,
    predicates: Vec<Predicate>,
    order: Vec<OrderBy>,
    select: Option<Vec<String>>,
    prefetch: Vec<String>,
    max_rows: Option<u64>,
    first_row: Option<u64>,
    lazy_batch_size: Option<usize>,
    use_bean_cache: bool,
    use_query_cache: bool,
    read_only: bool,
}

impl Query {
    pub fn new(entity: &'static str) -> Self {
        Self {
            entity,
            predicates: Vec::new(),
            order: Vec::new(),
            select: None,
            prefetch: Vec::new(),
            max_rows: None,
            first_row: None,
            lazy_batch_size: None,
            use_bean_cache: true,
            use_query_cache: true,
            read_only: false,
        }
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn where_op(self, property: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.filter(Predicate::Compare {
            property: property.into(),
            op,
            value: value.into(),
        })
    }

    pub fn where_eq(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.where_op(property, Op::Eq, value)
    }

    pub fn where_in(self, property: impl Into<String>, values: Vec<Value>) -> Self {
        self.filter(Predicate::In {
            property: property.into(),
            values,
        })
    }

    pub fn where_null(self, property: impl Into<String>) -> Self {
        self.filter(Predicate::IsNull {
            property: property.into(),
            negated: false,
        })
    }

    pub fn where_not_null(self, property: impl Into<String>) -> Self {
        self.filter(Predicate::IsNull {
            property: property.into(),
            negated: true,
        })
    }

    pub fn order_by(mut self, property: impl Into<String>) -> Self {
        self.order.push(OrderBy {
            property: property.into(),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, property: impl Into<String>) -> Self {
        self.order.push(OrderBy {
            property: property.into(),
            descending: true,
        });
        self
    }

    /// Fetch only these properties (ids and the version are always fetched).
    pub fn select(mut self, properties: &[&str]) -> Self {
        self.select = Some(properties.iter().map(|p| (*p).to_string()).collect());
        self
    }

    /// Load this association for every result right after the query.
    pub fn prefetch(mut self, association: impl Into<String>) -> Self {
        self.prefetch.push(association.into());
        self
    }

    pub fn max_rows(mut self, n: u64) -> Self {
        self.max_rows = Some(n);
        self
    }

    pub fn first_row(mut self, n: u64) -> Self {
        self.first_row = Some(n);
        self
    }

    /// Batch size hint for lazy loads triggered by this query's results.
    pub fn lazy_batch_size(mut self, n: usize) -> Self {
        self.lazy_batch_size = Some(n);
        self
    }

    pub fn use_bean_cache(mut self, enabled: bool) -> Self {
        self.use_bean_cache = enabled;
        self
    }

    pub fn use_query_cache(mut self, enabled: bool) -> Self {
        self.use_query_cache = enabled;
        self
    }

    /// Results are shared read-only instances (setters fail).
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn order(&self) -> &[OrderBy] {
        &self.order
    }

    pub fn selected(&self) -> Option<&[String]> {
        self.select.as_deref()
    }

    pub fn prefetches(&self) -> &[String] {
        &self.prefetch
    }

    pub fn limit(&self) -> Option<u64> {
        self.max_rows
    }

    pub fn offset(&self) -> Option<u64> {
        self.first_row
    }

    pub fn batch_size_hint(&self) -> Option<usize> {
        self.lazy_batch_size
    }

    pub fn bean_cache_enabled(&self) -> bool {
        self.use_bean_cache
    }

    pub fn query_cache_enabled(&self) -> bool {
        self.use_query_cache
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The value of a lone `property = value` predicate, if that is the whole query.
    pub fn single_equality(&self) -> Option<(&str, &Value)> {
        match self.predicates.as_slice() {
            [Predicate::Compare {
                property,
                op: Op::Eq,
                value,
            }] if self.order.is_empty() && self.first_row.is_none() => {
                Some((property.as_str(), value))
            }
            _ => None,
        }
    }

    /// Hash of the bound values, in predicate order.
    pub fn bind_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for p in &self.predicates {
            p.hash_binds(&mut hasher);
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_equality() {
        let q = Query::new("customer").where_eq("email", "a@example.com");
        assert_eq!(
            q.single_equality(),
            Some(("email", &Value::from("a@example.com")))
        );
        let q = q.where_eq("name", "A");
        assert!(q.single_equality().is_none());
        let q = Query::new("customer").where_op("id", Op::Gt, 1_i64);
        assert!(q.single_equality().is_none());
    }

    #[test]
    fn test_bind_hash_tracks_values_only() {
        let a = Query::new("order").where_eq("status", "OPEN");
        let b = Query::new("order").where_eq("status", "OPEN").max_rows(5);
        let c = Query::new("order").where_eq("status", "CLOSED");
        assert_eq!(a.bind_hash(), b.bind_hash());
        assert_ne!(a.bind_hash(), c.bind_hash());
    }

    #[test]
    fn test_options() {
        let q = Query::new("order")
            .select(&["status"])
            .prefetch("lines")
            .lazy_batch_size(50)
            .use_query_cache(false)
            .read_only(true);
        assert_eq!(q.selected(), Some(&["status".to_string()][..]));
        assert_eq!(q.prefetches(), &["lines".to_string()]);
        assert_eq!(q.batch_size_hint(), Some(50));
        assert!(!q.query_cache_enabled());
        assert!(q.bean_cache_enabled());
        assert!(q.is_read_only());
    }
}

//! INSERT/UPDATE/DELETE generation.
//!
//! Bind order of the generated statements:
//! - INSERT: the written columns.
//! - UPDATE: the SET columns, then the id columns, then the concurrency binds.
//! - DELETE: the id columns, then the concurrency binds.
//!
//! Concurrency binds follow [`ConcurrencyCheck`]: the old version value, or one
//! old value per compared property that was not NULL.

use crate::plan::{PlanKind, QueryPlan};
use beanorm_core::{EntityDescriptor, quote_ident};
use std::collections::hash_map::DefaultHasher;
use std::fmt::Write;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// The optimistic-concurrency predicate of an UPDATE or DELETE.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConcurrencyCheck {
    /// Id only.
    None,
    /// `"version" = $n`.
    Version,
    /// One term per (property index, old value was NULL).
    Properties(Vec<(usize, bool)>),
}

/// The shape of one DML statement; equal shapes share generated SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DmlShape {
    pub entity: &'static str,
    pub kind: PlanKind,
    /// Written columns (INSERT, UPDATE SET) as property indexes.
    pub columns: Vec<usize>,
    pub check: ConcurrencyCheck,
}

impl DmlShape {
    pub fn insert(entity: &'static str, columns: Vec<usize>) -> Self {
        Self {
            entity,
            kind: PlanKind::Insert,
            columns,
            check: ConcurrencyCheck::None,
        }
    }

    pub fn update(entity: &'static str, columns: Vec<usize>, check: ConcurrencyCheck) -> Self {
        Self {
            entity,
            kind: PlanKind::Update,
            columns,
            check,
        }
    }

    pub fn delete(entity: &'static str, check: ConcurrencyCheck) -> Self {
        Self {
            entity,
            kind: PlanKind::Delete,
            columns: Vec::new(),
            check,
        }
    }

    /// Statement-cache key.
    pub fn key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Generate the SQL for this shape.
    pub fn build(&self, desc: &EntityDescriptor) -> QueryPlan {
        let table = quote_ident(desc.table);
        let column = |i: usize| quote_ident(desc.property_at(i).column);
        let mut n = 0usize;
        let mut next = || {
            n += 1;
            format!("${n}")
        };

        let mut sql = String::new();
        match self.kind {
            PlanKind::Insert => {
                let names: Vec<String> = self.columns.iter().map(|&i| column(i)).collect();
                let marks: Vec<String> = self.columns.iter().map(|_| next()).collect();
                if names.is_empty() {
                    let _ = write!(sql, "INSERT INTO {table} DEFAULT VALUES");
                } else {
                    let _ = write!(
                        sql,
                        "INSERT INTO {table} ({}) VALUES ({})",
                        names.join(", "),
                        marks.join(", ")
                    );
                }
            }
            PlanKind::Update | PlanKind::Delete => {
                if self.kind == PlanKind::Update {
                    let sets: Vec<String> = self
                        .columns
                        .iter()
                        .map(|&i| format!("{} = {}", column(i), next()))
                        .collect();
                    let _ = write!(sql, "UPDATE {table} SET {}", sets.join(", "));
                } else {
                    let _ = write!(sql, "DELETE FROM {table}");
                }
                let mut terms: Vec<String> = desc
                    .id_indexes()
                    .iter()
                    .map(|&i| format!("{} = {}", column(i), next()))
                    .collect();
                match &self.check {
                    ConcurrencyCheck::None => {}
                    ConcurrencyCheck::Version => {
                        if let Some(version) = desc.version_property() {
                            terms.push(format!("{} = {}", column(version.index), next()));
                        }
                    }
                    ConcurrencyCheck::Properties(props) => {
                        for &(i, was_null) in props {
                            if was_null {
                                terms.push(format!("{} IS NULL", column(i)));
                            } else {
                                terms.push(format!("{} = {}", column(i), next()));
                            }
                        }
                    }
                }
                let _ = write!(sql, " WHERE {}", terms.join(" AND "));
            }
            PlanKind::Select | PlanKind::Count | PlanKind::Ids => {}
        }

        QueryPlan {
            entity: desc.name,
            kind: self.kind,
            hash: self.key(),
            sql: Arc::from(sql),
            columns: Arc::from(self.columns.clone()),
            partial: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beanorm_core::{PropertyDescriptor, SqlType};

    fn order_desc() -> EntityDescriptor {
        EntityDescriptor::builder("order", "orders")
            .property(PropertyDescriptor::id("id", SqlType::BigInt).identity())
            .property(PropertyDescriptor::scalar("status", SqlType::Text))
            .property(PropertyDescriptor::scalar("note", SqlType::Text))
            .property(PropertyDescriptor::version("version"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_insert_sql() {
        let desc = order_desc();
        let plan = DmlShape::insert("order", vec![1, 2, 3]).build(&desc);
        assert_eq!(
            &*plan.sql,
            "INSERT INTO \"orders\" (\"status\", \"note\", \"version\") VALUES ($1, $2, $3)"
        );
        assert_eq!(plan.kind, PlanKind::Insert);
    }

    #[test]
    fn test_update_with_version_check() {
        let desc = order_desc();
        let plan = DmlShape::update("order", vec![1, 3], ConcurrencyCheck::Version).build(&desc);
        assert_eq!(
            &*plan.sql,
            "UPDATE \"orders\" SET \"status\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4"
        );
    }

    #[test]
    fn test_update_with_all_properties_check() {
        let desc = order_desc();
        let check = ConcurrencyCheck::Properties(vec![(1, false), (2, true)]);
        let plan = DmlShape::update("order", vec![1], check).build(&desc);
        assert_eq!(
            &*plan.sql,
            "UPDATE \"orders\" SET \"status\" = $1 WHERE \"id\" = $2 AND \"status\" = $3 AND \"note\" IS NULL"
        );
    }

    #[test]
    fn test_delete_and_keys() {
        let desc = order_desc();
        let plain = DmlShape::delete("order", ConcurrencyCheck::None);
        assert_eq!(
            &*plain.build(&desc).sql,
            "DELETE FROM \"orders\" WHERE \"id\" = $1"
        );
        let versioned = DmlShape::delete("order", ConcurrencyCheck::Version);
        assert_ne!(plain.key(), versioned.key());
        assert_eq!(versioned.key(), DmlShape::delete("order", ConcurrencyCheck::Version).key());
    }
}

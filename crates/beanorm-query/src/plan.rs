//! Query plans: the bind-independent, reusable form of a query.
//!
//! A plan is identified by a hash over the query's shape (entity, kind,
//! predicate structure, ordering, selected properties, limits) and never over
//! bound values. Two queries that differ only in their literals share a plan,
//! its generated SQL, and its statement-cache entry.

use crate::query::{Predicate, Query};
use beanorm_core::{EntityDescriptor, Error, PropertyDescriptor, Result, ScalarTypeRegistry, Value, quote_ident};
use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::fmt::Write;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// What a plan's statement does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanKind {
    /// Fetch bean rows.
    Select,
    /// `SELECT COUNT(*)`.
    Count,
    /// Fetch id columns only.
    Ids,
    Insert,
    Update,
    Delete,
}

/// A generated statement shape.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub entity: &'static str,
    pub kind: PlanKind,
    pub hash: u64,
    pub sql: Arc<str>,
    /// Property indexes of the result columns (SELECT) or written columns (DML).
    pub columns: Arc<[usize]>,
    /// True when a SELECT fetches only some column properties.
    pub partial: bool,
}

impl QueryPlan {
    /// The loaded-property set a partial fetch produces.
    pub fn loaded_set(&self) -> Option<BTreeSet<usize>> {
        self.partial.then(|| self.columns.iter().copied().collect())
    }
}

/// Shape hash of a read query.
pub fn plan_hash(query: &Query, kind: PlanKind) -> u64 {
    let mut hasher = DefaultHasher::new();
    query.entity().hash(&mut hasher);
    kind.hash(&mut hasher);
    query.predicates().len().hash(&mut hasher);
    for p in query.predicates() {
        p.hash_shape(&mut hasher);
    }
    if kind == PlanKind::Select {
        query.order().hash(&mut hasher);
        query.selected().hash(&mut hasher);
    }
    if kind != PlanKind::Count {
        query.limit().hash(&mut hasher);
        query.offset().hash(&mut hasher);
    }
    hasher.finish()
}

pub(crate) fn column_property<'d>(
    desc: &'d EntityDescriptor,
    name: &str,
) -> Result<&'d PropertyDescriptor> {
    let property = desc
        .property(name)
        .ok_or_else(|| Error::unknown_property(desc.name, name))?;
    if property.has_column() {
        Ok(property)
    } else {
        Err(Error::Metadata(beanorm_core::MetadataError {
            entity: Some(desc.name.to_string()),
            property: Some(name.to_string()),
            message: format!("'{name}' is a collection and cannot be used in a query"),
        }))
    }
}

fn selected_columns(desc: &EntityDescriptor, query: &Query) -> Result<(Vec<usize>, bool)> {
    let all: Vec<usize> = desc.column_properties().map(|p| p.index).collect();
    let Some(selected) = query.selected() else {
        return Ok((all, false));
    };
    let mut set: BTreeSet<usize> = desc.id_indexes().iter().copied().collect();
    if let Some(version) = desc.version_property() {
        set.insert(version.index);
    }
    for name in selected {
        set.insert(column_property(desc, name)?.index);
    }
    let columns: Vec<usize> = set.into_iter().collect();
    let partial = columns.len() != all.len();
    Ok((columns, partial))
}

/// Build the plan for a read query.
pub fn build_plan(desc: &EntityDescriptor, query: &Query, kind: PlanKind) -> Result<QueryPlan> {
    let (columns, partial) = match kind {
        PlanKind::Select => selected_columns(desc, query)?,
        PlanKind::Ids => (desc.id_indexes().to_vec(), false),
        PlanKind::Count => (Vec::new(), false),
        PlanKind::Insert | PlanKind::Update | PlanKind::Delete => {
            return Err(Error::Custom(format!("{kind:?} is not a read plan")));
        }
    };

    let mut sql = String::from("SELECT ");
    if kind == PlanKind::Count {
        sql.push_str("COUNT(*)");
    } else {
        let names: Vec<String> = columns
            .iter()
            .map(|&i| quote_ident(desc.property_at(i).column))
            .collect();
        sql.push_str(&names.join(", "));
    }
    let _ = write!(sql, " FROM {}", quote_ident(desc.table));

    let mut placeholder = 0;
    render_where(desc, query.predicates(), &mut sql, &mut placeholder)?;

    if kind == PlanKind::Select && !query.order().is_empty() {
        sql.push_str(" ORDER BY ");
        let mut terms = Vec::with_capacity(query.order().len());
        for term in query.order() {
            let property = column_property(desc, &term.property)?;
            terms.push(format!(
                "{} {}",
                quote_ident(property.column),
                if term.descending { "DESC" } else { "ASC" }
            ));
        }
        sql.push_str(&terms.join(", "));
    }
    if kind != PlanKind::Count {
        if let Some(limit) = query.limit() {
            let _ = write!(sql, " LIMIT {limit}");
        }
        if let Some(offset) = query.offset() {
            let _ = write!(sql, " OFFSET {offset}");
        }
    }

    Ok(QueryPlan {
        entity: desc.name,
        kind,
        hash: plan_hash(query, kind),
        sql: Arc::from(sql),
        columns: Arc::from(columns),
        partial,
    })
}

/// Render ` WHERE ...` for a predicate conjunction. Placeholders continue from `placeholder`.
pub fn render_where(
    desc: &EntityDescriptor,
    predicates: &[Predicate],
    sql: &mut String,
    placeholder: &mut usize,
) -> Result<()> {
    if predicates.is_empty() {
        return Ok(());
    }
    sql.push_str(" WHERE ");
    render_conjunction(desc, predicates, sql, placeholder)
}

fn render_conjunction(
    desc: &EntityDescriptor,
    predicates: &[Predicate],
    sql: &mut String,
    placeholder: &mut usize,
) -> Result<()> {
    for (i, p) in predicates.iter().enumerate() {
        if i > 0 {
            sql.push_str(" AND ");
        }
        render_predicate(desc, p, sql, placeholder)?;
    }
    Ok(())
}

fn render_predicate(
    desc: &EntityDescriptor,
    predicate: &Predicate,
    sql: &mut String,
    placeholder: &mut usize,
) -> Result<()> {
    match predicate {
        Predicate::Compare { property, op, .. } => {
            let column = quote_ident(column_property(desc, property)?.column);
            *placeholder += 1;
            let _ = write!(sql, "{column} {} ${placeholder}", op.as_str());
        }
        Predicate::In { property, values } => {
            let column = quote_ident(column_property(desc, property)?.column);
            if values.is_empty() {
                // Matches nothing.
                let _ = write!(sql, "{column} IS NULL AND {column} IS NOT NULL");
            } else {
                let mut marks = Vec::with_capacity(values.len());
                for _ in values {
                    *placeholder += 1;
                    marks.push(format!("${placeholder}"));
                }
                let _ = write!(sql, "{column} IN ({})", marks.join(", "));
            }
        }
        Predicate::IsNull { property, negated } => {
            let column = quote_ident(column_property(desc, property)?.column);
            let _ = write!(
                sql,
                "{column} {}",
                if *negated { "IS NOT NULL" } else { "IS NULL" }
            );
        }
        Predicate::AnyOf(groups) => {
            sql.push('(');
            for (i, group) in groups.iter().enumerate() {
                if i > 0 {
                    sql.push_str(" OR ");
                }
                sql.push('(');
                render_conjunction(desc, group, sql, placeholder)?;
                sql.push(')');
            }
            sql.push(')');
        }
    }
    Ok(())
}

/// Bound values of a query in placeholder order, converted for the store.
pub fn bind_values(
    desc: &EntityDescriptor,
    query: &Query,
    types: &dyn ScalarTypeRegistry,
) -> Result<Vec<Value>> {
    let mut binds = Vec::new();
    collect_binds(desc, query.predicates(), types, &mut binds)?;
    Ok(binds)
}

fn collect_binds(
    desc: &EntityDescriptor,
    predicates: &[Predicate],
    types: &dyn ScalarTypeRegistry,
    binds: &mut Vec<Value>,
) -> Result<()> {
    for p in predicates {
        match p {
            Predicate::Compare { property, value, .. } => {
                let property = column_property(desc, property)?;
                binds.push(types.bind(&property.sql_type, value)?);
            }
            Predicate::In { property, values } => {
                let property = column_property(desc, property)?;
                for v in values {
                    binds.push(types.bind(&property.sql_type, v)?);
                }
            }
            Predicate::IsNull { .. } => {}
            Predicate::AnyOf(groups) => {
                for group in groups {
                    collect_binds(desc, group, types, binds)?;
                }
            }
        }
    }
    Ok(())
}

/// Predicate selecting rows by id: `IN` for single ids, an OR of AND-groups for composites.
pub fn ids_predicate(desc: &EntityDescriptor, ids: &[Vec<Value>]) -> Predicate {
    if let [single] = desc.id_indexes() {
        Predicate::In {
            property: desc.property_at(*single).name.to_string(),
            values: ids.iter().filter_map(|id| id.first().cloned()).collect(),
        }
    } else {
        Predicate::AnyOf(
            ids.iter()
                .map(|id| {
                    desc.id_indexes()
                        .iter()
                        .zip(id)
                        .map(|(&i, v)| Predicate::eq(desc.property_at(i).name, v.clone()))
                        .collect()
                })
                .collect(),
        )
    }
}

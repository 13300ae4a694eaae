//! Materialization: store rows and cache snapshots into context-registered beans.

use crate::engine::Engine;
use crate::lazy::BatchKey;
use crate::transaction::Transaction;
use beanorm_core::{
    BeanRef, BeanSnapshot, EntityDescriptor, EntityId, EntityKey, Error, ManagedBean,
    PropertyKind, Result, Row, Value,
};
use beanorm_query::{Query, QueryPlan};
use std::collections::BTreeSet;
use std::sync::Arc;

/// How fetched data becomes beans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// New beans are read-only shared instances.
    pub read_only: bool,
    /// Fully loaded beans may be put into (and associations resolved from) the bean cache.
    pub use_bean_cache: bool,
    /// Lazy-load batch size for loads triggered from these beans.
    pub batch_size: Option<usize>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            use_bean_cache: true,
            batch_size: None,
        }
    }
}

impl LoadOptions {
    pub fn from_query(query: &Query) -> Self {
        Self {
            read_only: query.is_read_only(),
            use_bean_cache: query.bean_cache_enabled(),
            batch_size: query.batch_size_hint(),
        }
    }
}

impl Engine {
    /// Convert one row of a read plan into a descriptor-ordered value buffer.
    ///
    /// Columns the plan did not fetch hold NULL.
    pub fn read_values(&self, desc: &EntityDescriptor, plan: &QueryPlan, row: &Row) -> Result<Vec<Value>> {
        let mut values = vec![Value::Null; desc.property_count()];
        for (position, &index) in plan.columns.iter().enumerate() {
            let raw = row.get(position).cloned().unwrap_or(Value::Null);
            let property = desc.property_at(index);
            values[index] = self.types().read(&property.sql_type, raw).map_err(|e| match e {
                Error::Type(mut t) => {
                    t.column = Some(property.column.to_string());
                    Error::Type(t)
                }
                other => other,
            })?;
        }
        Ok(values)
    }

    /// Materialize the rows of a select plan in the transaction's context.
    ///
    /// Rows whose id is already registered resolve to the registered
    /// instance; unloaded properties of that instance are filled from the row.
    pub fn materialize(
        &self,
        tx: &mut Transaction,
        plan: &QueryPlan,
        rows: &[Row],
        options: &LoadOptions,
    ) -> Result<Vec<BeanRef>> {
        let desc = Arc::clone(self.descriptor(plan.entity)?);
        let loaded = plan.loaded_set();
        let mut beans = Vec::with_capacity(rows.len());
        for row in rows {
            let values = self.read_values(&desc, plan, row)?;
            beans.push(self.register_values(tx, &desc, values, loaded.clone(), options)?);
        }
        tracing::trace!(entity = desc.name, rows = rows.len(), "Materialized rows");
        Ok(beans)
    }

    /// Register a fetched value buffer, reusing the context instance when present.
    pub(crate) fn register_values(
        &self,
        tx: &mut Transaction,
        desc: &Arc<EntityDescriptor>,
        values: Vec<Value>,
        loaded: Option<BTreeSet<usize>>,
        options: &LoadOptions,
    ) -> Result<BeanRef> {
        let id = desc.id_from_values(&values);
        if id.is_null() {
            return Err(Error::Custom(format!("row of {} has a NULL id", desc.name)));
        }
        if let Some(existing) = tx.context().get(desc.name, &id) {
            let needs_fill = {
                let bean = existing.read();
                !bean.is_fully_loaded() && !bean.is_new() && !bean.is_read_only()
            };
            if needs_fill {
                existing.write().merge_fetched(&values, loaded.as_ref());
                self.after_load(tx, desc, &existing, options)?;
            }
            return Ok(existing);
        }

        let complete = loaded.is_none();
        let mut bean = ManagedBean::loaded(Arc::clone(desc), values, loaded);
        bean.set_read_only(options.read_only);
        let snapshot = (complete
            && options.use_bean_cache
            && !tx.has_written(desc.name)
            && self.cache().bean_cache_enabled(desc.name))
        .then(|| bean.snapshot())
        .flatten();
        let registered = tx.context_mut().put(BeanRef::new(bean));
        if let Some(snapshot) = snapshot {
            self.cache().bean_put(Arc::new(snapshot));
        }
        if !complete {
            self.lazy().enqueue(
                BatchKey::BeanRefresh(desc.name),
                &registered,
                tx.context().handle(),
                options.batch_size,
            );
        }
        self.after_load(tx, desc, &registered, options)?;
        Ok(registered)
    }

    /// Register a bean built from a cache snapshot, or return the context instance.
    pub fn register_snapshot(
        &self,
        tx: &mut Transaction,
        snapshot: &BeanSnapshot,
        options: &LoadOptions,
    ) -> Result<BeanRef> {
        if let Some(existing) = tx.context().get(snapshot.entity, &snapshot.id) {
            return Ok(existing);
        }
        let desc = Arc::clone(self.descriptor(snapshot.entity)?);
        let shared = options.read_only || self.cache().is_read_only(snapshot.entity);
        let bean = ManagedBean::from_snapshot(Arc::clone(&desc), snapshot, shared);
        let registered = tx.context_mut().put(BeanRef::new(bean));
        self.after_load(tx, &desc, &registered, options)?;
        Ok(registered)
    }

    /// Queue unloaded collections and resolve to-one foreign keys of a freshly loaded bean.
    pub(crate) fn after_load(
        &self,
        tx: &mut Transaction,
        desc: &Arc<EntityDescriptor>,
        bean: &BeanRef,
        options: &LoadOptions,
    ) -> Result<()> {
        let mut targets: Vec<(&'static str, Value)> = Vec::new();
        let mut unloaded_many: Vec<&'static str> = Vec::new();
        {
            let guard = bean.read();
            for property in desc.properties() {
                match property.kind {
                    PropertyKind::ToOne { target } if guard.is_loaded_at(property.index) => {
                        let fk = guard.value_at(property.index);
                        if !fk.is_null() {
                            targets.push((target, fk.clone()));
                        }
                    }
                    PropertyKind::ToMany { .. } if !guard.is_loaded_at(property.index) => {
                        unloaded_many.push(property.name);
                    }
                    _ => {}
                }
            }
        }
        for property in unloaded_many {
            self.lazy().enqueue(
                BatchKey::Association {
                    entity: desc.name,
                    property,
                },
                bean,
                tx.context().handle(),
                options.batch_size,
            );
        }
        for (target, fk) in targets {
            self.resolve_reference(tx, target, EntityId::from(fk), options)?;
        }
        Ok(())
    }

    /// The context instance for (entity, id), created when absent.
    ///
    /// A bean-cache hit yields a loaded bean; otherwise a reference bean is
    /// registered and queued for a batched refresh.
    pub fn resolve_reference(
        &self,
        tx: &mut Transaction,
        entity: &'static str,
        id: EntityId,
        options: &LoadOptions,
    ) -> Result<BeanRef> {
        if let Some(existing) = tx.context().get(entity, &id) {
            return Ok(existing);
        }
        if options.use_bean_cache && !tx.has_written(entity) {
            if let Some(snapshot) = self.cache().bean_get(entity, &id) {
                return self.register_snapshot(tx, &snapshot, options);
            }
        }
        let desc = self.descriptor(entity)?;
        let reference = BeanRef::new(ManagedBean::reference(Arc::clone(desc), &id)?);
        let registered = tx
            .context_mut()
            .put_if_absent(EntityKey::new(entity, id), || reference);
        self.lazy().enqueue(
            BatchKey::BeanRefresh(entity),
            &registered,
            tx.context().handle(),
            options.batch_size,
        );
        Ok(registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{engine, order_line_registry, unwrap_outcome};
    use asupersync::runtime::RuntimeBuilder;
    use beanorm_core::{Cx, LoadState, Outcome};
    use beanorm_memory::MemoryStore;
    use beanorm_query::PlanKind;

    #[test]
    fn test_materialize_registers_once() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        store.seed("orders", &["id", "customer_id", "status", "version"], vec![
            vec![Value::BigInt(1), Value::BigInt(10), Value::from("OPEN"), Value::BigInt(1)],
            vec![Value::BigInt(2), Value::BigInt(10), Value::from("OPEN"), Value::BigInt(1)],
        ]);
        let engine = engine(order_line_registry(), store);

        rt.block_on(async {
            let mut tx = unwrap_outcome(engine.begin(&cx, true).await);
            let query = Query::new("order").order_by("id");
            let plan = engine.plan(&query, PlanKind::Select).unwrap();
            let rows = unwrap_outcome(tx.query(&cx, &beanorm_core::Statement::new(Arc::clone(&plan.sql), vec![])).await);
            let first = engine.materialize(&mut tx, &plan, &rows, &LoadOptions::default()).unwrap();
            let second = engine.materialize(&mut tx, &plan, &rows, &LoadOptions::default()).unwrap();
            assert_eq!(first.len(), 2);
            for (a, b) in first.iter().zip(&second) {
                assert!(BeanRef::ptr_eq(a, b));
            }

            // Both orders point at customer 10: one reference bean, queued once.
            let customer = tx.context().get("customer", &EntityId::from(10_i64)).unwrap();
            assert_eq!(customer.read().load_state(), &LoadState::Reference);
            assert_eq!(engine.lazy().pending(BatchKey::BeanRefresh("customer")), 1);
            assert_eq!(
                engine.lazy().pending(BatchKey::Association { entity: "order", property: "lines" }),
                2
            );
            assert!(matches!(tx.rollback(&cx).await, Outcome::Ok(())));
        });
    }

    #[test]
    fn test_partial_plan_fills_existing_reference() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        store.seed("orders", &["id", "customer_id", "status", "version"], vec![
            vec![Value::BigInt(5), Value::Null, Value::from("OPEN"), Value::BigInt(3)],
        ]);
        let engine = engine(order_line_registry(), store);

        rt.block_on(async {
            let mut tx = unwrap_outcome(engine.begin(&cx, true).await);
            let reference = engine
                .resolve_reference(&mut tx, "order", EntityId::from(5_i64), &LoadOptions::default())
                .unwrap();
            assert!(reference.read().is_reference());

            let query = Query::new("order").select(&["status"]);
            let plan = engine.plan(&query, PlanKind::Select).unwrap();
            assert!(plan.partial);
            let rows = unwrap_outcome(tx.query(&cx, &beanorm_core::Statement::new(Arc::clone(&plan.sql), vec![])).await);
            let beans = engine.materialize(&mut tx, &plan, &rows, &LoadOptions::default()).unwrap();
            assert!(BeanRef::ptr_eq(&beans[0], &reference));
            let bean = reference.read();
            assert_eq!(bean.value("status"), Some(&Value::from("OPEN")));
            assert!(!bean.is_loaded("customer").unwrap());
            drop(bean);
            assert!(matches!(tx.rollback(&cx).await, Outcome::Ok(())));
        });
    }

    #[test]
    fn test_read_values_reports_column_on_type_error() {
        let engine = engine(order_line_registry(), MemoryStore::new());
        let desc = Arc::clone(engine.descriptor("order").unwrap());
        let plan = engine.plan(&Query::new("order"), PlanKind::Select).unwrap();
        let row = Row::new(
            plan.columns.iter().map(|_| "c".to_string()).collect(),
            vec![Value::from("not a number"), Value::Null, Value::Null, Value::Null],
        );
        match engine.read_values(&desc, &plan, &row) {
            Err(Error::Type(t)) => assert_eq!(t.column.as_deref(), Some("id")),
            other => panic!("expected type error, got {other:?}"),
        }
    }
}

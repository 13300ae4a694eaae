//! The persister: inserts, updates and deletes of managed beans.
//!
//! Every write walks the same steps: pick the statement shape, resolve its
//! cached SQL, bind, execute, check the row count, then post-process the bean
//! and the transaction. A bean is only touched after the store reported
//! success, so a failed write leaves it exactly as it was.
//!
//! Cascades recurse through boxed futures and carry a visited set keyed by
//! (entity, id), or by instance for beans without an id yet.

use crate::engine::Engine;
use crate::load::LoadOptions;
use crate::transaction::Transaction;
use beanorm_core::{
    BeanRef, ChangeEvent, ChangeOp, ConcurrencyMode, ConcurrencyToken, Cx, EntityDescriptor,
    EntityId, EntityKey, Error, GeneratedValue, OptimisticLockError, Outcome, PropertyKind, Result,
    SqlType, Statement, UpdatePolicy, Value, try_outcome, try_result,
};
use beanorm_query::{ConcurrencyCheck, DmlShape, QueryPlan};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

type PersistFuture<'a, T> = Pin<Box<dyn Future<Output = Outcome<T, Error>> + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Visit {
    Key(EntityKey),
    Instance(usize),
}

/// Beans already handled by one save or delete call.
#[derive(Debug, Default)]
struct Visited(HashSet<Visit>);

impl Visited {
    /// Record `bean`; false when it was seen before.
    fn enter(&mut self, bean: &BeanRef) -> bool {
        let first = self.0.insert(Visit::Instance(bean.addr()));
        match bean.key() {
            Some(key) => self.0.insert(Visit::Key(key)) && first,
            None => first,
        }
    }

    fn record_key(&mut self, key: EntityKey) {
        self.0.insert(Visit::Key(key));
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn first_version(sql_type: &SqlType) -> Value {
    match sql_type {
        SqlType::Integer => Value::Int(1),
        _ => Value::BigInt(1),
    }
}

fn next_version(current: &Value, sql_type: &SqlType) -> Value {
    match current {
        Value::Int(v) => Value::Int(v + 1),
        Value::BigInt(v) => Value::BigInt(v + 1),
        _ => first_version(sql_type),
    }
}

fn fk_value(id: &EntityId) -> Value {
    id.as_single().cloned().unwrap_or(Value::Null)
}

/// The WHERE-clause check for `token` and the values it binds.
fn concurrency_check(
    bean_loaded: &[usize],
    desc: &EntityDescriptor,
    token: ConcurrencyToken,
) -> (ConcurrencyCheck, Vec<Value>) {
    match token {
        ConcurrencyToken::None => (ConcurrencyCheck::None, Vec::new()),
        ConcurrencyToken::Version(v) => (ConcurrencyCheck::Version, vec![v]),
        ConcurrencyToken::OldValues(old) => {
            let compared: Vec<usize> = bean_loaded
                .iter()
                .copied()
                .filter(|&i| !desc.property_at(i).is_id())
                .collect();
            let binds = compared
                .iter()
                .filter(|&&i| !old[i].is_null())
                .map(|&i| old[i].clone())
                .collect();
            let terms = compared.iter().map(|&i| (i, old[i].is_null())).collect();
            (ConcurrencyCheck::Properties(terms), binds)
        }
    }
}

impl Engine {
    fn concurrency_mode(&self, desc: &EntityDescriptor) -> ConcurrencyMode {
        desc.concurrency.unwrap_or(self.config().concurrency_mode)
    }

    fn bind_columns(&self, desc: &EntityDescriptor, columns: &[usize], values: &[Value]) -> Result<Vec<Value>> {
        columns
            .iter()
            .map(|&i| self.types().bind(&desc.property_at(i).sql_type, &values[i]))
            .collect()
    }

    fn bind_id(&self, desc: &EntityDescriptor, id: &EntityId) -> Result<Vec<Value>> {
        desc.id_indexes()
            .iter()
            .zip(desc.id_values(id)?)
            .map(|(&i, v)| self.types().bind(&desc.property_at(i).sql_type, &v))
            .collect()
    }

    fn optimistic_lock(desc: &EntityDescriptor, id: EntityId, affected: u64, plan: &QueryPlan, bean: &BeanRef) -> Error {
        tracing::debug!(entity = desc.name, %id, affected, "Optimistic lock failure");
        Error::OptimisticLock(OptimisticLockError {
            entity: desc.name,
            id,
            affected,
            sql: plan.sql.to_string(),
            bean: Some(bean.clone()),
        })
    }

    /// Insert a new bean or update a changed one, cascading along
    /// cascade-save associations. A clean bean issues no statement.
    #[tracing::instrument(level = "debug", skip(self, cx, tx, bean), fields(entity = bean.entity()))]
    pub async fn save(&self, cx: &Cx, tx: &mut Transaction, bean: &BeanRef) -> Outcome<(), Error> {
        try_result!(tx.ensure_writable());
        let mut visited = Visited::default();
        self.save_bean(cx, tx, bean.clone(), &mut visited).await
    }

    fn save_bean<'a>(
        &'a self,
        cx: &'a Cx,
        tx: &'a mut Transaction,
        bean: BeanRef,
        visited: &'a mut Visited,
    ) -> PersistFuture<'a, ()> {
        Box::pin(async move {
            if !visited.enter(&bean) {
                return Outcome::Ok(());
            }
            let (desc, pending) = {
                let guard = bean.read();
                if guard.is_deleted() {
                    return Outcome::Err(Error::Custom(format!(
                        "cannot save deleted bean {}#{}",
                        guard.entity(),
                        guard.id()
                    )));
                }
                if guard.is_read_only() {
                    return Outcome::Err(Error::ReadOnly {
                        entity: guard.entity(),
                    });
                }
                let pending: Vec<(usize, BeanRef)> = guard
                    .pending_associations()
                    .map(|(i, b)| (i, b.clone()))
                    .collect();
                (Arc::clone(guard.descriptor()), pending)
            };

            for (index, target) in pending {
                if desc.property_at(index).cascade.save {
                    try_outcome!(self.save_bean(cx, tx, target.clone(), visited).await);
                }
                let id = target.read().id();
                if !id.is_null() {
                    bean.write().assign_foreign_key(index, fk_value(&id));
                }
            }

            let (is_new, dirty) = {
                let guard = bean.read();
                (guard.is_new(), guard.is_dirty())
            };
            if is_new {
                try_outcome!(self.insert_bean(cx, tx, &desc, &bean).await);
                if let Some(key) = bean.key() {
                    visited.record_key(key);
                }
            } else if dirty {
                try_outcome!(self.update_bean(cx, tx, &desc, &bean).await);
            } else {
                tracing::trace!(entity = desc.name, "Bean unchanged; no statement");
            }

            let owner_fk = fk_value(&bean.read().id());
            for property in desc.to_many_properties().filter(|p| p.cascade.save) {
                let PropertyKind::ToMany { target, mapped_by } = property.kind else {
                    continue;
                };
                let children: Vec<BeanRef> = bean
                    .read()
                    .many_at(property.index)
                    .map(<[BeanRef]>::to_vec)
                    .unwrap_or_default();
                if children.is_empty() {
                    continue;
                }
                let child_desc = Arc::clone(try_result!(self.descriptor(target)));
                let fk_index = try_result!(child_desc.property_index(mapped_by));
                for child in children {
                    let skip = {
                        let mut guard = child.write();
                        if !guard.is_deleted() && !guard.value_at(fk_index).key_eq(&owner_fk) {
                            guard.assign_foreign_key(fk_index, owner_fk.clone());
                        }
                        !guard.is_dirty() && child_desc.recurse_skippable()
                    };
                    if skip {
                        continue;
                    }
                    try_outcome!(self.save_bean(cx, tx, child, visited).await);
                }
            }
            Outcome::Ok(())
        })
    }

    async fn insert_bean(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        desc: &Arc<EntityDescriptor>,
        bean: &BeanRef,
    ) -> Outcome<(), Error> {
        let now = now_micros();
        let mut values = bean.read().values().to_vec();
        let mut generated = Vec::new();
        for property in desc.column_properties() {
            let value = match property.generated {
                GeneratedValue::CreatedTimestamp | GeneratedValue::UpdatedTimestamp => {
                    Value::Timestamp(now)
                }
                _ if property.is_version() => first_version(&property.sql_type),
                _ => continue,
            };
            values[property.index] = value;
            generated.push(property.index);
        }

        let identity = desc.has_identity();
        if !identity && desc.id_from_values(&values).is_null() {
            return Outcome::Err(Error::Custom(format!(
                "{} has no identity column; assign the id before saving",
                desc.name
            )));
        }

        let columns: Vec<usize> = desc
            .column_properties()
            .filter(|p| p.insertable)
            .map(|p| p.index)
            .collect();
        let plan = try_result!(self.dml_plan(desc, &DmlShape::insert(desc.name, columns)));
        let binds = try_result!(self.bind_columns(desc, &plan.columns, &values));
        let statement = Statement::new(Arc::clone(&plan.sql), binds);

        if identity {
            let id_property = desc.id_property();
            let Some(key) = try_outcome!(tx.insert(cx, &statement).await) else {
                return Outcome::Err(Error::Custom(format!(
                    "store returned no generated key for {}",
                    desc.name
                )));
            };
            values[id_property.index] = try_result!(self.types().read(&id_property.sql_type, key));
            generated.push(id_property.index);
        } else {
            let affected = try_outcome!(tx.execute(cx, &statement).await);
            if affected != 1 {
                return Outcome::Err(Error::Custom(format!(
                    "insert into {} affected {affected} rows",
                    desc.table
                )));
            }
        }

        let id = {
            let mut guard = bean.write();
            for &i in &generated {
                guard.set_generated(i, values[i].clone());
            }
            guard.mark_clean();
            guard.id()
        };
        tx.context_mut().put(bean.clone());
        tx.record(ChangeEvent::new(desc.name, ChangeOp::Insert, id));
        Outcome::Ok(())
    }

    async fn update_bean(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        desc: &Arc<EntityDescriptor>,
        bean: &BeanRef,
    ) -> Outcome<(), Error> {
        let mode = self.concurrency_mode(desc);
        let (id, mut values, candidates, loaded, token) = {
            let guard = bean.read();
            let candidates = match self.config().update_policy {
                UpdatePolicy::ChangedOnly => guard.dirty_indexes(),
                UpdatePolicy::AllLoaded => guard.loaded_indexes(),
            };
            (
                guard.id(),
                guard.values().to_vec(),
                candidates,
                guard.loaded_indexes(),
                guard.concurrency_token(mode),
            )
        };

        let mut set: BTreeSet<usize> = candidates
            .into_iter()
            .filter(|&i| {
                let p = desc.property_at(i);
                p.updatable && p.has_column() && !p.is_id() && !p.is_version()
            })
            .collect();
        if set.is_empty() {
            tracing::trace!(entity = desc.name, %id, "No updatable changes");
            bean.write().mark_clean();
            return Outcome::Ok(());
        }

        let mut generated = Vec::new();
        if mode == ConcurrencyMode::Version {
            if let Some(version) = desc.version_property() {
                let current = match &token {
                    ConcurrencyToken::Version(v) => v.clone(),
                    _ => Value::Null,
                };
                values[version.index] = next_version(&current, &version.sql_type);
                set.insert(version.index);
                generated.push(version.index);
            }
        }
        let now = now_micros();
        for property in desc.column_properties() {
            if property.generated == GeneratedValue::UpdatedTimestamp && property.updatable {
                values[property.index] = Value::Timestamp(now);
                set.insert(property.index);
                generated.push(property.index);
            }
        }

        let columns: Vec<usize> = set.into_iter().collect();
        let (check, check_binds) = concurrency_check(&loaded, desc, token);
        let plan = try_result!(self.dml_plan(desc, &DmlShape::update(desc.name, columns, check)));
        let mut binds = try_result!(self.bind_columns(desc, &plan.columns, &values));
        binds.extend(try_result!(self.bind_id(desc, &id)));
        binds.extend(check_binds);

        let affected = try_outcome!(
            tx.execute(cx, &Statement::new(Arc::clone(&plan.sql), binds))
                .await
        );
        if affected != 1 {
            return Outcome::Err(Self::optimistic_lock(desc, id, affected, &plan, bean));
        }

        {
            let mut guard = bean.write();
            for &i in &generated {
                guard.set_generated(i, values[i].clone());
            }
            guard.mark_clean();
        }
        tx.context_mut().put(bean.clone());
        tx.record(ChangeEvent::new(desc.name, ChangeOp::Update, id));
        Outcome::Ok(())
    }

    /// Delete a bean, cascading along cascade-delete associations.
    ///
    /// Collections are deleted before their owner; to-one targets after it.
    /// A bean that was never saved is only marked deleted.
    #[tracing::instrument(level = "debug", skip(self, cx, tx, bean), fields(entity = bean.entity()))]
    pub async fn delete(&self, cx: &Cx, tx: &mut Transaction, bean: &BeanRef) -> Outcome<(), Error> {
        try_result!(tx.ensure_writable());
        let mut visited = Visited::default();
        try_outcome!(self.delete_bean(cx, tx, bean.clone(), &mut visited, true).await);
        Outcome::Ok(())
    }

    /// Delete by id without an optimistic check. Returns whether a row was deleted.
    #[tracing::instrument(level = "debug", skip(self, cx, tx))]
    pub async fn delete_by_id(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        entity: &str,
        id: EntityId,
    ) -> Outcome<bool, Error> {
        try_result!(tx.ensure_writable());
        let desc = Arc::clone(try_result!(self.descriptor(entity)));
        let cascades = desc
            .properties()
            .iter()
            .any(|p| p.is_association() && p.cascade.delete);

        if cascades {
            let bean = try_result!(self.resolve_reference(tx, desc.name, id, &LoadOptions::default()));
            if desc.to_one_properties().any(|p| p.cascade.delete) {
                match self.ensure_bean_loaded(cx, tx, &bean).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(Error::BatchIntegrity(_)) => return Outcome::Ok(false),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            let mut visited = Visited::default();
            let affected = try_outcome!(self.delete_bean(cx, tx, bean, &mut visited, false).await);
            return Outcome::Ok(affected > 0);
        }

        let plan = try_result!(self.dml_plan(&desc, &DmlShape::delete(desc.name, ConcurrencyCheck::None)));
        let binds = try_result!(self.bind_id(&desc, &id));
        let affected = try_outcome!(
            tx.execute(cx, &Statement::new(Arc::clone(&plan.sql), binds))
                .await
        );
        if affected > 0 {
            if let Some(existing) = tx.context().get(desc.name, &id) {
                existing.write().mark_deleted();
            }
            tx.context_mut().mark_deleted(EntityKey::new(desc.name, id.clone()));
            tx.record(ChangeEvent::new(desc.name, ChangeOp::Delete, id));
        }
        Outcome::Ok(affected > 0)
    }

    /// Returns the row count of this bean's own DELETE.
    fn delete_bean<'a>(
        &'a self,
        cx: &'a Cx,
        tx: &'a mut Transaction,
        bean: BeanRef,
        visited: &'a mut Visited,
        check: bool,
    ) -> PersistFuture<'a, u64> {
        Box::pin(async move {
            if !visited.enter(&bean) {
                return Outcome::Ok(0);
            }
            let (desc, is_new, is_deleted) = {
                let guard = bean.read();
                (Arc::clone(guard.descriptor()), guard.is_new(), guard.is_deleted())
            };
            if is_deleted {
                return Outcome::Ok(0);
            }
            if is_new {
                bean.write().mark_deleted();
                return Outcome::Ok(0);
            }

            for property in desc.to_many_properties().filter(|p| p.cascade.delete) {
                try_outcome!(self.ensure_loaded(cx, tx, &bean, property.name).await);
                let children: Vec<BeanRef> = bean
                    .read()
                    .many_at(property.index)
                    .map(<[BeanRef]>::to_vec)
                    .unwrap_or_default();
                for child in children {
                    try_outcome!(self.delete_bean(cx, tx, child, visited, check).await);
                }
            }

            let mut targets = Vec::new();
            for property in desc.to_one_properties().filter(|p| p.cascade.delete) {
                if let Some(target) = try_outcome!(self.find_one(cx, tx, &bean, property.name).await) {
                    targets.push(target);
                }
            }

            let affected = try_outcome!(self.delete_row(cx, tx, &desc, &bean, check).await);

            for target in targets {
                try_outcome!(self.delete_bean(cx, tx, target, visited, check).await);
            }
            Outcome::Ok(affected)
        })
    }

    async fn delete_row(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        desc: &Arc<EntityDescriptor>,
        bean: &BeanRef,
        check: bool,
    ) -> Outcome<u64, Error> {
        let (id, loaded, token) = {
            let guard = bean.read();
            let token = if check {
                guard.concurrency_token(self.concurrency_mode(desc))
            } else {
                ConcurrencyToken::None
            };
            (guard.id(), guard.loaded_indexes(), token)
        };
        let (occ, check_binds) = concurrency_check(&loaded, desc, token);
        let plan = try_result!(self.dml_plan(desc, &DmlShape::delete(desc.name, occ)));
        let mut binds = try_result!(self.bind_id(desc, &id));
        binds.extend(check_binds);

        let affected = try_outcome!(
            tx.execute(cx, &Statement::new(Arc::clone(&plan.sql), binds))
                .await
        );
        if check && affected != 1 {
            return Outcome::Err(Self::optimistic_lock(desc, id, affected, &plan, bean));
        }

        bean.write().mark_deleted();
        tx.context_mut().mark_deleted(EntityKey::new(desc.name, id.clone()));
        if affected > 0 {
            tx.record(ChangeEvent::new(desc.name, ChangeOp::Delete, id));
        }
        Outcome::Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{engine, order_line_registry, unwrap_outcome};
    use asupersync::runtime::RuntimeBuilder;
    use beanorm_core::{ManagedBean, TransactionErrorKind};
    use beanorm_memory::MemoryStore;
    use beanorm_query::{PlanKind, Query};

    fn seed_order(store: &MemoryStore, id: i64, status: &str, version: i64) {
        store.seed("orders", &["id", "customer_id", "status", "version"], vec![vec![
            Value::BigInt(id),
            Value::Null,
            Value::from(status),
            Value::BigInt(version),
        ]]);
    }

    async fn load(engine: &Engine, cx: &Cx, tx: &mut Transaction, entity: &'static str) -> Vec<BeanRef> {
        let query = Query::new(entity).order_by("id");
        let plan = engine.plan(&query, PlanKind::Select).unwrap();
        let rows = unwrap_outcome(tx.query(cx, &Statement::new(Arc::clone(&plan.sql), vec![])).await);
        engine.materialize(tx, &plan, &rows, &LoadOptions::default()).unwrap()
    }

    #[test]
    fn test_insert_assigns_identity_and_version() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let engine = engine(order_line_registry(), store.clone());

        rt.block_on(async {
            let mut tx = unwrap_outcome(engine.begin(&cx, false).await);
            let order = BeanRef::new(ManagedBean::new(Arc::clone(engine.descriptor("order").unwrap())));
            order.set("status", "OPEN").unwrap();
            unwrap_outcome(engine.save(&cx, &mut tx, &order).await);

            let id = order.read().id();
            assert!(!id.is_null());
            assert_eq!(order.get("version"), Some(Value::BigInt(1)));
            assert!(!order.read().is_new());
            assert!(BeanRef::ptr_eq(&tx.context().get("order", &id).unwrap(), &order));
            assert_eq!(tx.events().len(), 1);
            assert_eq!(tx.events()[0].op, ChangeOp::Insert);
            unwrap_outcome(tx.commit(&cx).await);
        });
        assert_eq!(store.row_count("orders"), 1);
    }

    #[test]
    fn test_update_names_only_changed_column() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        seed_order(&store, 42, "OPEN", 3);
        let engine = engine(order_line_registry(), store.clone());

        rt.block_on(async {
            let mut tx = unwrap_outcome(engine.begin(&cx, false).await);
            let order = load(&engine, &cx, &mut tx, "order").await.remove(0);
            order.set("status", "SHIPPED").unwrap();
            store.clear_log();
            unwrap_outcome(engine.save(&cx, &mut tx, &order).await);

            assert_eq!(store.statements(), vec![
                "UPDATE \"orders\" SET \"status\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4"
                    .to_string()
            ]);
            assert_eq!(order.get("version"), Some(Value::BigInt(4)));
            assert!(!order.read().is_dirty());

            // A clean bean issues nothing.
            store.clear_log();
            unwrap_outcome(engine.save(&cx, &mut tx, &order).await);
            assert!(store.statements().is_empty());
            unwrap_outcome(tx.commit(&cx).await);
        });
        assert_eq!(
            store.value("orders", "id", &Value::BigInt(42), "version"),
            Some(Value::BigInt(4))
        );
    }

    #[test]
    fn test_stale_version_fails_without_changes() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        seed_order(&store, 42, "OPEN", 3);
        let engine = engine(order_line_registry(), store.clone());

        rt.block_on(async {
            let mut tx = unwrap_outcome(engine.begin(&cx, false).await);
            let order = load(&engine, &cx, &mut tx, "order").await.remove(0);
            store.set_value("orders", "id", &Value::BigInt(42), "version", Value::BigInt(4));
            order.set("status", "SHIPPED").unwrap();

            match engine.save(&cx, &mut tx, &order).await {
                Outcome::Err(Error::OptimisticLock(e)) => {
                    assert_eq!(e.entity, "order");
                    assert_eq!(e.affected, 0);
                    assert!(BeanRef::ptr_eq(e.bean.as_ref().unwrap(), &order));
                }
                other => panic!("expected optimistic lock failure, got {other:?}"),
            }
            assert_eq!(order.get("version"), Some(Value::BigInt(3)));
            assert!(order.read().is_dirty());
            assert!(tx.events().is_empty());
            unwrap_outcome(tx.rollback(&cx).await);
        });
        assert_eq!(
            store.value("orders", "id", &Value::BigInt(42), "status"),
            Some(Value::from("OPEN"))
        );
    }

    #[test]
    fn test_cascade_save_sets_foreign_keys() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let engine = engine(order_line_registry(), store.clone());

        rt.block_on(async {
            let mut tx = unwrap_outcome(engine.begin(&cx, false).await);
            let order = BeanRef::new(ManagedBean::new(Arc::clone(engine.descriptor("order").unwrap())));
            order.set("status", "OPEN").unwrap();
            let line_desc = Arc::clone(engine.descriptor("order_line").unwrap());
            for product in ["apple", "pear"] {
                let line = BeanRef::new(ManagedBean::new(Arc::clone(&line_desc)));
                line.set("product", product).unwrap();
                line.set("qty", 1_i32).unwrap();
                order.write().add_child("lines", line).unwrap();
            }
            unwrap_outcome(engine.save(&cx, &mut tx, &order).await);

            let order_id = order.get("id").unwrap();
            for line in order.read().many("lines").unwrap() {
                assert!(line.get("order").unwrap().key_eq(&order_id));
                assert!(!line.read().is_new());
            }
            assert_eq!(tx.events().len(), 3);
            unwrap_outcome(tx.commit(&cx).await);
        });
        assert_eq!(store.row_count("order_lines"), 2);
    }

    #[test]
    fn test_unchanged_children_are_skipped() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        seed_order(&store, 1, "OPEN", 1);
        store.seed("order_lines", &["id", "order_id", "product", "qty"], vec![
            vec![Value::BigInt(10), Value::BigInt(1), Value::from("apple"), Value::Int(2)],
            vec![Value::BigInt(11), Value::BigInt(1), Value::from("pear"), Value::Int(1)],
        ]);
        let engine = engine(order_line_registry(), store.clone());

        rt.block_on(async {
            let mut tx = unwrap_outcome(engine.begin(&cx, false).await);
            let order = load(&engine, &cx, &mut tx, "order").await.remove(0);
            unwrap_outcome(engine.ensure_loaded(&cx, &mut tx, &order, "lines").await);
            assert_eq!(order.read().many("lines").unwrap().len(), 2);

            store.clear_log();
            unwrap_outcome(engine.save(&cx, &mut tx, &order).await);
            assert_eq!(store.statement_count(), 0);
            unwrap_outcome(tx.rollback(&cx).await);
        });
    }

    #[test]
    fn test_delete_cascades_children_first() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        seed_order(&store, 1, "OPEN", 1);
        store.seed("order_lines", &["id", "order_id", "product", "qty"], vec![
            vec![Value::BigInt(10), Value::BigInt(1), Value::from("apple"), Value::Int(2)],
        ]);
        let engine = engine(order_line_registry(), store.clone());

        rt.block_on(async {
            let mut tx = unwrap_outcome(engine.begin(&cx, false).await);
            let order = load(&engine, &cx, &mut tx, "order").await.remove(0);
            unwrap_outcome(engine.delete(&cx, &mut tx, &order).await);

            let ops: Vec<(&str, ChangeOp)> = tx.events().iter().map(|e| (e.entity, e.op)).collect();
            assert_eq!(ops, vec![("order_line", ChangeOp::Delete), ("order", ChangeOp::Delete)]);
            assert!(order.read().is_deleted());
            assert!(tx.context().is_deleted(&EntityKey::new("order", 1_i64)));
            unwrap_outcome(tx.commit(&cx).await);
        });
        assert_eq!(store.row_count("orders"), 0);
        assert_eq!(store.row_count("order_lines"), 0);
    }

    #[test]
    fn test_delete_by_id_reports_missing_rows() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        store.seed("customers", &["id", "email", "name"], vec![vec![
            Value::BigInt(7),
            Value::from("a@example.com"),
            Value::from("Ann"),
        ]]);
        let engine = engine(order_line_registry(), store.clone());

        rt.block_on(async {
            let mut tx = unwrap_outcome(engine.begin(&cx, false).await);
            assert!(unwrap_outcome(engine.delete_by_id(&cx, &mut tx, "customer", EntityId::from(7_i64)).await));
            assert!(!unwrap_outcome(engine.delete_by_id(&cx, &mut tx, "customer", EntityId::from(8_i64)).await));
            assert_eq!(tx.events().len(), 1);
            unwrap_outcome(tx.commit(&cx).await);
        });
        assert_eq!(store.row_count("customers"), 0);
    }

    #[test]
    fn test_read_only_transaction_rejects_writes() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        let engine = engine(order_line_registry(), MemoryStore::new());

        rt.block_on(async {
            let mut tx = unwrap_outcome(engine.begin(&cx, true).await);
            let order = BeanRef::new(ManagedBean::new(Arc::clone(engine.descriptor("order").unwrap())));
            match engine.save(&cx, &mut tx, &order).await {
                Outcome::Err(Error::Transaction(e)) => assert_eq!(e.kind, TransactionErrorKind::ReadOnly),
                other => panic!("expected read-only error, got {other:?}"),
            }
            unwrap_outcome(tx.rollback(&cx).await);
        });
    }
}

//! Persistence context: the per-transaction identity map.
//!
//! Within one context there is exactly one [`BeanRef`] per (entity, id).
//! Every materialization and association resolution goes through
//! [`PersistenceContext::put`], which keeps the first registered instance.
//!
//! A context belongs to one transaction and is not shared between flows, so it
//! carries no lock of its own.

use beanorm_core::{BeanRef, EntityId, EntityKey};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

/// Weak handle identifying a context without keeping it alive.
#[derive(Debug, Clone)]
pub struct ContextHandle(Weak<()>);

impl ContextHandle {
    /// Has the owning context been dropped?
    pub fn is_closed(&self) -> bool {
        self.0.strong_count() == 0
    }

    /// Does this handle name `context`?
    pub fn refers_to(&self, context: &PersistenceContext) -> bool {
        Weak::ptr_eq(&self.0, &Arc::downgrade(&context.token))
    }
}

/// Identity map from (entity, id) to the single managed instance.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    beans: HashMap<EntityKey, BeanRef>,
    deleted: HashSet<EntityKey>,
    token: Arc<()>,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> ContextHandle {
        ContextHandle(Arc::downgrade(&self.token))
    }

    /// The registered instance for (entity, id).
    pub fn get(&self, entity: &'static str, id: &EntityId) -> Option<BeanRef> {
        self.beans.get(&EntityKey::new(entity, id.clone())).cloned()
    }

    pub fn get_key(&self, key: &EntityKey) -> Option<BeanRef> {
        self.beans.get(key).cloned()
    }

    /// Register a bean under its own key and return the registered instance.
    ///
    /// An existing entry wins: the argument is returned unregistered only when
    /// it has no id yet.
    pub fn put(&mut self, bean: BeanRef) -> BeanRef {
        let Some(key) = bean.key() else {
            return bean;
        };
        self.deleted.remove(&key);
        self.beans.entry(key).or_insert(bean).clone()
    }

    /// Register the bean built by `make` unless `key` is already present.
    pub fn put_if_absent(&mut self, key: EntityKey, make: impl FnOnce() -> BeanRef) -> BeanRef {
        self.beans.entry(key).or_insert_with(make).clone()
    }

    pub fn contains(&self, entity: &'static str, id: &EntityId) -> bool {
        self.beans.contains_key(&EntityKey::new(entity, id.clone()))
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<BeanRef> {
        self.beans.remove(key)
    }

    /// Forget `key` and remember that it was deleted in this unit of work.
    pub fn mark_deleted(&mut self, key: EntityKey) {
        self.beans.remove(&key);
        self.deleted.insert(key);
    }

    /// Was `key` deleted through this context?
    pub fn is_deleted(&self, key: &EntityKey) -> bool {
        self.deleted.contains(key)
    }

    pub fn clear(&mut self) {
        self.beans.clear();
        self.deleted.clear();
    }

    pub fn len(&self) -> usize {
        self.beans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beans.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.beans.keys()
    }

    /// Every registered bean of one entity type.
    pub fn beans_of(&self, entity: &str) -> Vec<BeanRef> {
        self.beans
            .iter()
            .filter(|(k, _)| k.entity == entity)
            .map(|(_, b)| b.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beanorm_core::{EntityDescriptor, ManagedBean, PropertyDescriptor, SqlType, Value};

    fn desc() -> Arc<EntityDescriptor> {
        Arc::new(
            EntityDescriptor::builder("order", "orders")
                .property(PropertyDescriptor::id("id", SqlType::BigInt))
                .property(PropertyDescriptor::scalar("status", SqlType::Text))
                .build()
                .unwrap(),
        )
    }

    fn bean(id: i64, status: &str) -> BeanRef {
        BeanRef::new(ManagedBean::loaded(
            desc(),
            vec![Value::BigInt(id), Value::from(status)],
            None,
        ))
    }

    #[test]
    fn test_first_registered_wins() {
        let mut ctx = PersistenceContext::new();
        let first = bean(42, "OPEN");
        let second = bean(42, "CLOSED");
        let a = ctx.put(first.clone());
        let b = ctx.put(second);
        assert!(BeanRef::ptr_eq(&a, &first));
        assert!(BeanRef::ptr_eq(&b, &first));
        assert_eq!(ctx.len(), 1);
        assert_eq!(
            ctx.get("order", &EntityId::from(42_i64)).unwrap().get("status"),
            Some(Value::from("OPEN"))
        );
    }

    #[test]
    fn test_get_never_crosses_ids() {
        let mut ctx = PersistenceContext::new();
        ctx.put(bean(1, "A"));
        ctx.put(bean(2, "B"));
        let got = ctx.get("order", &EntityId::from(2_i64)).unwrap();
        assert_eq!(got.key(), Some(EntityKey::new("order", 2_i64)));
        assert!(ctx.get("order", &EntityId::from(3_i64)).is_none());
        assert!(ctx.get("customer", &EntityId::from(1_i64)).is_none());
    }

    #[test]
    fn test_integer_width_is_same_identity() {
        let mut ctx = PersistenceContext::new();
        let registered = ctx.put(bean(7, "A"));
        let found = ctx.get("order", &EntityId::from(7_i32)).unwrap();
        assert!(BeanRef::ptr_eq(&registered, &found));
    }

    #[test]
    fn test_new_bean_is_not_registered() {
        let mut ctx = PersistenceContext::new();
        let fresh = BeanRef::new(ManagedBean::new(desc()));
        let returned = ctx.put(fresh.clone());
        assert!(BeanRef::ptr_eq(&returned, &fresh));
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_tombstones() {
        let mut ctx = PersistenceContext::new();
        ctx.put(bean(5, "A"));
        let key = EntityKey::new("order", 5_i64);
        ctx.mark_deleted(key.clone());
        assert!(ctx.is_deleted(&key));
        assert!(ctx.get_key(&key).is_none());
        ctx.put(bean(5, "B"));
        assert!(!ctx.is_deleted(&key));
    }

    #[test]
    fn test_put_if_absent_and_handle() {
        let mut ctx = PersistenceContext::new();
        let key = EntityKey::new("order", 9_i64);
        let a = ctx.put_if_absent(key.clone(), || bean(9, "A"));
        let b = ctx.put_if_absent(key, || panic!("must not build"));
        assert!(BeanRef::ptr_eq(&a, &b));

        let handle = ctx.handle();
        assert!(handle.refers_to(&ctx));
        assert!(!handle.refers_to(&PersistenceContext::new()));
        drop(ctx);
        assert!(handle.is_closed());
    }
}

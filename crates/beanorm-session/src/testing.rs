//! Shared fixtures for unit tests.

use crate::engine::Engine;
use beanorm_core::{
    CachePolicy, DescriptorRegistry, EntityDescriptor, Error, Outcome, PropertyDescriptor, SqlType,
};
use beanorm_memory::MemoryStore;
use std::sync::Arc;

pub(crate) fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(value) => value,
        other => panic!("unexpected outcome: {other:?}"),
    }
}

/// customer 1..n order 1..n order_line, with cascading order lines.
pub(crate) fn order_line_registry() -> Arc<DescriptorRegistry> {
    let registry = DescriptorRegistry::builder()
        .register(
            EntityDescriptor::builder("customer", "customers")
                .property(PropertyDescriptor::id("id", SqlType::BigInt))
                .property(PropertyDescriptor::scalar("email", SqlType::Text))
                .property(PropertyDescriptor::scalar("name", SqlType::Text))
                .natural_key("email")
                .cache(CachePolicy::cached()),
        )
        .register(
            EntityDescriptor::builder("order", "orders")
                .property(PropertyDescriptor::id("id", SqlType::BigInt).identity())
                .property(PropertyDescriptor::to_one(
                    "customer",
                    "customer_id",
                    "customer",
                    SqlType::BigInt,
                ))
                .property(PropertyDescriptor::scalar("status", SqlType::Text))
                .property(PropertyDescriptor::version("version"))
                .property(PropertyDescriptor::to_many("lines", "order_line", "order").cascade_all()),
        )
        .register(
            EntityDescriptor::builder("order_line", "order_lines")
                .property(PropertyDescriptor::id("id", SqlType::BigInt).identity())
                .property(PropertyDescriptor::to_one("order", "order_id", "order", SqlType::BigInt))
                .property(PropertyDescriptor::scalar("product", SqlType::Text))
                .property(PropertyDescriptor::scalar("qty", SqlType::Integer)),
        )
        .build()
        .expect("registry");
    Arc::new(registry)
}

pub(crate) fn engine(registry: Arc<DescriptorRegistry>, store: MemoryStore) -> Engine {
    Engine::builder(registry, Arc::new(store))
        .build()
        .expect("engine")
}

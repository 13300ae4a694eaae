//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use beanorm::prelude::*;
use beanorm::{ServerBuilder, Store};
use beanorm_memory::MemoryStore;

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(value) => value,
        other => panic!("unexpected outcome: {other:?}"),
    }
}

/// customer 1..n order 1..n order_line; customers are cached by id and email.
pub fn registry() -> Arc<DescriptorRegistry> {
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

pub fn builder(store: &MemoryStore) -> ServerBuilder {
    let store: Arc<dyn Store> = Arc::new(store.clone());
    Server::builder(registry(), store).config(ServerConfig::new().background_workers(2))
}

pub fn server(store: &MemoryStore) -> Server {
    builder(store).build().expect("server")
}

pub fn seed_customers(store: &MemoryStore, ids: impl IntoIterator<Item = i64>) {
    let rows = ids
        .into_iter()
        .map(|id| {
            vec![
                Value::BigInt(id),
                Value::from(format!("c{id}@example.com")),
                Value::from(format!("Customer {id}")),
            ]
        })
        .collect();
    store.seed("customers", &["id", "email", "name"], rows);
}

/// Seed orders as `(id, customer_id, status, version)`.
pub fn seed_orders(store: &MemoryStore, orders: &[(i64, Option<i64>, &str, i64)]) {
    let rows = orders
        .iter()
        .map(|&(id, customer, status, version)| {
            vec![
                Value::BigInt(id),
                customer.map_or(Value::Null, Value::BigInt),
                Value::from(status),
                Value::BigInt(version),
            ]
        })
        .collect();
    store.seed("orders", &["id", "customer_id", "status", "version"], rows);
}

/// Seed order lines as `(id, order_id, product, qty)`.
pub fn seed_lines(store: &MemoryStore, lines: &[(i64, i64, &str, i32)]) {
    let rows = lines
        .iter()
        .map(|&(id, order, product, qty)| {
            vec![
                Value::BigInt(id),
                Value::BigInt(order),
                Value::from(product),
                Value::Int(qty),
            ]
        })
        .collect();
    store.seed("order_lines", &["id", "order_id", "product", "qty"], rows);
}

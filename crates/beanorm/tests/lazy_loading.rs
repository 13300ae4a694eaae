//! Batched loading of references and collections.

mod common;

use asupersync::runtime::RuntimeBuilder;
use beanorm::prelude::*;
use beanorm::BatchKey;
use beanorm_memory::MemoryStore;
use common::{seed_customers, seed_lines, seed_orders, unwrap_outcome};

fn batching_server(store: &MemoryStore, batch_size: usize) -> Server {
    common::builder(store)
        .config(ServerConfig::new().lazy_batch_size(batch_size).background_workers(1))
        .build()
        .expect("server")
}

/// Seed `n` customers and one order per customer, then load the first
/// order's customer. Returns the statement that loaded the customers.
fn customer_batch_sql(n: i64) -> String {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_customers(&store, 1..=n);
    let orders: Vec<(i64, Option<i64>, &str, i64)> =
        (1..=n).map(|id| (id, Some(id), "OPEN", 1)).collect();
    seed_orders(&store, &orders);
    let server = batching_server(&store, 10);

    rt.block_on(async {
        let mut tx = unwrap_outcome(server.begin(&cx, true).await);
        let listed = unwrap_outcome(
            server
                .find_list(&cx, Some(&mut tx), &Query::new("order").order_by("id"))
                .await,
        );
        assert_eq!(listed.len() as i64, n);
        store.clear_log();

        let customer = unwrap_outcome(server.find_one(&cx, &mut tx, &listed[0], "customer").await)
            .expect("customer");
        assert_eq!(customer.get("email"), Some(Value::from("c1@example.com")));
        assert_eq!(store.statement_count(), 1);
        for id in 1..=n {
            let bean = tx.context().get("customer", &EntityId::from(id)).expect("customer");
            assert!(bean.read().is_fully_loaded());
        }
        let stats = server.lazy_stats(BatchKey::BeanRefresh("customer"));
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.ids, n as u64);
        let sql = store.statements().remove(0);
        unwrap_outcome(tx.rollback(&cx).await);
        sql
    })
}

#[test]
fn test_partial_batch_reuses_full_batch_statement() {
    let partial = customer_batch_sql(3);
    let full = customer_batch_sql(10);
    assert_eq!(partial, full);
    assert!(partial.contains("$10"));
    assert!(!partial.contains("$11"));
}

#[test]
fn test_query_batch_hint_sizes_synchronous_load() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_customers(&store, 1..=3);
    seed_orders(&store, &[(1, Some(1), "OPEN", 1), (2, Some(2), "OPEN", 1), (3, Some(3), "OPEN", 1)]);
    let server = batching_server(&store, 50);

    rt.block_on(async {
        let mut tx = unwrap_outcome(server.begin(&cx, true).await);
        let query = Query::new("order").order_by("id").lazy_batch_size(5);
        let listed = unwrap_outcome(server.find_list(&cx, Some(&mut tx), &query).await);
        store.clear_log();

        unwrap_outcome(server.find_one(&cx, &mut tx, &listed[2], "customer").await).expect("customer");
        let sql = store.statements().remove(0);
        assert!(sql.contains("$5"));
        assert!(!sql.contains("$6"));
        let stats = server.lazy_stats(BatchKey::BeanRefresh("customer"));
        assert_eq!((stats.batches, stats.ids), (1, 3));
        unwrap_outcome(tx.rollback(&cx).await);
    });
}

#[test]
fn test_incomplete_batch_applies_nothing() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_customers(&store, [1]);
    seed_orders(&store, &[(1, Some(1), "OPEN", 1), (2, Some(2), "OPEN", 1)]);
    let server = batching_server(&store, 10);

    rt.block_on(async {
        let mut tx = unwrap_outcome(server.begin(&cx, true).await);
        let listed = unwrap_outcome(
            server
                .find_list(&cx, Some(&mut tx), &Query::new("order").order_by("id"))
                .await,
        );

        match server.find_one(&cx, &mut tx, &listed[1], "customer").await {
            Outcome::Err(Error::BatchIntegrity(e)) => {
                assert_eq!(e.entity, "customer");
                assert_eq!(e.requested, 2);
                assert_eq!(e.found, 1);
                assert_eq!(e.missing, vec![EntityId::from(2_i64)]);
            }
            other => panic!("expected batch integrity failure, got {other:?}"),
        }
        let first = tx.context().get("customer", &EntityId::from(1_i64)).expect("customer 1");
        assert!(first.read().is_reference());

        // Each id loads on its own afterwards; the missing one is absent.
        let loaded = unwrap_outcome(server.find_by_id(&cx, Some(&mut tx), "customer", 1_i64).await)
            .expect("customer 1");
        assert!(BeanRef::ptr_eq(&loaded, &first));
        assert!(loaded.read().is_fully_loaded());
        assert!(unwrap_outcome(server.find_by_id(&cx, Some(&mut tx), "customer", 2_i64).await).is_none());
        unwrap_outcome(tx.rollback(&cx).await);
    });
}

#[test]
fn test_collections_load_together() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_orders(&store, &[(1, None, "OPEN", 1), (2, None, "OPEN", 1), (3, None, "OPEN", 1)]);
    seed_lines(&store, &[(10, 1, "apple", 1), (11, 1, "pear", 2), (12, 3, "plum", 5)]);
    let server = batching_server(&store, 20);

    rt.block_on(async {
        let mut tx = unwrap_outcome(server.begin(&cx, true).await);
        let orders = unwrap_outcome(
            server
                .find_list(&cx, Some(&mut tx), &Query::new("order").order_by("id"))
                .await,
        );
        store.clear_log();

        unwrap_outcome(server.ensure_loaded(&cx, Some(&mut tx), &orders[0], "lines").await);
        assert_eq!(store.statement_count(), 1);
        let sizes: Vec<usize> = orders
            .iter()
            .map(|o| o.read().many("lines").expect("lines loaded").len())
            .collect();
        assert_eq!(sizes, vec![2, 0, 1]);

        let lines = orders[0].read().many("lines").unwrap().to_vec();
        assert_eq!(lines[0].get("product"), Some(Value::from("apple")));
        assert!(lines[0].get("order").unwrap().key_eq(&Value::BigInt(1)));

        // Already loaded: nothing more is issued.
        unwrap_outcome(server.ensure_loaded(&cx, Some(&mut tx), &orders[2], "lines").await);
        assert_eq!(store.statement_count(), 1);

        let stats = server.lazy_stats(BatchKey::Association { entity: "order", property: "lines" });
        assert_eq!((stats.batches, stats.ids, stats.rows), (1, 3, 3));
        unwrap_outcome(tx.rollback(&cx).await);
    });
}

#[test]
fn test_prefetch_loads_within_the_query() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_customers(&store, [1, 2]);
    seed_orders(&store, &[(1, Some(1), "OPEN", 1), (2, Some(2), "OPEN", 1)]);
    seed_lines(&store, &[(10, 1, "apple", 1), (11, 2, "pear", 2)]);
    let server = batching_server(&store, 20);

    rt.block_on(async {
        let mut tx = unwrap_outcome(server.begin(&cx, true).await);
        let query = Query::new("order")
            .order_by("id")
            .prefetch("lines")
            .prefetch("customer");
        let orders = unwrap_outcome(server.find_list(&cx, Some(&mut tx), &query).await);
        assert_eq!(store.statement_count(), 3);
        for order in &orders {
            assert_eq!(order.read().many("lines").expect("lines loaded").len(), 1);
        }
        for id in [1_i64, 2] {
            let customer = tx.context().get("customer", &EntityId::from(id)).expect("customer");
            assert!(customer.read().is_fully_loaded());
        }

        match server
            .find_list(&cx, Some(&mut tx), &Query::new("order").prefetch("invoices"))
            .await
        {
            Outcome::Err(Error::Metadata(_)) => {}
            other => panic!("expected unknown property, got {other:?}"),
        }
        unwrap_outcome(tx.rollback(&cx).await);
    });
}

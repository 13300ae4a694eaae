//! Writes: optimistic concurrency, implicit transactions and change notification.

mod common;

use asupersync::runtime::RuntimeBuilder;
use beanorm::prelude::*;
use beanorm::{ChangeListener, ChangeOp, ConcurrencyMode, ManagedBean, UpdatePolicy};
use beanorm_memory::MemoryStore;
use common::{seed_customers, seed_lines, seed_orders, server, unwrap_outcome};
use std::sync::Mutex;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(&'static str, ChangeOp, EntityId)>>,
}

impl Recorder {
    fn ops(&self) -> Vec<(&'static str, ChangeOp)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(entity, op, _)| (*entity, *op))
            .collect()
    }
}

impl ChangeListener for Recorder {
    fn notify(&self, entity: &'static str, op: ChangeOp, id: &EntityId) {
        self.events.lock().unwrap().push((entity, op, id.clone()));
    }
}

fn recording_server(store: &MemoryStore) -> (Server, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let listener: Arc<dyn ChangeListener> = recorder.clone();
    let server = common::builder(store).listener(listener).build().expect("server");
    (server, recorder)
}

#[test]
fn test_concurrent_flows_on_one_order() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_orders(&store, &[(42, None, "OPEN", 3)]);
    let server = server(&store);

    rt.block_on(async {
        let mut flow_a = unwrap_outcome(server.begin(&cx, false).await);
        let mut flow_b = unwrap_outcome(server.begin(&cx, false).await);
        let order_a = unwrap_outcome(server.find_by_id(&cx, Some(&mut flow_a), "order", 42_i64).await)
            .expect("order 42");
        let order_b = unwrap_outcome(server.find_by_id(&cx, Some(&mut flow_b), "order", 42_i64).await)
            .expect("order 42");
        assert!(!BeanRef::ptr_eq(&order_a, &order_b));

        order_a.set("status", "SHIPPED").unwrap();
        store.clear_log();
        unwrap_outcome(server.save(&cx, Some(&mut flow_a), &order_a).await);
        assert_eq!(store.statements(), vec![
            "UPDATE \"orders\" SET \"status\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4"
                .to_string()
        ]);
        assert_eq!(order_a.get("version"), Some(Value::BigInt(4)));
        unwrap_outcome(flow_a.commit(&cx).await);

        order_b.set("status", "CANCELLED").unwrap();
        match server.save(&cx, Some(&mut flow_b), &order_b).await {
            Outcome::Err(Error::OptimisticLock(e)) => {
                assert_eq!(e.entity, "order");
                assert_eq!(e.id, EntityId::from(42_i64));
                assert_eq!(e.affected, 0);
            }
            other => panic!("expected optimistic lock failure, got {other:?}"),
        }
        assert_eq!(order_b.get("version"), Some(Value::BigInt(3)));
        assert!(order_b.read().is_dirty());
        unwrap_outcome(flow_b.rollback(&cx).await);
    });
    assert_eq!(
        store.value("orders", "id", &Value::BigInt(42), "status"),
        Some(Value::from("SHIPPED"))
    );
    assert_eq!(
        store.value("orders", "id", &Value::BigInt(42), "version"),
        Some(Value::BigInt(4))
    );
}

#[test]
fn test_implicit_transaction_commits_and_notifies() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    let (server, recorder) = recording_server(&store);

    rt.block_on(async {
        let order = BeanRef::new(ManagedBean::new(Arc::clone(server.engine().descriptor("order").unwrap())));
        order.set("status", "OPEN").unwrap();
        let line_desc = Arc::clone(server.engine().descriptor("order_line").unwrap());
        for product in ["apple", "pear"] {
            let line = BeanRef::new(ManagedBean::new(Arc::clone(&line_desc)));
            line.set("product", product).unwrap();
            line.set("qty", 3_i32).unwrap();
            order.write().add_child("lines", line).unwrap();
        }
        unwrap_outcome(server.save(&cx, None, &order).await);
        assert!(!order.read().is_new());
    });
    assert_eq!(store.commit_count(), 1);
    assert_eq!(store.row_count("orders"), 1);
    assert_eq!(store.row_count("order_lines"), 2);
    assert_eq!(recorder.ops(), vec![
        ("order", ChangeOp::Insert),
        ("order_line", ChangeOp::Insert),
        ("order_line", ChangeOp::Insert),
    ]);
}

#[test]
fn test_failed_implicit_write_rolls_back_silently() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    let (server, recorder) = recording_server(&store);

    rt.block_on(async {
        let customer = BeanRef::new(ManagedBean::new(Arc::clone(server.engine().descriptor("customer").unwrap())));
        customer.set("id", 1_i64).unwrap();
        customer.set("email", "a@example.com").unwrap();
        store.fail_next("disk full");
        match server.save(&cx, None, &customer).await {
            Outcome::Err(Error::Query(_)) => {}
            other => panic!("expected query error, got {other:?}"),
        }
    });
    assert_eq!(store.commit_count(), 0);
    assert_eq!(store.rollback_count(), 1);
    assert_eq!(store.row_count("customers"), 0);
    assert!(recorder.ops().is_empty());
}

#[test]
fn test_delete_by_id_cascades_to_lines() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_orders(&store, &[(42, None, "OPEN", 3)]);
    seed_lines(&store, &[(1, 42, "apple", 2), (2, 42, "pear", 1)]);
    let (server, recorder) = recording_server(&store);

    rt.block_on(async {
        assert!(unwrap_outcome(server.delete_by_id(&cx, None, "order", 42_i64).await));
        assert!(!unwrap_outcome(server.delete_by_id(&cx, None, "order", 42_i64).await));
    });
    assert_eq!(store.row_count("orders"), 0);
    assert_eq!(store.row_count("order_lines"), 0);
    assert_eq!(recorder.ops(), vec![
        ("order_line", ChangeOp::Delete),
        ("order_line", ChangeOp::Delete),
        ("order", ChangeOp::Delete),
    ]);
}

#[test]
fn test_rolled_back_transaction_is_not_reported() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_orders(&store, &[(7, None, "OPEN", 1)]);
    let (server, recorder) = recording_server(&store);

    rt.block_on(async {
        let mut tx = unwrap_outcome(server.begin(&cx, false).await);
        let order = unwrap_outcome(server.find_by_id(&cx, Some(&mut tx), "order", 7_i64).await)
            .expect("order 7");
        order.set("status", "SHIPPED").unwrap();
        unwrap_outcome(server.save(&cx, Some(&mut tx), &order).await);
        assert_eq!(tx.events().len(), 1);
        unwrap_outcome(tx.rollback(&cx).await);
    });
    assert!(recorder.ops().is_empty());
    assert_eq!(
        store.value("orders", "id", &Value::BigInt(7), "status"),
        Some(Value::from("OPEN"))
    );
}

fn configured_server(store: &MemoryStore, config: ServerConfig) -> Server {
    common::builder(store)
        .config(config.background_workers(1))
        .build()
        .expect("server")
}

#[test]
fn test_all_properties_check_detects_stale_column() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_customers(&store, [7]);
    let server = configured_server(&store, ServerConfig::new().concurrency_mode(ConcurrencyMode::AllProperties));
    let update_sql =
        "UPDATE \"customers\" SET \"email\" = $1 WHERE \"id\" = $2 AND \"email\" = $3 AND \"name\" = $4";

    rt.block_on(async {
        let mut tx = unwrap_outcome(server.begin(&cx, false).await);
        let customer = unwrap_outcome(server.find_by_id(&cx, Some(&mut tx), "customer", 7_i64).await)
            .expect("customer 7");
        customer.set("email", "first@example.com").unwrap();
        store.clear_log();
        unwrap_outcome(server.save(&cx, Some(&mut tx), &customer).await);
        assert_eq!(store.statements(), vec![update_sql.to_string()]);
        unwrap_outcome(tx.commit(&cx).await);

        let mut tx = unwrap_outcome(server.begin(&cx, false).await);
        let customer = unwrap_outcome(server.find_by_id(&cx, Some(&mut tx), "customer", 7_i64).await)
            .expect("customer 7");
        assert!(store.set_value("customers", "id", &Value::BigInt(7), "name", Value::from("Renamed")));
        customer.set("email", "second@example.com").unwrap();
        store.clear_log();
        match server.save(&cx, Some(&mut tx), &customer).await {
            Outcome::Err(Error::OptimisticLock(e)) => {
                assert_eq!(e.entity, "customer");
                assert_eq!(e.affected, 0);
            }
            other => panic!("expected optimistic lock failure, got {other:?}"),
        }
        assert_eq!(store.statements(), vec![update_sql.to_string()]);
        assert_eq!(customer.get("email"), Some(Value::from("second@example.com")));
        assert!(customer.read().is_dirty());
        unwrap_outcome(tx.rollback(&cx).await);
    });
    assert_eq!(
        store.value("customers", "id", &Value::BigInt(7), "email"),
        Some(Value::from("first@example.com"))
    );
}

#[test]
fn test_all_loaded_update_writes_every_loaded_column() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_customers(&store, [7]);
    let server = configured_server(
        &store,
        ServerConfig::new()
            .update_policy(UpdatePolicy::AllLoaded)
            .concurrency_mode(ConcurrencyMode::None),
    );

    rt.block_on(async {
        let customer = unwrap_outcome(server.find_by_id(&cx, None, "customer", 7_i64).await)
            .expect("customer 7");
        customer.set("name", "Renamed").unwrap();
        store.clear_log();
        unwrap_outcome(server.save(&cx, None, &customer).await);
    });
    assert_eq!(store.statements(), vec![
        "UPDATE \"customers\" SET \"email\" = $1, \"name\" = $2 WHERE \"id\" = $3".to_string()
    ]);
    assert_eq!(
        store.value("customers", "id", &Value::BigInt(7), "name"),
        Some(Value::from("Renamed"))
    );
}

#[test]
fn test_no_concurrency_check_lets_last_writer_win() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_orders(&store, &[(42, None, "OPEN", 3)]);
    let server = configured_server(&store, ServerConfig::new().concurrency_mode(ConcurrencyMode::None));

    rt.block_on(async {
        let mut flow_a = unwrap_outcome(server.begin(&cx, false).await);
        let mut flow_b = unwrap_outcome(server.begin(&cx, false).await);
        let order_a = unwrap_outcome(server.find_by_id(&cx, Some(&mut flow_a), "order", 42_i64).await)
            .expect("order 42");
        let order_b = unwrap_outcome(server.find_by_id(&cx, Some(&mut flow_b), "order", 42_i64).await)
            .expect("order 42");

        order_a.set("status", "SHIPPED").unwrap();
        order_b.set("status", "CANCELLED").unwrap();
        store.clear_log();
        unwrap_outcome(server.save(&cx, Some(&mut flow_a), &order_a).await);
        unwrap_outcome(flow_a.commit(&cx).await);
        unwrap_outcome(server.save(&cx, Some(&mut flow_b), &order_b).await);
        unwrap_outcome(flow_b.commit(&cx).await);

        let update = "UPDATE \"orders\" SET \"status\" = $1 WHERE \"id\" = $2".to_string();
        assert_eq!(store.statements(), vec![update.clone(), update]);
        assert_eq!(order_b.get("version"), Some(Value::BigInt(3)));
    });
    assert_eq!(
        store.value("orders", "id", &Value::BigInt(42), "status"),
        Some(Value::from("CANCELLED"))
    );
    assert_eq!(
        store.value("orders", "id", &Value::BigInt(42), "version"),
        Some(Value::BigInt(3))
    );
}

//! Bean cache limits under a manual clock.

mod common;

use asupersync::runtime::RuntimeBuilder;
use beanorm::prelude::*;
use beanorm::ManualClock;
use beanorm_memory::MemoryStore;
use common::{seed_customers, unwrap_outcome};
use std::time::Duration;

fn customer_cache(store: &MemoryStore, policy: CachePolicy, clock: &Arc<ManualClock>) -> Server {
    common::builder(store)
        .config(ServerConfig::new().entity_cache("customer", policy).background_workers(1))
        .clock(clock.clone())
        .build()
        .expect("server")
}

async fn load(server: &Server, cx: &Cx, id: i64) -> BeanRef {
    unwrap_outcome(server.find_by_id(cx, None, "customer", id).await).expect("customer")
}

#[test]
fn test_entries_expire_after_ttl() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_customers(&store, [7]);
    let clock = ManualClock::new();
    let server = customer_cache(&store, CachePolicy::cached().max_ttl(1_000).max_idle(0), &clock);

    rt.block_on(async {
        load(&server, &cx, 7).await;
        clock.advance(Duration::from_millis(900));
        load(&server, &cx, 7).await;
        assert_eq!(store.count_matching("SELECT"), 1);

        clock.advance(Duration::from_millis(200));
        load(&server, &cx, 7).await;
        assert_eq!(store.count_matching("SELECT"), 2);
    });
    let stats = server.cache().stats("customer").unwrap();
    assert_eq!(stats.beans.evictions, 1);
}

#[test]
fn test_access_refreshes_idle_timer() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_customers(&store, [7]);
    let clock = ManualClock::new();
    let server = customer_cache(&store, CachePolicy::cached().max_ttl(0).max_idle(500), &clock);

    rt.block_on(async {
        load(&server, &cx, 7).await;
        for _ in 0..3 {
            clock.advance(Duration::from_millis(400));
            load(&server, &cx, 7).await;
        }
        assert_eq!(store.count_matching("SELECT"), 1);

        clock.advance(Duration::from_millis(600));
        load(&server, &cx, 7).await;
        assert_eq!(store.count_matching("SELECT"), 2);
    });
}

#[test]
fn test_size_limit_evicts_oldest() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_customers(&store, [1, 2, 3]);
    let clock = ManualClock::new();
    let server = customer_cache(&store, CachePolicy::cached().max_size(2), &clock);

    rt.block_on(async {
        for id in [1, 2, 3] {
            load(&server, &cx, id).await;
        }
        assert_eq!(store.count_matching("SELECT"), 3);

        load(&server, &cx, 3).await;
        assert_eq!(store.count_matching("SELECT"), 3);
        load(&server, &cx, 1).await;
        assert_eq!(store.count_matching("SELECT"), 4);
    });
    let stats = server.cache().stats("customer").unwrap();
    assert_eq!(stats.beans.size, 2);
    assert_eq!(stats.beans.evictions, 2);
}

#[test]
fn test_trim_sweeps_expired_entries() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_customers(&store, [1, 2]);
    let clock = ManualClock::new();
    let server = customer_cache(&store, CachePolicy::cached().max_ttl(1_000), &clock);

    rt.block_on(async {
        load(&server, &cx, 1).await;
        load(&server, &cx, 2).await;
    });
    assert_eq!(server.trim_caches(), 0);
    clock.advance(Duration::from_secs(2));
    assert!(server.trim_caches() >= 2);
    assert_eq!(server.cache().stats("customer").unwrap().beans.size, 0);
}

#[test]
fn test_read_only_cache_shares_values() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    seed_customers(&store, [7]);
    let clock = ManualClock::new();
    let server = customer_cache(&store, CachePolicy::cached().read_only(true), &clock);

    rt.block_on(async {
        let loaded = load(&server, &cx, 7).await;
        assert!(!loaded.read().is_read_only());

        let shared = load(&server, &cx, 7).await;
        assert!(shared.read().is_read_only());
        let snapshot = server
            .cache()
            .bean_get("customer", &EntityId::from(7_i64))
            .expect("cached customer");
        assert!(shared.read().shares_values_with(&snapshot));
        match shared.set("name", "Changed") {
            Err(Error::ReadOnly { entity }) => assert_eq!(entity, "customer"),
            other => panic!("expected read-only error, got {other:?}"),
        }
    });
}

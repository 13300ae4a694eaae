//! Building a server from a JSON configuration document.

mod common;

use beanorm::prelude::*;
use beanorm::Store;
use beanorm_memory::MemoryStore;
use serde_json::json;

fn from_document(document: &serde_json::Value) -> Result<Server> {
    let config = ServerConfig::from_json(&document.to_string())?;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    Server::builder(common::registry(), store).config(config).build()
}

#[test]
fn test_json_config_drives_the_server() {
    let server = from_document(&json!({
        "lazy_batch_size": 50,
        "background_workers": 1,
        "entity_cache": {
            "order": { "bean_cache": true, "query_cache": true, "max_size": 100 }
        }
    }))
    .expect("server");

    assert_eq!(server.config().lazy_batch_size, 50);
    assert!(server.cache().query_cache_enabled("order"));
    assert_eq!(server.cache().policy("order").unwrap().max_size, 100);
    // Declared on the descriptor, untouched by the document.
    assert!(server.cache().bean_cache_enabled("customer"));
    assert!(!server.cache().bean_cache_enabled("order_line"));
}

#[test]
fn test_invalid_config_is_rejected() {
    match from_document(&json!({ "background_workers": 0 })) {
        Err(Error::Config(e)) => assert!(e.message.contains("background_workers")),
        other => panic!("expected config error, got {other:?}"),
    }
    match from_document(&json!({ "lazy_batch_size": "twenty" })) {
        Err(Error::Config(_)) => {}
        other => panic!("expected config error, got {other:?}"),
    }
    assert!(
        Server::builder(common::registry(), Arc::new(MemoryStore::new()))
            .config(ServerConfig::new().lazy_batch_size(0))
            .build()
            .is_err()
    );
}

mod support;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use reactive_store::{MemoryManager, Restriction, Status, StoreConfig, StoreKey};
use serde_json::json;
use support::{hash, Fixture};

#[test]
fn sweeps_restricted_types_on_the_run_loop() {
    let fx = Fixture::new();
    let keys = fx.seed_todos(&[("a", false), ("b", false), ("c", false), ("d", false)]);
    let config = StoreConfig::from_json_str(
        r#"{"memory": {"frequency_ms": 1000,
                       "restrictions": [{"type_name": "Todo", "max": 2}]}}"#,
    )
    .unwrap();

    let evicted = Rc::new(RefCell::new(Vec::<StoreKey>::new()));
    let sink = Rc::clone(&evicted);
    let manager = MemoryManager::from_config(&fx.store, &fx.run_loop, &config.memory)
        .with_after_cleanup(move |records| {
            sink.borrow_mut()
                .extend(records.iter().map(|r| r.store_key.clone()))
        });

    // Reading a record keeps it warm.
    fx.store.materialise_record("Todo", &keys[0]).unwrap();
    manager.start();
    fx.run_loop.advance(Duration::from_millis(999));
    assert!(evicted.borrow().is_empty());

    fx.run_loop.advance(Duration::from_millis(1));
    assert_eq!(*evicted.borrow(), vec![keys[1].clone(), keys[2].clone()]);
    assert_eq!(fx.store.status(&keys[1]), Status::EMPTY);
    assert_eq!(fx.store.get_all_loaded_records("Todo").len(), 2);
    manager.stop();
}

#[test]
fn evicted_records_can_be_fetched_again() {
    let fx = Fixture::new();
    let keys = fx.seed_todos(&[("a", false), ("b", false)]);
    let manager = MemoryManager::new(
        &fx.store,
        &fx.run_loop,
        vec![Restriction::new("Todo", 0)],
        Duration::from_secs(60),
    );
    let evicted = manager.cleanup();
    assert_eq!(evicted.len(), 2);
    assert_eq!(evicted[0].data["title"], json!("a"));

    let todo = fx.store.get_record("Todo", "t1").unwrap();
    assert_eq!(todo.store_key(), Some(&keys[0]));
    fx.settle();
    assert_eq!(todo.status(), Status::READY);
    assert_eq!(todo.get("title"), json!("a"));
}

#[test]
fn never_evicts_unsynced_records() {
    let fx = Fixture::new();
    let keys = fx.seed_todos(&[("a", false), ("b", false)]);
    let created = fx
        .store
        .create_record("Todo", hash(json!({"title": "new"})))
        .unwrap();
    fx.store
        .materialise_record("Todo", &keys[0])
        .unwrap()
        .set("done", json!(true))
        .unwrap();

    let manager = MemoryManager::new(
        &fx.store,
        &fx.run_loop,
        vec![Restriction::new("Todo", 0)],
        Duration::from_secs(60),
    );
    for _ in 0..3 {
        manager.cleanup();
    }

    let mut loaded = fx.store.get_all_loaded_records("Todo");
    loaded.sort();
    let mut expected = vec![keys[0].clone(), created];
    expected.sort();
    assert_eq!(loaded, expected);
}

#[test]
fn committing_records_are_kept() {
    let fx = Fixture::new();
    let keys = fx.seed_todos(&[("a", false)]);
    fx.store
        .materialise_record("Todo", &keys[0])
        .unwrap()
        .set("title", json!("changed"))
        .unwrap();
    fx.store.commit_changes().unwrap();

    let manager = MemoryManager::new(
        &fx.store,
        &fx.run_loop,
        vec![Restriction::new("Todo", 0)],
        Duration::from_secs(60),
    );
    assert!(manager.cleanup().is_empty());
    fx.settle();
    assert_eq!(manager.cleanup().len(), 1);
}

mod support;

use std::cell::RefCell;
use std::rc::Rc;

use reactive_store::{PropertyChange, Status, StoreConfig, UndoManager};
use serde_json::{json, Value};
use support::{hash, Fixture};

#[test]
fn undo_restores_pre_commit_values_and_redo_reapplies() {
    let fx = Fixture::new();
    let keys = fx.seed_todos(&[("Buy milk", false), ("Walk dog", false)]);
    let undo = UndoManager::new(&fx.store, 10);
    let first = fx.store.materialise_record("Todo", &keys[0]).unwrap();
    let second = fx.store.materialise_record("Todo", &keys[1]).unwrap();

    first.set("title", json!("Buy oat milk")).unwrap();
    second.set("done", json!(true)).unwrap();
    fx.store.commit_changes().unwrap();
    fx.settle();

    assert!(undo.undo().unwrap());
    fx.settle();
    assert_eq!(first.get("title"), json!("Buy milk"));
    assert_eq!(second.get("done"), json!(false));
    assert_eq!(fx.source.get("Todo", "t1").unwrap()["title"], json!("Buy milk"));
    assert_eq!(first.status(), Status::READY);

    assert!(undo.redo().unwrap());
    fx.settle();
    assert_eq!(first.get("title"), json!("Buy oat milk"));
    assert_eq!(second.get("done"), json!(true));
    assert_eq!(fx.source.get("Todo", "t2").unwrap()["done"], json!(true));
}

#[test]
fn undoing_a_create_destroys_it_and_redo_recreates() {
    let fx = Fixture::new();
    let undo = UndoManager::new(&fx.store, 10);
    fx.store
        .create_record("Todo", hash(json!({"title": "Buy milk"})))
        .unwrap();
    fx.store.commit_changes().unwrap();
    fx.settle();
    assert_eq!(fx.source.len("Todo"), 1);

    undo.undo().unwrap();
    fx.settle();
    assert_eq!(fx.source.len("Todo"), 0);
    assert!(fx.store.get_all_loaded_records("Todo").is_empty());

    undo.redo().unwrap();
    fx.settle();
    let loaded = fx.store.get_all_loaded_records("Todo");
    assert_eq!(loaded.len(), 1);
    assert_eq!(fx.title(&loaded[0]), Value::from("Buy milk"));
    assert_eq!(fx.store.status(&loaded[0]), Status::READY);
    assert_eq!(fx.source.len("Todo"), 1);

    // The entry pushed by redo refers to the new store key.
    undo.undo().unwrap();
    fx.settle();
    assert_eq!(fx.source.len("Todo"), 0);
}

#[test]
fn pending_changes_are_checkpointed_before_undo() {
    let fx = Fixture::new();
    let keys = fx.seed_todos(&[("Buy milk", false)]);
    let undo = UndoManager::new(&fx.store, 10);
    let todo = fx.store.materialise_record("Todo", &keys[0]).unwrap();

    todo.set("title", json!("Uncommitted")).unwrap();
    assert!(undo.can_undo());
    assert!(undo.undo().unwrap());
    fx.settle();

    assert_eq!(todo.get("title"), json!("Buy milk"));
    assert!(!fx.store.has_changes());
}

#[test]
fn can_undo_and_can_redo_are_observable() {
    let fx = Fixture::new();
    let keys = fx.seed_todos(&[("Buy milk", false)]);
    let config = StoreConfig::from_json_str(r#"{"undo": {"max_undo_count": 3}}"#).unwrap();
    let undo = UndoManager::from_config(&fx.store, &config.undo);
    assert_eq!(undo.max_undo_count(), 3);

    let redo_states = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&redo_states);
    undo.observe(
        "can_redo",
        Rc::new(move |change: &PropertyChange| sink.borrow_mut().push(change.new.clone())),
    );

    let todo = fx.store.materialise_record("Todo", &keys[0]).unwrap();
    todo.set("title", json!("Buy eggs")).unwrap();
    fx.store.commit_changes().unwrap();
    fx.settle();
    assert!(!undo.can_redo());

    undo.undo().unwrap();
    fx.settle();
    assert!(undo.can_redo());

    todo.set("title", json!("Something else")).unwrap();
    assert!(!undo.can_redo());
    assert_eq!(
        *redo_states.borrow(),
        vec![Some(json!(true)), Some(json!(false))]
    );
}

#[test]
fn undo_restores_attributes_the_source_never_sent() {
    let fx = Fixture::new();
    let id = fx
        .source
        .insert("Todo", hash(json!({"title": "Buy milk"})))
        .unwrap();
    fx.store.fetch_all_records("Todo").unwrap();
    fx.settle();
    let undo = UndoManager::new(&fx.store, 10);
    let todo = fx.store.get_record("Todo", &id).unwrap();
    assert_eq!(todo.get("done"), json!(false));

    todo.set("done", json!(true)).unwrap();
    fx.store.commit_changes().unwrap();
    fx.settle();
    assert_eq!(fx.source.get("Todo", &id).unwrap()["done"], json!(true));

    assert!(undo.undo().unwrap());
    fx.settle();
    assert_eq!(todo.get("done"), json!(false));
    assert!(!todo.data().contains_key("done"));
    assert_eq!(todo.status(), Status::READY);
    assert!(!fx.source.get("Todo", &id).unwrap().contains_key("done"));

    assert!(undo.redo().unwrap());
    fx.settle();
    assert_eq!(todo.get("done"), json!(true));
    assert_eq!(fx.source.get("Todo", &id).unwrap()["done"], json!(true));
}

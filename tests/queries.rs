mod support;

use std::cell::RefCell;
use std::rc::Rc;

use reactive_store::{
    LocalQuery, PropertyChange, QueryStatus, RemoteQuery, StoreConfig, StoreKey,
};
use serde_json::{json, Value};
use support::{hash, Fixture};

fn not_done(fx: &Fixture) -> LocalQuery {
    let query = LocalQuery::new(&fx.store, "Todo")
        .with_filter(|hash| hash.get("done") != Some(&json!(true)))
        .with_sort(|a, b| a["title"].as_str().cmp(&b["title"].as_str()));
    fx.store.add_query(&query);
    query
}

#[test]
fn five_todos_two_complete() {
    let fx = Fixture::new();
    let keys = fx.seed_todos(&[
        ("e", false),
        ("d", true),
        ("c", false),
        ("b", true),
        ("a", false),
    ]);
    let query = not_done(&fx);

    assert_eq!(query.status(), QueryStatus::Ready);
    assert_eq!(query.len(), 3);
    assert_eq!(
        query.store_keys(),
        vec![keys[4].clone(), keys[2].clone(), keys[0].clone()]
    );

    let lengths = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&lengths);
    query.observe(
        "length",
        Rc::new(move |change: &PropertyChange| sink.borrow_mut().push(change.new.clone())),
    );

    fx.store
        .materialise_record("Todo", &keys[2])
        .unwrap()
        .set("done", json!(true))
        .unwrap();
    assert_eq!(query.len(), 2);
    assert_eq!(*lengths.borrow(), vec![Some(json!(2))]);
}

#[test]
fn local_query_sees_created_and_destroyed_records() {
    let fx = Fixture::new();
    fx.seed_todos(&[("b", false)]);
    let query = not_done(&fx);

    let created = fx
        .store
        .create_record("Todo", hash(json!({"title": "a"})))
        .unwrap();
    assert_eq!(query.get(0), Some(created.clone()));
    assert_eq!(query.len(), 2);

    fx.store.destroy_record(&created).unwrap();
    assert_eq!(query.len(), 1);
}

#[test]
fn local_refresh_is_idempotent() {
    let fx = Fixture::new();
    fx.seed_todos(&[("b", false), ("a", true), ("c", false)]);
    let query = not_done(&fx);

    let first = query.store_keys();
    query.refresh();
    query.refresh();
    assert_eq!(query.store_keys(), first);
}

type Seen = Rc<RefCell<Option<(Vec<StoreKey>, usize, usize)>>>;

fn recorder() -> (Seen, impl FnOnce(&[StoreKey], usize, usize) + 'static) {
    let seen: Seen = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&seen);
    (seen, move |ids: &[StoreKey], start: usize, end: usize| {
        *sink.borrow_mut() = Some((ids.to_vec(), start, end));
    })
}

#[test]
fn remote_query_loads_windows_on_demand() {
    let fx = Fixture::new();
    for title in ["a", "b", "c", "d", "e"] {
        fx.source.insert("Todo", hash(json!({"title": title}))).unwrap();
    }
    let query = RemoteQuery::new(&fx.store, "Todo", 2);
    assert_eq!(query.status(), QueryStatus::Empty);

    let (seen, callback) = recorder();
    assert!(query.get_ids_for_objects_in_range(0, 3, callback));
    assert_eq!(query.status(), QueryStatus::Loading);
    assert!(seen.borrow().is_none());

    fx.settle();
    let (ids, start, end) = seen.borrow_mut().take().unwrap();
    assert_eq!((start, end), (0, 3));
    assert_eq!(ids.len(), 3);
    assert_eq!(query.status(), QueryStatus::Ready);
    assert_eq!(query.len(), Some(5));
    assert!(query.is_window_loaded(0) && query.is_window_loaded(1));
    assert!(!query.is_window_loaded(2));

    // Records arrived with the ids.
    assert_eq!(fx.title(&ids[2]), Value::from("c"));

    // Loaded windows answer synchronously.
    let (seen, callback) = recorder();
    assert!(!query.get_ids_for_objects_in_range(1, 3, callback));
    assert_eq!(seen.borrow().as_ref().map(|s| (s.1, s.2)), Some((1, 3)));

    // Ranges past the end are clamped once the length is known.
    let (seen, callback) = recorder();
    assert!(query.get_ids_for_objects_in_range(3, 50, callback));
    fx.settle();
    let (ids, start, end) = seen.borrow_mut().take().unwrap();
    assert_eq!((start, end), (3, 5));
    assert_eq!(ids.len(), 2);
}

#[test]
fn remote_query_applies_filter_and_sort() {
    let fx = Fixture::new();
    for (title, done) in [("b", false), ("a", true), ("c", false)] {
        fx.source
            .insert("Todo", hash(json!({"title": title, "done": done})))
            .unwrap();
    }
    let query = RemoteQuery::with_options(
        &fx.store,
        "Todo",
        10,
        Some(json!({"done": false})),
        Some("-title".to_string()),
    );
    assert!(query.fetch());
    fx.settle();

    assert_eq!(query.len(), Some(2));
    let titles: Vec<Value> = (0..2)
        .map(|i| fx.title(&query.get(i).unwrap()))
        .collect();
    assert_eq!(titles, vec![json!("c"), json!("b")]);
}

#[test]
fn remote_results_after_destroy_are_ignored() {
    let fx = Fixture::new();
    fx.source.insert("Todo", hash(json!({"title": "a"}))).unwrap();
    let query = RemoteQuery::new(&fx.store, "Todo", 10);

    let (seen, callback) = recorder();
    assert!(query.get_ids_for_objects_in_range(0, 1, callback));
    query.destroy();
    fx.settle();

    assert_eq!(query.status(), QueryStatus::Destroyed);
    assert_eq!(query.len(), None);
    assert!(seen.borrow().is_none());
}

#[test]
fn remote_refresh_marks_obsolete_then_reloads() {
    let fx = Fixture::new();
    fx.source.insert("Todo", hash(json!({"title": "a"}))).unwrap();
    let query = RemoteQuery::new(&fx.store, "Todo", 10);
    query.fetch();
    fx.settle();
    assert_eq!(query.len(), Some(1));

    fx.source.insert("Todo", hash(json!({"title": "b"}))).unwrap();
    let statuses = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&statuses);
    query.observe(
        "status",
        Rc::new(move |change: &PropertyChange| sink.borrow_mut().push(change.new.clone())),
    );

    assert!(query.refresh());
    fx.settle();
    assert_eq!(query.len(), Some(2));
    assert_eq!(statuses.borrow().first(), Some(&Some(json!("obsolete"))));
    assert_eq!(statuses.borrow().last(), Some(&Some(json!("ready"))));
}

#[test]
fn remote_query_window_size_comes_from_config() {
    let fx = Fixture::new();
    for title in ["a", "b", "c"] {
        fx.source.insert("Todo", hash(json!({"title": title}))).unwrap();
    }
    let config = StoreConfig::from_json_str(r#"{"query": {"window_size": 2}}"#).unwrap();
    let query = RemoteQuery::from_config(&fx.store, "Todo", &config.query);
    assert_eq!(query.window_size(), 2);

    assert!(query.fetch());
    fx.settle();
    assert_eq!(query.len(), Some(3));
    assert!(query.is_window_loaded(0));
    assert!(!query.is_window_loaded(1));
    assert_eq!(query.get(2), None);
}

#[test]
fn unbounded_range_loads_once_the_length_is_known() {
    let fx = Fixture::new();
    for title in ["a", "b", "c", "d", "e"] {
        fx.source.insert("Todo", hash(json!({"title": title}))).unwrap();
    }
    let query = RemoteQuery::new(&fx.store, "Todo", 2);

    let (seen, callback) = recorder();
    assert!(query.get_ids_for_objects_in_range(0, usize::MAX, callback));
    assert!(seen.borrow().is_none());

    fx.settle();
    let (ids, start, end) = seen.borrow_mut().take().unwrap();
    assert_eq!((start, end), (0, 5));
    assert_eq!(ids.len(), 5);
    assert_eq!(query.status(), QueryStatus::Ready);
    assert!((0..3).all(|window| query.is_window_loaded(window)));
}

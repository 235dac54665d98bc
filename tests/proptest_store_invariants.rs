mod support;

use std::rc::Rc;
use std::time::Duration;

use proptest::prelude::*;
use reactive_store::{LocalQuery, MemoryManager, Restriction, StatusFlags, UndoManager};
use serde_json::{json, Value};
use support::Fixture;

fn title() -> impl Strategy<Value = String> {
    "[a-z]{1,6}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn set_then_get_round_trips(titles in prop::collection::vec(title(), 1..8)) {
        let fx = Fixture::new();
        let keys = fx.seed_todos(&[("start", false)]);
        let todo = fx.store.materialise_record("Todo", &keys[0]).unwrap();

        for t in &titles {
            todo.set("title", json!(t)).unwrap();
            prop_assert_eq!(todo.get("title"), json!(t));
            prop_assert_eq!(todo.status().is(StatusFlags::DIRTY), t != "start");
        }
    }

    #[test]
    fn unchanged_sets_keep_hash_identity(t in title()) {
        let fx = Fixture::new();
        let keys = fx.seed_todos(&[(t.as_str(), false)]);
        let before = fx.store.get_hash(&keys[0]).unwrap();

        let todo = fx.store.materialise_record("Todo", &keys[0]).unwrap();
        prop_assert!(!todo.set("title", json!(t)).unwrap());
        prop_assert!(!todo.set("done", json!(false)).unwrap());

        let after = fx.store.get_hash(&keys[0]).unwrap();
        prop_assert!(Rc::ptr_eq(&before, &after));
    }

    #[test]
    fn undo_and_redo_are_strict_inverses(
        edits in prop::collection::vec((0usize..3, title(), any::<bool>()), 1..6)
    ) {
        let fx = Fixture::new();
        let keys = fx.seed_todos(&[("a", false), ("b", false), ("c", false)]);
        let undo = UndoManager::new(&fx.store, 10);

        let snapshot = |fx: &Fixture| -> Vec<Value> {
            keys.iter()
                .map(|sk| {
                    let hash = fx.store.get_hash(sk).unwrap();
                    json!([hash["title"], hash["done"]])
                })
                .collect()
        };
        let before = snapshot(&fx);

        for (index, t, done) in &edits {
            let todo = fx.store.materialise_record("Todo", &keys[*index]).unwrap();
            todo.set("title", json!(t)).unwrap();
            todo.set("done", json!(done)).unwrap();
        }
        fx.store.commit_changes().unwrap();
        fx.settle();
        let after = snapshot(&fx);

        undo.undo().unwrap();
        fx.settle();
        prop_assert_eq!(snapshot(&fx), before);

        undo.redo().unwrap();
        fx.settle();
        prop_assert_eq!(snapshot(&fx), after);
        prop_assert!(!fx.store.has_changes());
    }

    #[test]
    fn local_query_refresh_is_idempotent(done in prop::collection::vec(any::<bool>(), 0..10)) {
        let fx = Fixture::new();
        let todos: Vec<(String, bool)> = done
            .iter()
            .enumerate()
            .map(|(i, d)| (format!("todo {i}"), *d))
            .collect();
        let seeds: Vec<(&str, bool)> = todos.iter().map(|(t, d)| (t.as_str(), *d)).collect();
        fx.seed_todos(&seeds);

        let query = LocalQuery::new(&fx.store, "Todo")
            .with_filter(|hash| hash.get("done") == Some(&json!(true)));
        fx.store.add_query(&query);
        let first = query.store_keys();
        query.refresh();
        prop_assert_eq!(query.store_keys(), first);
        prop_assert_eq!(query.len(), done.iter().filter(|d| **d).count());
    }

    #[test]
    fn memory_manager_never_evicts_unsynced(
        dirty in prop::collection::vec(any::<bool>(), 1..10),
        max in 0usize..5,
        sweeps in 1usize..4,
    ) {
        let fx = Fixture::new();
        let todos: Vec<(String, bool)> =
            (0..dirty.len()).map(|i| (format!("todo {i}"), false)).collect();
        let seeds: Vec<(&str, bool)> = todos.iter().map(|(t, d)| (t.as_str(), *d)).collect();
        let keys = fx.seed_todos(&seeds);
        for (sk, is_dirty) in keys.iter().zip(&dirty) {
            if *is_dirty {
                fx.store
                    .materialise_record("Todo", sk)
                    .unwrap()
                    .set("done", json!(true))
                    .unwrap();
            }
        }

        let manager = MemoryManager::new(
            &fx.store,
            &fx.run_loop,
            vec![Restriction::new("Todo", max)],
            Duration::from_secs(1),
        );
        for _ in 0..sweeps {
            for evicted in manager.cleanup() {
                let status = fx.store.status(&evicted.store_key);
                prop_assert!(!status.is(StatusFlags::DIRTY));
            }
        }
        for (sk, is_dirty) in keys.iter().zip(&dirty) {
            if *is_dirty {
                prop_assert!(fx.store.get_hash(sk).is_some());
            }
        }
        let dirty_count = dirty.iter().filter(|d| **d).count();
        let loaded = fx.store.get_all_loaded_records("Todo").len();
        prop_assert_eq!(loaded, max.max(dirty_count).min(dirty.len()));
    }
}

//! Shared fixtures: a todo schema, an in-memory source and helpers to drive
//! the run loop.

#![allow(dead_code)]

use std::rc::Rc;

use reactive_store::{
    AttributeDef, DataHash, InMemorySource, RecordType, RunLoop, Store, StoreKey, ValueType,
};
use serde_json::{json, Value};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn todo_type() -> RecordType {
    RecordType::new("Todo")
        .with_attribute(
            AttributeDef::attr("title", ValueType::String)
                .nullable(false)
                .default_value(json!(""))
                .validate(|value, _| match value.as_str() {
                    Some("") => Some("a todo needs a title".to_string()),
                    _ => None,
                }),
        )
        .with_attribute(AttributeDef::attr("done", ValueType::Boolean).default_value(json!(false)))
        .with_attribute(AttributeDef::to_one("list", "TodoList"))
        .with_attribute(AttributeDef::attr("expanded", ValueType::Boolean).no_sync())
}

pub fn todo_list_type() -> RecordType {
    RecordType::new("TodoList")
        .with_attribute(AttributeDef::attr("name", ValueType::String).default_value(json!("")))
}

pub struct Fixture {
    pub run_loop: RunLoop,
    pub source: InMemorySource,
    pub store: Store,
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        let run_loop = RunLoop::new();
        let source = InMemorySource::new(&run_loop)
            .with_type("Todo", "t")
            .with_type("TodoList", "l");
        let store = Store::with_source(Rc::new(source.clone()));
        store.register_type(todo_type());
        store.register_type(todo_list_type());
        Fixture {
            run_loop,
            source,
            store,
        }
    }

    /// Put todos in the source and load them all into the store.
    pub fn seed_todos(&self, todos: &[(&str, bool)]) -> Vec<StoreKey> {
        let ids: Vec<String> = todos
            .iter()
            .map(|(title, done)| {
                self.source
                    .insert("Todo", hash(json!({"title": title, "done": done})))
                    .unwrap()
            })
            .collect();
        assert!(self.store.fetch_all_records("Todo").unwrap());
        self.settle();
        ids.iter()
            .map(|id| self.store.get_store_key("Todo", Some(id)))
            .collect()
    }

    /// Run every queued source answer.
    pub fn settle(&self) -> usize {
        self.run_loop.run_pending()
    }

    pub fn title(&self, store_key: &StoreKey) -> Value {
        self.store
            .get_hash(store_key)
            .and_then(|hash| hash.get("title").cloned())
            .unwrap_or(Value::Null)
    }
}

pub fn hash(value: Value) -> DataHash {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

mod support;

use std::cell::RefCell;
use std::rc::Rc;

use reactive_store::{
    AggregateSource, ChangeSet, CommitCallback, FetchCallback, InMemorySource, QueryCallback,
    QueryRequest, RecordType, RunLoop, Source, Status, Store,
};
use serde_json::json;
use support::{hash, todo_list_type, todo_type};

/// Declines everything, remembering what it was offered.
#[derive(Default)]
struct Declining {
    offered: RefCell<Vec<String>>,
}

impl Source for Declining {
    fn fetch_record(&self, record_type: &RecordType, id: &str, _: FetchCallback) -> bool {
        self.offered
            .borrow_mut()
            .push(format!("fetch {}:{}", record_type.name(), id));
        false
    }

    fn fetch_all_records(&self, record_type: &RecordType, _: Option<&str>, _: FetchCallback) -> bool {
        self.offered
            .borrow_mut()
            .push(format!("all {}", record_type.name()));
        false
    }

    fn fetch_query(&self, request: &QueryRequest, _: QueryCallback) -> bool {
        self.offered
            .borrow_mut()
            .push(format!("query {}", request.type_name));
        false
    }

    fn commit_changes(&self, changes: &mut ChangeSet, _: CommitCallback) {
        self.offered
            .borrow_mut()
            .push(format!("commit {}", changes.type_names().join(",")));
    }
}

struct Setup {
    run_loop: RunLoop,
    first: Rc<Declining>,
    last: Rc<Declining>,
    todos: InMemorySource,
    shadow: InMemorySource,
    lists: InMemorySource,
    store: Store,
}

fn setup() -> Setup {
    support::init_tracing();
    let run_loop = RunLoop::new();
    let first = Rc::new(Declining::default());
    let last = Rc::new(Declining::default());
    let todos = InMemorySource::new(&run_loop).with_type("Todo", "t");
    let shadow = InMemorySource::new(&run_loop).with_type("Todo", "s");
    let lists = InMemorySource::new(&run_loop).with_type("TodoList", "l");
    let aggregate = AggregateSource::new()
        .with_source(first.clone())
        .with_source(Rc::new(todos.clone()))
        .with_source(Rc::new(shadow.clone()))
        .with_source(Rc::new(lists.clone()))
        .with_source(last.clone());
    let store = Store::with_source(Rc::new(aggregate));
    store.register_type(todo_type());
    store.register_type(todo_list_type());
    Setup {
        run_loop,
        first,
        last,
        todos,
        shadow,
        lists,
        store,
    }
}

#[test]
fn first_accepting_source_answers_fetches() {
    let s = setup();
    s.todos
        .insert("Todo", hash(json!({"id": "x", "title": "from todos"})))
        .unwrap();
    s.shadow
        .insert("Todo", hash(json!({"id": "x", "title": "from shadow"})))
        .unwrap();

    assert!(s.store.fetch_record("Todo", "x").unwrap());
    s.run_loop.run_pending();

    let sk = s.store.get_store_key("Todo", Some("x"));
    assert_eq!(s.store.status(&sk), Status::READY);
    assert_eq!(s.store.get_hash(&sk).unwrap()["title"], json!("from todos"));
    assert_eq!(*s.first.offered.borrow(), vec!["fetch Todo:x".to_string()]);
}

#[test]
fn fetch_falls_through_to_the_source_for_the_type() {
    let s = setup();
    s.lists
        .insert("TodoList", hash(json!({"name": "Groceries"})))
        .unwrap();

    assert!(s.store.fetch_all_records("TodoList").unwrap());
    s.run_loop.run_pending();
    let loaded = s.store.get_all_loaded_records("TodoList");
    assert_eq!(loaded.len(), 1);
    assert_eq!(s.store.id_for_store_key(&loaded[0]).as_deref(), Some("l1"));
}

#[test]
fn commit_is_split_between_sources() {
    let s = setup();
    s.store
        .create_record("Todo", hash(json!({"title": "Buy milk"})))
        .unwrap();
    s.store
        .create_record("TodoList", hash(json!({"name": "Groceries"})))
        .unwrap();

    assert!(s.store.commit_changes().unwrap());
    s.run_loop.run_pending();

    assert_eq!(s.todos.len("Todo"), 1);
    assert_eq!(s.shadow.len("Todo"), 0);
    assert_eq!(s.lists.len("TodoList"), 1);
    assert_eq!(
        *s.first.offered.borrow(),
        vec!["commit Todo,TodoList".to_string()]
    );
    // Every source is offered the commit, even once nothing is left for it.
    assert_eq!(*s.last.offered.borrow(), vec!["commit ".to_string()]);
    assert!(!s.store.has_changes());
}

#[test]
fn nothing_accepts_an_unknown_type() {
    let run_loop = RunLoop::new();
    let aggregate = AggregateSource::new()
        .with_source(Rc::new(InMemorySource::new(&run_loop).with_type("Todo", "t")));
    assert_eq!(aggregate.len(), 1);
    let store = Store::with_source(Rc::new(aggregate));
    store.register_type(RecordType::new("Note"));

    assert!(!store.fetch_record("Note", "n1").unwrap());
    let sk = store.get_store_key("Note", Some("n1"));
    assert_eq!(store.status(&sk), Status::EMPTY);
    assert!(!run_loop.has_pending());
}

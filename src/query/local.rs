use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::fmt;
use std::rc::{Rc, Weak};

use serde_json::Value;
use tracing::trace;

use super::QueryStatus;
use crate::error::StoreError;
use crate::observable::{ObservableObject, Observer, ObserverId};
use crate::record::Record;
use crate::status::CoreStatus;
use crate::store::{DataHash, ListenerId, Store, StoreEvent, StoreKey, StoreListener};

pub type Filter = Rc<dyn Fn(&DataHash) -> bool>;
pub type Sort = Rc<dyn Fn(&DataHash, &DataHash) -> Ordering>;

pub(crate) struct LocalQueryInner {
    store: Store,
    type_name: String,
    filter: RefCell<Option<Filter>>,
    sort: RefCell<Option<Sort>>,
    store_keys: RefCell<Vec<StoreKey>>,
    status: Cell<QueryStatus>,
    properties: ObservableObject,
    listener: Cell<Option<ListenerId>>,
}

impl LocalQueryInner {
    fn refresh(&self) {
        if self.status.get() == QueryStatus::Destroyed {
            return;
        }
        let filter = self.filter.borrow().clone();
        let sort = self.sort.borrow().clone();

        let mut matches: Vec<(StoreKey, Rc<DataHash>)> = self
            .store
            .get_all_loaded_records(&self.type_name)
            .into_iter()
            .filter(|store_key| self.store.status(store_key).is_core(CoreStatus::Ready))
            .filter_map(|store_key| {
                let hash = self.store.get_hash(&store_key)?;
                Some((store_key, hash))
            })
            .filter(|(_, hash)| filter.as_ref().map(|f| f(hash)).unwrap_or(true))
            .collect();
        if let Some(sort) = sort {
            matches.sort_by(|(_, a), (_, b)| sort(a, b));
        }
        let store_keys: Vec<StoreKey> = matches.into_iter().map(|(store_key, _)| store_key).collect();
        trace!(type_name = %self.type_name, matches = store_keys.len(), "local query refreshed");

        let keys_value = Value::Array(
            store_keys
                .iter()
                .map(|sk| Value::String(sk.as_str().to_string()))
                .collect(),
        );
        let length = store_keys.len();
        *self.store_keys.borrow_mut() = store_keys;
        self.status.set(QueryStatus::Ready);

        self.properties.begin_property_changes();
        self.properties.set("status", Value::from(QueryStatus::Ready.name()));
        self.properties.set("length", Value::from(length));
        self.properties.set("store_keys", keys_value);
        self.properties.end_property_changes();
    }
}

impl StoreListener for LocalQueryInner {
    fn store_did_emit(&self, _store: &Store, event: &StoreEvent) {
        if let StoreEvent::RecordsChanged { type_name } = event {
            if *type_name == self.type_name {
                self.refresh();
            }
        }
    }
}

/// A live, filtered and sorted view over the records of one type that are
/// loaded in the store. Register it with [`Store::add_query`] to keep it
/// current.
#[derive(Clone)]
pub struct LocalQuery {
    inner: Rc<LocalQueryInner>,
}

impl fmt::Debug for LocalQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalQuery")
            .field("type_name", &self.inner.type_name)
            .field("status", &self.inner.status.get())
            .field("length", &self.inner.store_keys.borrow().len())
            .finish()
    }
}

impl LocalQuery {
    pub fn new(store: &Store, type_name: &str) -> Self {
        let properties = ObservableObject::new();
        properties.set("status", Value::from(QueryStatus::Empty.name()));
        properties.set("length", Value::from(0));
        LocalQuery {
            inner: Rc::new(LocalQueryInner {
                store: store.clone(),
                type_name: type_name.to_string(),
                filter: RefCell::new(None),
                sort: RefCell::new(None),
                store_keys: RefCell::new(Vec::new()),
                status: Cell::new(QueryStatus::Empty),
                properties,
                listener: Cell::new(None),
            }),
        }
    }

    pub fn with_filter<F>(self, filter: F) -> Self
    where
        F: Fn(&DataHash) -> bool + 'static,
    {
        *self.inner.filter.borrow_mut() = Some(Rc::new(filter));
        self
    }

    pub fn with_sort<F>(self, sort: F) -> Self
    where
        F: Fn(&DataHash, &DataHash) -> Ordering + 'static,
    {
        *self.inner.sort.borrow_mut() = Some(Rc::new(sort));
        self
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn status(&self) -> QueryStatus {
        self.inner.status.get()
    }

    pub fn refresh(&self) {
        self.inner.refresh();
    }

    pub fn store_keys(&self) -> Vec<StoreKey> {
        self.inner.store_keys.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.store_keys.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<StoreKey> {
        self.inner.store_keys.borrow().get(index).cloned()
    }

    pub fn records(&self) -> Result<Vec<Record>, StoreError> {
        self.store_keys()
            .iter()
            .map(|store_key| self.inner.store.materialise_record(&self.inner.type_name, store_key))
            .collect()
    }

    /// Hand the keys in `start..end` to `callback` right away. Always returns
    /// `false`: a local query never has to wait.
    pub fn get_ids_for_objects_in_range<F>(&self, start: usize, end: usize, callback: F) -> bool
    where
        F: FnOnce(&[StoreKey], usize, usize),
    {
        let keys = self.inner.store_keys.borrow().clone();
        let end = end.min(keys.len());
        let start = start.min(end);
        callback(&keys[start..end], start, end);
        false
    }

    pub fn get_ids_for_all_objects<F>(&self, callback: F) -> bool
    where
        F: FnOnce(&[StoreKey], usize, usize),
    {
        self.get_ids_for_objects_in_range(0, usize::MAX, callback)
    }

    /// Observe `status`, `length` or `store_keys`.
    pub fn observe(&self, key: &str, observer: Rc<dyn Observer>) -> ObserverId {
        self.inner.properties.observe(key, observer)
    }

    pub fn unobserve(&self, key: &str, id: ObserverId) -> bool {
        self.inner.properties.unobserve(key, id)
    }

    pub fn destroy(&self) {
        self.inner.store.remove_query(self);
        self.inner.status.set(QueryStatus::Destroyed);
        self.inner.store_keys.borrow_mut().clear();
        self.inner
            .properties
            .set("status", Value::from(QueryStatus::Destroyed.name()));
    }

    pub(crate) fn listener(&self) -> Weak<dyn StoreListener> {
        Rc::downgrade(&self.inner) as Weak<dyn StoreListener>
    }

    pub(crate) fn set_listener_id(&self, id: Option<ListenerId>) -> Option<ListenerId> {
        self.inner.listener.replace(id)
    }
}

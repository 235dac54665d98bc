use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, trace};

use super::QueryStatus;
use crate::config::QueryConfig;
use crate::observable::{ObservableObject, Observer, ObserverId};
use crate::source::QueryCallback;
use crate::store::{DataHash, Store, StoreKey};

/// One window request sent to the source.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub type_name: String,
    /// Opaque filter understood by the source.
    pub filter: Option<Value>,
    /// Attribute to order by, understood by the source.
    pub sort: Option<String>,
    pub range: Range<usize>,
    pub state: Option<String>,
}

/// The source's answer for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Index of `ids[0]` in the full result list.
    pub position: usize,
    pub ids: Vec<String>,
    /// Length of the full result list.
    pub total: usize,
    /// Data for (some of) the records in `ids`.
    pub records: Vec<DataHash>,
    pub state: Option<String>,
}

type RangeCallback = Box<dyn FnOnce(&[StoreKey], usize, usize)>;

struct Waiting {
    start: usize,
    end: usize,
    callback: RangeCallback,
}

pub(crate) struct RemoteQueryInner {
    store: Store,
    type_name: String,
    filter: Option<Value>,
    sort: Option<String>,
    window_size: usize,
    store_keys: RefCell<Vec<Option<StoreKey>>>,
    length: Cell<Option<usize>>,
    status: Cell<QueryStatus>,
    loaded: RefCell<BTreeSet<usize>>,
    requested: RefCell<BTreeSet<usize>>,
    waiting: RefCell<Vec<Waiting>>,
    properties: ObservableObject,
}

impl RemoteQueryInner {
    fn window_range(&self, window: usize) -> Range<usize> {
        let start = window * self.window_size;
        let end = start + self.window_size;
        match self.length.get() {
            Some(length) => start.min(length)..end.min(length),
            None => start..end,
        }
    }

    fn windows_for(&self, start: usize, end: usize) -> Range<usize> {
        let last = end.max(start + 1) - 1;
        (start / self.window_size)..(last / self.window_size + 1)
    }

    fn set_status(&self, status: QueryStatus) {
        self.status.set(status);
        self.properties.set("status", Value::from(status.name()));
    }

    pub(crate) fn did_fetch(self: &Rc<Self>, result: &QueryResult, store_keys: Vec<StoreKey>) {
        if self.status.get() == QueryStatus::Destroyed {
            trace!(type_name = %self.type_name, "ignoring results for destroyed query");
            return;
        }
        {
            let mut keys = self.store_keys.borrow_mut();
            keys.resize(result.total, None);
            for (offset, store_key) in store_keys.into_iter().enumerate() {
                if let Some(slot) = keys.get_mut(result.position + offset) {
                    *slot = Some(store_key);
                }
            }
        }
        self.length.set(Some(result.total));

        let window_count = result.total.div_ceil(self.window_size);
        {
            let keys = self.store_keys.borrow();
            let mut loaded = self.loaded.borrow_mut();
            let mut requested = self.requested.borrow_mut();
            loaded.retain(|window| *window < window_count);
            for window in 0..window_count {
                let range = self.window_range(window);
                if keys[range].iter().all(Option::is_some) {
                    loaded.insert(window);
                    requested.remove(&window);
                }
            }
            requested.retain(|window| *window < window_count);
        }
        debug!(
            type_name = %self.type_name,
            position = result.position,
            count = result.ids.len(),
            total = result.total,
            "remote query window loaded"
        );

        self.properties.begin_property_changes();
        self.properties.set("length", Value::from(result.total));
        let status = if self.requested.borrow().is_empty() {
            QueryStatus::Ready
        } else {
            QueryStatus::Loading
        };
        self.set_status(status);
        self.properties.end_property_changes();

        self.deliver_waiting();
        self.request_waiting();
    }

    pub(crate) fn did_fail(&self) {
        self.requested.borrow_mut().clear();
        self.waiting.borrow_mut().clear();
        if self.status.get() != QueryStatus::Destroyed {
            let status = if self.length.get().is_some() {
                QueryStatus::Ready
            } else {
                QueryStatus::Empty
            };
            self.set_status(status);
        }
    }

    /// Whether `start..end` can be answered without fetching.
    fn is_satisfied(&self, start: usize, end: usize) -> bool {
        let end = match self.length.get() {
            Some(length) if start >= end.min(length) => return true,
            Some(length) => end.min(length),
            None => end,
        };
        let loaded = self.loaded.borrow();
        self.windows_for(start, end).all(|window| loaded.contains(&window))
    }

    /// Keys in `start..end` clamped to the known length, stopping at the
    /// first gap.
    fn available(&self, start: usize, end: usize) -> (Vec<StoreKey>, usize, usize) {
        let keys = self.store_keys.borrow();
        let end = end.min(keys.len());
        let start = start.min(end);
        let ids: Vec<StoreKey> = keys[start..end].iter().map_while(Clone::clone).collect();
        let end = start + ids.len();
        (ids, start, end)
    }

    /// Request every window in `windows` not already loaded or in flight,
    /// one request per contiguous run.
    fn request_windows(self: &Rc<Self>, windows: Range<usize>) -> bool {
        let missing: Vec<usize> = {
            let loaded = self.loaded.borrow();
            let requested = self.requested.borrow();
            let in_flight = windows
                .clone()
                .any(|window| requested.contains(&window));
            let missing: Vec<usize> = windows
                .filter(|window| !loaded.contains(window) && !requested.contains(window))
                .collect();
            if missing.is_empty() {
                return in_flight;
            }
            missing
        };

        let mut runs: Vec<Range<usize>> = Vec::new();
        for window in missing {
            match runs.last_mut() {
                Some(run) if run.end == window => run.end = window + 1,
                _ => runs.push(window..window + 1),
            }
        }

        let mut accepted = false;
        for run in runs {
            let request = QueryRequest {
                type_name: self.type_name.clone(),
                filter: self.filter.clone(),
                sort: self.sort.clone(),
                range: (run.start * self.window_size)..(run.end * self.window_size),
                state: self.store.type_state(&self.type_name),
            };
            self.requested.borrow_mut().extend(run.clone());
            let callback =
                QueryCallback::new(&self.store, &self.type_name, Rc::downgrade(self));
            if self.store.fetch_query(&request, callback) {
                accepted = true;
                trace!(type_name = %self.type_name, range = ?request.range, "requested window");
            } else {
                let mut requested = self.requested.borrow_mut();
                for window in run {
                    requested.remove(&window);
                }
            }
        }
        if accepted && self.status.get() != QueryStatus::Destroyed {
            self.set_status(QueryStatus::Loading);
        }
        accepted
    }

    /// With the length known, fetch what pending ranges still miss. Ranges
    /// no source will load are answered with what is available.
    fn request_waiting(self: &Rc<Self>) {
        let Some(length) = self.length.get() else {
            return;
        };
        let ranges: Vec<Range<usize>> = self
            .waiting
            .borrow()
            .iter()
            .map(|w| self.windows_for(w.start, w.end.min(length)))
            .collect();
        for windows in ranges {
            self.request_windows(windows);
        }

        let stalled: Vec<Waiting> = {
            let mut waiting = self.waiting.borrow_mut();
            let requested = self.requested.borrow();
            let (stalled, pending) = std::mem::take(&mut *waiting).into_iter().partition(|w| {
                !self
                    .windows_for(w.start, w.end.min(length))
                    .any(|window| requested.contains(&window))
            });
            *waiting = pending;
            stalled
        };
        for waiting in stalled {
            let (ids, start, end) = self.available(waiting.start, waiting.end);
            (waiting.callback)(&ids, start, end);
        }
    }

    fn deliver_waiting(&self) {
        let ready: Vec<Waiting> = {
            let mut waiting = self.waiting.borrow_mut();
            let (ready, pending) = std::mem::take(&mut *waiting)
                .into_iter()
                .partition(|w| self.is_satisfied(w.start, w.end));
            *waiting = pending;
            ready
        };
        for waiting in ready {
            let (ids, start, end) = self.available(waiting.start, waiting.end);
            (waiting.callback)(&ids, start, end);
        }
    }
}

/// A windowed view over a result list held by the source. Windows are
/// fetched on demand and may be loaded sparsely.
#[derive(Clone)]
pub struct RemoteQuery {
    inner: Rc<RemoteQueryInner>,
}

impl fmt::Debug for RemoteQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteQuery")
            .field("type_name", &self.inner.type_name)
            .field("status", &self.inner.status.get())
            .field("length", &self.inner.length.get())
            .field("loaded_windows", &*self.inner.loaded.borrow())
            .finish()
    }
}

impl RemoteQuery {
    pub fn new(store: &Store, type_name: &str, window_size: usize) -> Self {
        RemoteQuery::with_options(store, type_name, window_size, None, None)
    }

    /// A query over `type_name` using the configured window size.
    pub fn from_config(store: &Store, type_name: &str, config: &QueryConfig) -> Self {
        RemoteQuery::new(store, type_name, config.window_size)
    }

    pub fn with_options(
        store: &Store,
        type_name: &str,
        window_size: usize,
        filter: Option<Value>,
        sort: Option<String>,
    ) -> Self {
        let properties = ObservableObject::new();
        properties.set("status", Value::from(QueryStatus::Empty.name()));
        RemoteQuery {
            inner: Rc::new(RemoteQueryInner {
                store: store.clone(),
                type_name: type_name.to_string(),
                filter,
                sort,
                window_size: window_size.max(1),
                store_keys: RefCell::new(Vec::new()),
                length: Cell::new(None),
                status: Cell::new(QueryStatus::Empty),
                loaded: RefCell::new(BTreeSet::new()),
                requested: RefCell::new(BTreeSet::new()),
                waiting: RefCell::new(Vec::new()),
                properties,
            }),
        }
    }

    pub fn status(&self) -> QueryStatus {
        self.inner.status.get()
    }

    pub fn window_size(&self) -> usize {
        self.inner.window_size
    }

    /// Length of the full result list, once any window has loaded.
    pub fn len(&self) -> Option<usize> {
        self.inner.length.get()
    }

    pub fn get(&self, index: usize) -> Option<StoreKey> {
        self.inner.store_keys.borrow().get(index).cloned().flatten()
    }

    pub fn is_window_loaded(&self, window: usize) -> bool {
        self.inner.loaded.borrow().contains(&window)
    }

    /// Load the first window.
    pub fn fetch(&self) -> bool {
        self.inner.request_windows(0..1)
    }

    /// Hand the keys in `start..end` to `callback`.
    ///
    /// Returns `false` if the callback ran before returning, `true` if it will
    /// run once the missing windows arrive.
    pub fn get_ids_for_objects_in_range<F>(&self, start: usize, end: usize, callback: F) -> bool
    where
        F: FnOnce(&[StoreKey], usize, usize) + 'static,
    {
        let inner = &self.inner;
        if inner.status.get() == QueryStatus::Destroyed {
            return false;
        }
        if inner.is_satisfied(start, end) {
            let (ids, start, end) = inner.available(start, end);
            callback(&ids, start, end);
            return false;
        }

        inner.waiting.borrow_mut().push(Waiting {
            start,
            end,
            callback: Box::new(callback),
        });
        // Until the length is known only the window holding `start` is fetched.
        let clamped_end = match inner.length.get() {
            Some(length) => end.min(length),
            None => start.saturating_add(1),
        };
        if inner.request_windows(inner.windows_for(start, clamped_end)) {
            return true;
        }

        let waiting = inner.waiting.borrow_mut().pop();
        if let Some(waiting) = waiting {
            let (ids, start, end) = inner.available(waiting.start, waiting.end);
            (waiting.callback)(&ids, start, end);
        }
        false
    }

    pub fn get_ids_for_all_objects<F>(&self, callback: F) -> bool
    where
        F: FnOnce(&[StoreKey], usize, usize) + 'static,
    {
        match self.inner.length.get() {
            Some(length) => self.get_ids_for_objects_in_range(0, length, callback),
            None => {
                let query = self.clone();
                self.get_ids_for_objects_in_range(0, 1, move |_, _, _| {
                    let length = query.len().unwrap_or(0);
                    query.get_ids_for_objects_in_range(0, length, callback);
                })
            }
        }
    }

    /// Mark every loaded window stale and fetch them again.
    pub fn refresh(&self) -> bool {
        if self.inner.status.get() == QueryStatus::Destroyed {
            return false;
        }
        let windows: Vec<usize> = std::mem::take(&mut *self.inner.loaded.borrow_mut())
            .into_iter()
            .collect();
        self.inner.set_status(QueryStatus::Obsolete);
        let windows = if windows.is_empty() { vec![0] } else { windows };
        let mut accepted = false;
        for window in windows {
            accepted |= self.inner.request_windows(window..window + 1);
        }
        accepted
    }

    pub fn observe(&self, key: &str, observer: Rc<dyn Observer>) -> ObserverId {
        self.inner.properties.observe(key, observer)
    }

    pub fn unobserve(&self, key: &str, id: ObserverId) -> bool {
        self.inner.properties.unobserve(key, id)
    }

    /// Stop the query. Results that arrive afterwards are ignored and pending
    /// range callbacks are dropped.
    pub fn destroy(&self) {
        self.inner.waiting.borrow_mut().clear();
        self.inner.requested.borrow_mut().clear();
        self.inner.set_status(QueryStatus::Destroyed);
    }
}

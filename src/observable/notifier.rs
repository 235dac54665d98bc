//! Change notification core shared by [`ObservableObject`](super::ObservableObject)
//! and the store's per-record property tracking.
//!
//! The notifier owns no property values. It owns the observer lists, the
//! computed-property dependency graph with its cache, and the delivery queue.
//!
//! # Invariants
//!
//! 1. Observers of a key are called in registration order.
//! 2. No observer is called while another observer of the same notifier is
//!    running; changes raised during delivery are queued behind the current
//!    one.
//! 3. Inside `begin_property_changes`/`end_property_changes` changes are
//!    coalesced per key and only delivered by the outermost `end`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use serde_json::Value;

use super::observer::{Observer, ObserverId, PropertyChange};

#[derive(Default)]
struct NotifierState {
    observers: HashMap<String, Vec<(ObserverId, Rc<dyn Observer>)>>,
    next_observer: u64,
    /// dependency key -> computed keys that read it
    dependents: HashMap<String, Vec<String>>,
    computed: HashSet<String>,
    volatile: HashSet<String>,
    cache: HashMap<String, Value>,
    depth: usize,
    batched: Vec<PropertyChange>,
    queue: VecDeque<PropertyChange>,
    flushing: bool,
}

impl NotifierState {
    fn expand(&mut self, change: PropertyChange) -> Vec<PropertyChange> {
        let mut changes = Vec::new();
        let mut visited = HashSet::new();
        let mut pending = VecDeque::new();
        visited.insert(change.key.clone());
        pending.push_back(change.key.clone());
        changes.push(change);

        while let Some(key) = pending.pop_front() {
            let Some(dependents) = self.dependents.get(&key).cloned() else {
                continue;
            };
            for dependent in dependents {
                if !visited.insert(dependent.clone()) {
                    continue;
                }
                let old = self.cache.remove(&dependent);
                if !self.volatile.contains(&dependent) {
                    changes.push(PropertyChange::new(dependent.clone(), old, None));
                }
                pending.push_back(dependent);
            }
        }
        changes
    }

    fn coalesce(&mut self, change: PropertyChange) {
        match self.batched.iter_mut().find(|c| c.key == change.key) {
            Some(existing) => existing.new = change.new,
            None => self.batched.push(change),
        }
    }
}

/// Shared handle; clones refer to the same observers and cache.
#[derive(Clone, Default)]
pub struct Notifier {
    inner: Rc<RefCell<NotifierState>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("Notifier")
            .field("observed_keys", &state.observers.len())
            .field("cached", &state.cache.len())
            .field("depth", &state.depth)
            .finish()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Notifier::default()
    }

    /// Declare `key` as computed from `dependencies`.
    pub fn declare_computed(&self, key: &str, dependencies: &[String], volatile: bool) {
        let mut state = self.inner.borrow_mut();
        state.computed.insert(key.to_string());
        if volatile {
            state.volatile.insert(key.to_string());
        }
        for dependency in dependencies {
            let entry = state.dependents.entry(dependency.clone()).or_default();
            if !entry.iter().any(|k| k == key) {
                entry.push(key.to_string());
            }
        }
    }

    pub fn is_computed(&self, key: &str) -> bool {
        self.inner.borrow().computed.contains(key)
    }

    pub fn cached(&self, key: &str) -> Option<Value> {
        self.inner.borrow().cache.get(key).cloned()
    }

    /// Cache a computed value. Volatile properties are never cached.
    pub fn cache_value(&self, key: &str, value: Value) {
        let mut state = self.inner.borrow_mut();
        if !state.volatile.contains(key) {
            state.cache.insert(key.to_string(), value);
        }
    }

    pub fn observe(&self, key: &str, observer: Rc<dyn Observer>) -> ObserverId {
        let mut state = self.inner.borrow_mut();
        state.next_observer += 1;
        let id = ObserverId(state.next_observer);
        state
            .observers
            .entry(key.to_string())
            .or_default()
            .push((id, observer));
        id
    }

    pub fn unobserve(&self, key: &str, id: ObserverId) -> bool {
        let mut state = self.inner.borrow_mut();
        let Some(list) = state.observers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            state.observers.remove(key);
        }
        removed
    }

    pub fn has_observers(&self, key: &str) -> bool {
        self.inner.borrow().observers.contains_key(key)
    }

    /// No observers, no open transaction and nothing waiting to be delivered.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.borrow();
        state.observers.is_empty()
            && state.depth == 0
            && state.queue.is_empty()
            && !state.flushing
    }

    pub fn begin_property_changes(&self) {
        self.inner.borrow_mut().depth += 1;
    }

    pub fn end_property_changes(&self) {
        let should_flush = {
            let mut state = self.inner.borrow_mut();
            if state.depth == 0 {
                return;
            }
            state.depth -= 1;
            if state.depth > 0 {
                return;
            }
            let batched = std::mem::take(&mut state.batched);
            state.queue.extend(
                batched
                    .into_iter()
                    .filter(|c| c.new.is_none() || c.old != c.new),
            );
            !state.flushing
        };
        if should_flush {
            self.flush();
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.borrow().depth > 0
    }

    /// Record a change of `key`, invalidating every computed property that
    /// depends on it (transitively).
    pub fn property_did_change(&self, key: &str, old: Option<Value>, new: Option<Value>) {
        let should_flush = {
            let mut state = self.inner.borrow_mut();
            let changes = state.expand(PropertyChange::new(key, old, new));
            if state.depth > 0 {
                for change in changes {
                    state.coalesce(change);
                }
                false
            } else {
                state.queue.extend(changes);
                !state.flushing
            }
        };
        if should_flush {
            self.flush();
        }
    }

    /// Drop a cached computed value without notifying.
    pub fn invalidate(&self, key: &str) {
        self.inner.borrow_mut().cache.remove(key);
    }

    fn flush(&self) {
        self.inner.borrow_mut().flushing = true;
        loop {
            let next = {
                let mut state = self.inner.borrow_mut();
                match state.queue.pop_front() {
                    Some(change) => {
                        let observers: Vec<Rc<dyn Observer>> = state
                            .observers
                            .get(&change.key)
                            .map(|list| list.iter().map(|(_, o)| Rc::clone(o)).collect())
                            .unwrap_or_default();
                        Some((change, observers))
                    }
                    None => {
                        state.flushing = false;
                        None
                    }
                }
            };
            let Some((change, observers)) = next else {
                break;
            };
            for observer in observers {
                observer.property_did_change(&change);
            }
        }
    }
}

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use serde_json::Value;

use super::notifier::Notifier;
use super::observer::{Observer, ObserverId};

type ComputeFn = Rc<dyn Fn(&ObservableObject) -> Value>;

struct ObjectInner {
    values: RefCell<HashMap<String, Value>>,
    computed: RefCell<HashMap<String, ComputeFn>>,
    silent: RefCell<HashSet<String>>,
    notifier: Notifier,
}

/// A key/value object with observable plain and computed properties.
///
/// Cloning shares the same underlying object.
#[derive(Clone)]
pub struct ObservableObject {
    inner: Rc<ObjectInner>,
}

impl Default for ObservableObject {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObservableObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableObject")
            .field("values", &self.inner.values.borrow())
            .finish()
    }
}

impl ObservableObject {
    pub fn new() -> Self {
        ObservableObject {
            inner: Rc::new(ObjectInner {
                values: RefCell::new(HashMap::new()),
                computed: RefCell::new(HashMap::new()),
                silent: RefCell::new(HashSet::new()),
                notifier: Notifier::new(),
            }),
        }
    }

    /// Declare a cached computed property.
    pub fn define_computed<F>(&self, key: &str, dependencies: &[&str], compute: F)
    where
        F: Fn(&ObservableObject) -> Value + 'static,
    {
        self.define(key, dependencies, false, Rc::new(compute));
    }

    /// Declare a computed property that is re-evaluated on every read.
    pub fn define_volatile<F>(&self, key: &str, dependencies: &[&str], compute: F)
    where
        F: Fn(&ObservableObject) -> Value + 'static,
    {
        self.define(key, dependencies, true, Rc::new(compute));
    }

    fn define(&self, key: &str, dependencies: &[&str], volatile: bool, compute: ComputeFn) {
        let dependencies: Vec<String> = dependencies.iter().map(|d| d.to_string()).collect();
        self.inner
            .notifier
            .declare_computed(key, &dependencies, volatile);
        self.inner
            .computed
            .borrow_mut()
            .insert(key.to_string(), compute);
    }

    /// Mark a plain property as silent: `set` stores the value but the owner
    /// must call [`property_did_change`](Self::property_did_change) itself.
    pub fn define_silent(&self, key: &str) {
        self.inner.silent.borrow_mut().insert(key.to_string());
    }

    pub fn get(&self, key: &str) -> Value {
        let compute = self.inner.computed.borrow().get(key).cloned();
        match compute {
            Some(compute) => {
                if let Some(cached) = self.inner.notifier.cached(key) {
                    return cached;
                }
                let value = compute(self);
                self.inner.notifier.cache_value(key, value.clone());
                value
            }
            None => self
                .inner
                .values
                .borrow()
                .get(key)
                .cloned()
                .unwrap_or(Value::Null),
        }
    }

    /// Set a plain property. Returns `false` when the value is unchanged.
    pub fn set(&self, key: &str, value: Value) -> bool {
        let old = {
            let mut values = self.inner.values.borrow_mut();
            let old = values.get(key).cloned().unwrap_or(Value::Null);
            if old == value {
                return false;
            }
            values.insert(key.to_string(), value.clone());
            old
        };
        if !self.inner.silent.borrow().contains(key) {
            self.inner
                .notifier
                .property_did_change(key, Some(old), Some(value));
        }
        true
    }

    pub fn property_did_change(&self, key: &str, old: Option<Value>, new: Option<Value>) {
        self.inner.notifier.property_did_change(key, old, new);
    }

    pub fn observe(&self, key: &str, observer: Rc<dyn Observer>) -> ObserverId {
        self.inner.notifier.observe(key, observer)
    }

    pub fn unobserve(&self, key: &str, id: ObserverId) -> bool {
        self.inner.notifier.unobserve(key, id)
    }

    pub fn begin_property_changes(&self) {
        self.inner.notifier.begin_property_changes();
    }

    pub fn end_property_changes(&self) {
        self.inner.notifier.end_property_changes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::PropertyChange;
    use serde_json::json;
    use std::cell::Cell;

    #[test]
    fn set_and_get() {
        let object = ObservableObject::new();
        assert_eq!(object.get("missing"), Value::Null);
        assert!(object.set("name", json!("todo")));
        assert!(!object.set("name", json!("todo")));
        assert_eq!(object.get("name"), json!("todo"));
    }

    #[test]
    fn computed_is_memoized_until_dependency_changes() {
        let object = ObservableObject::new();
        object.set("width", json!(3));
        object.set("height", json!(4));
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        object.define_computed("area", &["width", "height"], move |o| {
            counter.set(counter.get() + 1);
            let w = o.get("width").as_i64().unwrap_or(0);
            let h = o.get("height").as_i64().unwrap_or(0);
            json!(w * h)
        });

        assert_eq!(object.get("area"), json!(12));
        assert_eq!(object.get("area"), json!(12));
        assert_eq!(calls.get(), 1);

        object.set("width", json!(5));
        assert_eq!(object.get("area"), json!(20));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn computed_change_notifies_with_previous_cached_value() {
        let object = ObservableObject::new();
        object.set("first", json!("Ada"));
        object.define_computed("greeting", &["first"], |o| {
            json!(format!("hi {}", o.get("first").as_str().unwrap_or("")))
        });
        let _ = object.get("greeting");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        object.observe(
            "greeting",
            Rc::new(move |change: &PropertyChange| sink.borrow_mut().push(change.clone())),
        );
        object.set("first", json!("Grace"));

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].old, Some(json!("hi Ada")));
        assert_eq!(seen[0].new, None);
        assert_eq!(object.get("greeting"), json!("hi Grace"));
    }

    #[test]
    fn volatile_recomputes_every_read() {
        let object = ObservableObject::new();
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        object.define_volatile("tick", &[], move |_| {
            counter.set(counter.get() + 1);
            json!(counter.get())
        });
        assert_eq!(object.get("tick"), json!(1));
        assert_eq!(object.get("tick"), json!(2));
    }

    #[test]
    fn silent_property_waits_for_owner() {
        let object = ObservableObject::new();
        object.define_silent("status");
        let fired = Rc::new(Cell::new(0));
        let counter = Rc::clone(&fired);
        object.observe(
            "status",
            Rc::new(move |_: &PropertyChange| counter.set(counter.get() + 1)),
        );

        object.set("status", json!("READY"));
        assert_eq!(fired.get(), 0);
        object.property_did_change("status", Some(Value::Null), Some(json!("READY")));
        assert_eq!(fired.get(), 1);
    }
}

//! Bounded memory for the store: evict least recently used records of each
//! restricted type, one type per turn of the run loop.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::MemoryConfig;
use crate::run_loop::{RunLoop, TaskId};
use crate::store::{DataHash, Store, StoreKey};

/// Keep at most `max` loaded records of `type_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restriction {
    pub type_name: String,
    pub max: usize,
}

impl Restriction {
    pub fn new(type_name: &str, max: usize) -> Self {
        Restriction {
            type_name: type_name.to_string(),
            max,
        }
    }
}

/// A record removed from memory, with the data it held.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictedRecord {
    pub type_name: String,
    pub store_key: StoreKey,
    pub data: Rc<DataHash>,
}

type AfterCleanup = Rc<dyn Fn(&[EvictedRecord])>;

struct MemoryManagerInner {
    store: Store,
    run_loop: RunLoop,
    restrictions: Vec<Restriction>,
    frequency: Duration,
    index: Cell<usize>,
    scheduled: Cell<Option<TaskId>>,
    running: Cell<bool>,
    after_cleanup: RefCell<Option<AfterCleanup>>,
}

impl MemoryManagerInner {
    fn cancel_scheduled(&self) {
        if let Some(task) = self.scheduled.take() {
            self.run_loop.cancel(task);
        }
    }

    fn schedule(self: &Rc<Self>, delay: Option<Duration>) {
        let weak: Weak<Self> = Rc::downgrade(self);
        let task = move || {
            if let Some(inner) = weak.upgrade() {
                inner.scheduled.set(None);
                inner.cleanup();
            }
        };
        let id = match delay {
            Some(delay) => self.run_loop.schedule(delay, task),
            None => self.run_loop.next_tick(task),
        };
        self.scheduled.set(Some(id));
    }

    fn cleanup(self: &Rc<Self>) -> Vec<EvictedRecord> {
        self.cancel_scheduled();
        let Some(restriction) = self.restrictions.get(self.index.get()) else {
            return Vec::new();
        };
        let evicted = self.evict(restriction);

        let next = self.index.get() + 1;
        let cycle_done = next >= self.restrictions.len();
        self.index.set(if cycle_done { 0 } else { next });
        if self.running.get() {
            self.schedule(if cycle_done { Some(self.frequency) } else { None });
        }

        if !evicted.is_empty() {
            let hook = self.after_cleanup.borrow().clone();
            if let Some(hook) = hook {
                hook(&evicted);
            }
        }
        evicted
    }

    fn evict(&self, restriction: &Restriction) -> Vec<EvictedRecord> {
        let loaded = self.store.get_all_loaded_records(&restriction.type_name);
        let excess = loaded.len().saturating_sub(restriction.max);
        if excess == 0 {
            trace!(type_name = %restriction.type_name, loaded = loaded.len(), "within limit");
            return Vec::new();
        }

        let mut candidates: Vec<(Option<u64>, StoreKey)> = loaded
            .into_iter()
            .map(|store_key| (self.store.last_access(&store_key), store_key))
            .collect();
        candidates.sort();

        let mut evicted = Vec::with_capacity(excess);
        for (_, store_key) in candidates {
            if evicted.len() == excess {
                break;
            }
            let Some(data) = self.store.get_hash(&store_key) else {
                continue;
            };
            if self.store.unload_record(&store_key) {
                evicted.push(EvictedRecord {
                    type_name: restriction.type_name.clone(),
                    store_key,
                    data,
                });
            }
        }
        debug!(
            type_name = %restriction.type_name,
            max = restriction.max,
            wanted = excess,
            evicted = evicted.len(),
            "memory cleanup"
        );
        evicted
    }
}

/// Periodically unloads records beyond per-type limits.
///
/// Records with unsynced changes are never evicted; `unload_record` refuses
/// them and the next least recently used record is tried instead.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Rc<MemoryManagerInner>,
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("restrictions", &self.inner.restrictions)
            .field("frequency", &self.inner.frequency)
            .field("index", &self.inner.index.get())
            .field("running", &self.inner.running.get())
            .finish()
    }
}

impl MemoryManager {
    pub fn new(
        store: &Store,
        run_loop: &RunLoop,
        restrictions: Vec<Restriction>,
        frequency: Duration,
    ) -> Self {
        MemoryManager {
            inner: Rc::new(MemoryManagerInner {
                store: store.clone(),
                run_loop: run_loop.clone(),
                restrictions,
                frequency,
                index: Cell::new(0),
                scheduled: Cell::new(None),
                running: Cell::new(false),
                after_cleanup: RefCell::new(None),
            }),
        }
    }

    pub fn from_config(store: &Store, run_loop: &RunLoop, config: &MemoryConfig) -> Self {
        MemoryManager::new(
            store,
            run_loop,
            config.restrictions.clone(),
            config.frequency(),
        )
    }

    /// Called with the records evicted by each sweep that evicted any.
    pub fn with_after_cleanup<F>(self, hook: F) -> Self
    where
        F: Fn(&[EvictedRecord]) + 'static,
    {
        *self.inner.after_cleanup.borrow_mut() = Some(Rc::new(hook));
        self
    }

    pub fn restrictions(&self) -> &[Restriction] {
        &self.inner.restrictions
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Schedule the first sweep after one period.
    pub fn start(&self) {
        if self.inner.running.replace(true) {
            return;
        }
        self.inner.schedule(Some(self.inner.frequency));
    }

    pub fn stop(&self) {
        self.inner.running.set(false);
        self.inner.cancel_scheduled();
    }

    /// Sweep the next restricted type now. While running, the following
    /// type is swept on the next tick and a full cycle restarts after one
    /// period.
    pub fn cleanup(&self) -> Vec<EvictedRecord> {
        self.inner.cleanup()
    }
}

impl Drop for MemoryManagerInner {
    fn drop(&mut self) {
        self.cancel_scheduled();
    }
}

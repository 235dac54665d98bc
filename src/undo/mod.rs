//! Undo and redo over committed store changes.
//!
//! A checkpoint is the store's inverse change set, captured just before each
//! commit. Undoing applies the entry as ordinary local changes, records what
//! would reverse that, and commits.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use serde_json::Value;
use tracing::{debug, trace};

use crate::config::UndoConfig;
use crate::error::StoreError;
use crate::observable::{ObservableObject, Observer, ObserverId};
use crate::store::{InverseChanges, ListenerId, Store, StoreEvent, StoreListener};

const CAN_UNDO: &str = "can_undo";
const CAN_REDO: &str = "can_redo";

struct UndoInner {
    store: Store,
    max_undo_count: usize,
    undo_stack: RefCell<VecDeque<InverseChanges>>,
    redo_stack: RefCell<VecDeque<InverseChanges>>,
    in_undo_state: Cell<bool>,
    applying: Cell<bool>,
    properties: ObservableObject,
    listener: Cell<Option<ListenerId>>,
}

impl UndoInner {
    fn push(&self, stack: &RefCell<VecDeque<InverseChanges>>, entry: InverseChanges) {
        let mut stack = stack.borrow_mut();
        stack.push_back(entry);
        while stack.len() > self.max_undo_count {
            stack.pop_front();
        }
    }

    fn can_undo(&self) -> bool {
        !self.undo_stack.borrow().is_empty()
            || (!self.in_undo_state.get() && self.store.has_changes())
    }

    fn can_redo(&self) -> bool {
        !self.redo_stack.borrow().is_empty()
    }

    fn update_properties(&self) {
        self.properties.begin_property_changes();
        self.properties.set(CAN_UNDO, Value::Bool(self.can_undo()));
        self.properties.set(CAN_REDO, Value::Bool(self.can_redo()));
        self.properties.end_property_changes();
    }

    fn save_undo_checkpoint(&self) {
        if self.in_undo_state.get() || self.applying.get() {
            return;
        }
        let inverse = self.store.get_inverse_changes();
        if !inverse.is_empty() {
            trace!(records = inverse.len(), "saving undo checkpoint");
            self.push(&self.undo_stack, inverse);
        }
        self.in_undo_state.set(true);
        self.update_properties();
    }

    fn data_did_change(&self) {
        if self.applying.get() {
            return;
        }
        self.in_undo_state.set(false);
        self.redo_stack.borrow_mut().clear();
        self.update_properties();
    }

    /// Apply `entry`, capture its inverse and commit.
    fn apply(&self, entry: &InverseChanges) -> Result<InverseChanges, StoreError> {
        self.applying.set(true);
        let result = self
            .store
            .apply_changes(entry)
            .map(|()| self.store.get_inverse_changes())
            .and_then(|inverse| self.store.commit_changes().map(|_| inverse));
        self.applying.set(false);
        result
    }

    fn step(
        &self,
        from: &RefCell<VecDeque<InverseChanges>>,
        to: &RefCell<VecDeque<InverseChanges>>,
    ) -> Result<bool, StoreError> {
        let entry = from.borrow_mut().pop_back();
        let Some(entry) = entry else {
            self.update_properties();
            return Ok(false);
        };
        let inverse = self.apply(&entry)?;
        if !inverse.is_empty() {
            self.push(to, inverse);
        }
        self.in_undo_state.set(true);
        self.update_properties();
        Ok(true)
    }
}

impl StoreListener for UndoInner {
    fn store_did_emit(&self, _store: &Store, event: &StoreEvent) {
        match event {
            StoreEvent::WillCommit => self.save_undo_checkpoint(),
            StoreEvent::HasChanges => self.data_did_change(),
            StoreEvent::RecordsChanged { .. } => {}
        }
    }
}

impl Drop for UndoInner {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.store.remove_listener(id);
        }
    }
}

/// Bounded undo/redo stacks driven by the store's commit events.
///
/// Both stacks hold at most `max_undo_count` entries; pushing past the cap
/// drops the oldest.
#[derive(Clone)]
pub struct UndoManager {
    inner: Rc<UndoInner>,
}

impl fmt::Debug for UndoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoManager")
            .field("max_undo_count", &self.inner.max_undo_count)
            .field("undo", &self.inner.undo_stack.borrow().len())
            .field("redo", &self.inner.redo_stack.borrow().len())
            .field("in_undo_state", &self.inner.in_undo_state.get())
            .finish()
    }
}

impl UndoManager {
    pub fn new(store: &Store, max_undo_count: usize) -> Self {
        let properties = ObservableObject::new();
        properties.set(CAN_UNDO, Value::Bool(false));
        properties.set(CAN_REDO, Value::Bool(false));
        let inner = Rc::new(UndoInner {
            store: store.clone(),
            max_undo_count: max_undo_count.max(1),
            undo_stack: RefCell::new(VecDeque::new()),
            redo_stack: RefCell::new(VecDeque::new()),
            in_undo_state: Cell::new(false),
            applying: Cell::new(false),
            properties,
            listener: Cell::new(None),
        });
        let id = store.add_listener(Rc::downgrade(&inner) as Weak<dyn StoreListener>);
        inner.listener.set(Some(id));
        UndoManager { inner }
    }

    pub fn from_config(store: &Store, config: &UndoConfig) -> Self {
        UndoManager::new(store, config.max_undo_count)
    }

    /// Capture the store's pending changes as an undo entry, unless a
    /// checkpoint was already taken since the last local change.
    pub fn save_undo_checkpoint(&self) {
        self.inner.save_undo_checkpoint();
    }

    pub fn undo(&self) -> Result<bool, StoreError> {
        self.inner.save_undo_checkpoint();
        let undone = self
            .inner
            .step(&self.inner.undo_stack, &self.inner.redo_stack)?;
        debug!(undone, remaining = self.undo_count(), "undo");
        Ok(undone)
    }

    pub fn redo(&self) -> Result<bool, StoreError> {
        let redone = self
            .inner
            .step(&self.inner.redo_stack, &self.inner.undo_stack)?;
        debug!(redone, remaining = self.redo_count(), "redo");
        Ok(redone)
    }

    pub fn can_undo(&self) -> bool {
        self.inner.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.inner.can_redo()
    }

    pub fn undo_count(&self) -> usize {
        self.inner.undo_stack.borrow().len()
    }

    pub fn redo_count(&self) -> usize {
        self.inner.redo_stack.borrow().len()
    }

    pub fn max_undo_count(&self) -> usize {
        self.inner.max_undo_count
    }

    /// Forget every entry on both stacks.
    pub fn reset(&self) {
        self.inner.undo_stack.borrow_mut().clear();
        self.inner.redo_stack.borrow_mut().clear();
        self.inner.in_undo_state.set(false);
        self.inner.update_properties();
    }

    /// Observe `can_undo` or `can_redo`.
    pub fn observe(&self, key: &str, observer: Rc<dyn Observer>) -> ObserverId {
        self.inner.properties.observe(key, observer)
    }

    pub fn unobserve(&self, key: &str, id: ObserverId) -> bool {
        self.inner.properties.unobserve(key, id)
    }
}

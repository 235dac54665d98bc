use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};

use serde_json::Value;
use tracing::{debug, trace};

use super::events::{ListenerId, StoreEvent, StoreListener};
use super::references::ReferenceGraph;
use super::{DataHash, StoreKey};
use crate::error::StoreError;
use crate::observable::{Notifier, Observer, ObserverId};
use crate::query::LocalQuery;
use crate::record::{Record, RecordType};
use crate::source::Source;
use crate::status::{CoreStatus, Status, StatusError, StatusFlags};

pub(crate) const STATUS_KEY: &str = "status";
pub(crate) const ERRORS_KEY: &str = "errors";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitKind {
    Create,
    Update,
    Destroy,
}

/// A commit dispatched to the source and not yet answered.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub(crate) kind: CommitKind,
    /// Dispatch that carried this change; answers from other dispatches are stale.
    pub(crate) sequence: u64,
    /// Committed hash before the optimistic advance, restored on rejection.
    pub(crate) rollback: Option<Rc<DataHash>>,
}

/// An attribute write; `None` removes the key from the hash.
pub(crate) type AttributeEdit = (String, Option<Value>);

struct DeferredUpdate {
    edits: Vec<AttributeEdit>,
    mark_dirty: bool,
}

#[derive(Default)]
pub(crate) struct StoreState {
    next_key: u64,
    pub(crate) commit_sequence: u64,
    pub(crate) type_of: HashMap<StoreKey, String>,
    pub(crate) id_of: HashMap<StoreKey, String>,
    keys_by_id: HashMap<String, HashMap<String, StoreKey>>,
    pub(crate) hashes: HashMap<StoreKey, Rc<DataHash>>,
    pub(crate) committed: HashMap<StoreKey, Rc<DataHash>>,
    pub(crate) status: HashMap<StoreKey, Status>,
    pub(crate) in_flight: HashMap<StoreKey, InFlight>,
    /// Dirty records skipped by a commit because a previous commit was in flight.
    pub(crate) queued_commits: BTreeSet<StoreKey>,
    pub(crate) errors: HashMap<StoreKey, BTreeMap<String, String>>,
    last_access: HashMap<StoreKey, u64>,
    access_clock: u64,
    pub(crate) type_state: HashMap<String, String>,
    pub(crate) remapped: HashMap<StoreKey, StoreKey>,
    pub(crate) references: ReferenceGraph,
    updating: HashSet<StoreKey>,
    deferred: HashMap<StoreKey, VecDeque<DeferredUpdate>>,
}

impl StoreState {
    pub(crate) fn status(&self, store_key: &StoreKey) -> Status {
        self.status.get(store_key).copied().unwrap_or_default()
    }

    pub(crate) fn set_status(
        &mut self,
        store_key: &StoreKey,
        status: Status,
        announce: &mut Announcements,
    ) {
        let old = self.status(store_key);
        if status == Status::EMPTY {
            self.status.remove(store_key);
        } else {
            self.status.insert(store_key.clone(), status);
        }
        announce.status(store_key, old, status);
    }

    fn allocate(&mut self, type_name: &str, id: Option<&str>) -> StoreKey {
        self.next_key += 1;
        let store_key = StoreKey::from_sequence(self.next_key);
        self.type_of.insert(store_key.clone(), type_name.to_string());
        if let Some(id) = id {
            self.bind_id(&store_key, type_name, id);
        }
        store_key
    }

    pub(crate) fn key_for_id(&self, type_name: &str, id: &str) -> Option<StoreKey> {
        self.keys_by_id
            .get(type_name)
            .and_then(|ids| ids.get(id))
            .cloned()
    }

    pub(crate) fn bind_id(&mut self, store_key: &StoreKey, type_name: &str, id: &str) {
        self.unbind_id(store_key);
        self.id_of.insert(store_key.clone(), id.to_string());
        self.keys_by_id
            .entry(type_name.to_string())
            .or_default()
            .insert(id.to_string(), store_key.clone());
    }

    pub(crate) fn unbind_id(&mut self, store_key: &StoreKey) {
        let Some(id) = self.id_of.remove(store_key) else {
            return;
        };
        if let Some(type_name) = self.type_of.get(store_key) {
            if let Some(ids) = self.keys_by_id.get_mut(type_name) {
                if ids.get(&id) == Some(store_key) {
                    ids.remove(&id);
                }
            }
        }
    }

    /// Attributes whose current value differs from the committed one.
    pub(crate) fn changed_attributes(&self, store_key: &StoreKey) -> BTreeSet<String> {
        let empty = DataHash::new();
        let current = self.hashes.get(store_key).map(|h| &**h).unwrap_or(&empty);
        let committed = self
            .committed
            .get(store_key)
            .map(|h| &**h)
            .unwrap_or(&empty);
        current
            .keys()
            .chain(committed.keys())
            .filter(|key| current.get(*key) != committed.get(*key))
            .cloned()
            .collect()
    }

    /// Recompute DIRTY from the committed diff. A record created locally stays
    /// dirty until its create is in flight; destroyed records keep their flags.
    pub(crate) fn settle_dirty(
        &self,
        store_key: &StoreKey,
        status: Status,
    ) -> Result<Status, StatusError> {
        if status.is_core(CoreStatus::Destroyed) {
            return Ok(status);
        }
        if status.is(StatusFlags::NEW) && !status.is(StatusFlags::COMMITTING) {
            return status.with(StatusFlags::DIRTY);
        }
        if self.changed_attributes(store_key).is_empty() {
            status.without(StatusFlags::DIRTY)
        } else {
            status.with(StatusFlags::DIRTY)
        }
    }

    pub(crate) fn touch(&mut self, store_key: &StoreKey) {
        self.access_clock += 1;
        self.last_access
            .insert(store_key.clone(), self.access_clock);
    }

    /// Drop a record's data while keeping its key, type and id binding.
    pub(crate) fn release(&mut self, store_key: &StoreKey) {
        self.hashes.remove(store_key);
        self.committed.remove(store_key);
        self.errors.remove(store_key);
        self.last_access.remove(store_key);
        self.in_flight.remove(store_key);
        self.queued_commits.remove(store_key);
        self.references.remove_record(store_key);
    }
}

/// Notifications collected while the state is borrowed and delivered after
/// the borrow ends.
#[derive(Default)]
pub(crate) struct Announcements {
    changes: Vec<(StoreKey, String, Option<Value>, Option<Value>)>,
    types: BTreeSet<String>,
    revalidate: Vec<(StoreKey, Vec<String>)>,
    invalidate: Vec<StoreKey>,
    has_changes: bool,
}

impl Announcements {
    pub(crate) fn status(&mut self, store_key: &StoreKey, old: Status, new: Status) {
        if old != new {
            self.changes.push((
                store_key.clone(),
                STATUS_KEY.to_string(),
                Some(Value::from(old.bits())),
                Some(Value::from(new.bits())),
            ));
        }
    }

    pub(crate) fn attribute(
        &mut self,
        store_key: &StoreKey,
        key: &str,
        old: Option<Value>,
        new: Option<Value>,
    ) {
        self.changes
            .push((store_key.clone(), key.to_string(), old, new));
    }

    pub(crate) fn diff(&mut self, store_key: &StoreKey, old: &DataHash, new: &DataHash) {
        for key in old.keys().chain(new.keys().filter(|k| !old.contains_key(*k))) {
            let (before, after) = (old.get(key), new.get(key));
            if before != after {
                self.attribute(store_key, key, before.cloned(), after.cloned());
            }
        }
    }

    pub(crate) fn type_changed(&mut self, type_name: &str) {
        self.types.insert(type_name.to_string());
    }

    pub(crate) fn revalidate(&mut self, store_key: &StoreKey, keys: Vec<String>) {
        if !keys.is_empty() {
            self.revalidate.push((store_key.clone(), keys));
        }
    }

    pub(crate) fn data_released(&mut self, store_key: &StoreKey) {
        self.invalidate.push(store_key.clone());
    }

    pub(crate) fn has_changes(&mut self) {
        self.has_changes = true;
    }
}

pub(crate) struct StoreInner {
    pub(crate) state: RefCell<StoreState>,
    types: RefCell<HashMap<String, Rc<RecordType>>>,
    source: RefCell<Option<Rc<dyn Source>>>,
    listeners: RefCell<Vec<(ListenerId, Weak<dyn StoreListener>)>>,
    next_listener: Cell<u64>,
    notifiers: RefCell<HashMap<StoreKey, Notifier>>,
    event_depth: Cell<usize>,
    pending_events: RefCell<Vec<StoreEvent>>,
}

/// Defers store events until the outermost public operation finishes.
pub(crate) struct EventBatch<'a> {
    store: &'a Store,
}

impl Drop for EventBatch<'_> {
    fn drop(&mut self) {
        let depth = self.store.inner.event_depth.get().saturating_sub(1);
        self.store.inner.event_depth.set(depth);
        if depth == 0 {
            self.store.flush_events();
        }
    }
}

/// Shared handle to a record store. Clones refer to the same store.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Rc<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Store")
            .field("records", &state.status.len())
            .field("loaded", &state.hashes.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

impl Store {
    pub fn new() -> Self {
        Store {
            inner: Rc::new(StoreInner {
                state: RefCell::new(StoreState::default()),
                types: RefCell::new(HashMap::new()),
                source: RefCell::new(None),
                listeners: RefCell::new(Vec::new()),
                next_listener: Cell::new(0),
                notifiers: RefCell::new(HashMap::new()),
                event_depth: Cell::new(0),
                pending_events: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn with_source(source: Rc<dyn Source>) -> Self {
        let store = Store::new();
        store.set_source(source);
        store
    }

    pub fn set_source(&self, source: Rc<dyn Source>) {
        *self.inner.source.borrow_mut() = Some(source);
    }

    pub(crate) fn source(&self) -> Option<Rc<dyn Source>> {
        self.inner.source.borrow().clone()
    }

    pub(crate) fn downgrade(&self) -> Weak<StoreInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<StoreInner>) -> Option<Store> {
        weak.upgrade().map(|inner| Store { inner })
    }

    pub fn ptr_eq(&self, other: &Store) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- types -------------------------------------------------------------

    pub fn register_type(&self, record_type: RecordType) -> Rc<RecordType> {
        let record_type = Rc::new(record_type);
        debug!(type_name = record_type.name(), "registered record type");
        self.inner
            .types
            .borrow_mut()
            .insert(record_type.name().to_string(), Rc::clone(&record_type));
        record_type
    }

    pub fn record_type(&self, type_name: &str) -> Result<Rc<RecordType>, StoreError> {
        self.inner
            .types
            .borrow()
            .get(type_name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownType(type_name.to_string()))
    }

    pub(crate) fn record_type_of(&self, store_key: &StoreKey) -> Result<Rc<RecordType>, StoreError> {
        let type_name = self
            .type_name_for_store_key(store_key)
            .ok_or_else(|| StoreError::UnknownStoreKey(store_key.clone()))?;
        self.record_type(&type_name)
    }

    // ---- keys and reads ----------------------------------------------------

    /// Store key for `(type_name, id)`, allocating one on first sight. Without
    /// an id a fresh key is always allocated.
    pub fn get_store_key(&self, type_name: &str, id: Option<&str>) -> StoreKey {
        let mut state = self.inner.state.borrow_mut();
        if let Some(store_key) = id.and_then(|id| state.key_for_id(type_name, id)) {
            return store_key;
        }
        let store_key = state.allocate(type_name, id);
        trace!(%store_key, type_name, ?id, "allocated store key");
        store_key
    }

    /// Follow the keys a record was re-created under by `apply_changes`.
    pub fn resolve_store_key(&self, store_key: &StoreKey) -> StoreKey {
        let state = self.inner.state.borrow();
        let mut current = store_key.clone();
        while let Some(next) = state.remapped.get(&current) {
            current = next.clone();
        }
        current
    }

    pub fn id_for_store_key(&self, store_key: &StoreKey) -> Option<String> {
        self.inner.state.borrow().id_of.get(store_key).cloned()
    }

    pub fn type_name_for_store_key(&self, store_key: &StoreKey) -> Option<String> {
        self.inner.state.borrow().type_of.get(store_key).cloned()
    }

    pub fn status(&self, store_key: &StoreKey) -> Status {
        self.inner.state.borrow().status(store_key)
    }

    /// Current data. The returned `Rc` stays identical until the next
    /// change to this record.
    pub fn get_hash(&self, store_key: &StoreKey) -> Option<Rc<DataHash>> {
        self.inner.state.borrow().hashes.get(store_key).cloned()
    }

    /// Data as last confirmed by the source, if it has been committed.
    pub fn committed_hash(&self, store_key: &StoreKey) -> Option<Rc<DataHash>> {
        self.inner.state.borrow().committed.get(store_key).cloned()
    }

    pub fn last_access(&self, store_key: &StoreKey) -> Option<u64> {
        self.inner
            .state
            .borrow()
            .last_access
            .get(store_key)
            .copied()
    }

    pub(crate) fn touch(&self, store_key: &StoreKey) {
        let mut state = self.inner.state.borrow_mut();
        if state.hashes.contains_key(store_key) {
            state.touch(store_key);
        }
    }

    /// State string last reported by the source for a type.
    pub fn type_state(&self, type_name: &str) -> Option<String> {
        self.inner
            .state
            .borrow()
            .type_state
            .get(type_name)
            .cloned()
    }

    /// Store keys of every loaded record of a type, in allocation order.
    pub fn get_all_loaded_records(&self, type_name: &str) -> Vec<StoreKey> {
        let state = self.inner.state.borrow();
        let mut keys: Vec<StoreKey> = state
            .hashes
            .keys()
            .filter(|sk| state.type_of.get(*sk).map(String::as_str) == Some(type_name))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn has_changes(&self) -> bool {
        self.inner.state.borrow().status.values().any(|status| {
            status.is(StatusFlags::DIRTY) || status.is(StatusFlags::NEW)
        })
    }

    // ---- writes ------------------------------------------------------------

    /// Merge `partial` into the record's data.
    ///
    /// With `mark_dirty` the change is local; otherwise it also advances the
    /// committed baseline, as when a source pushes new data. Updates to a key
    /// that arrive while an update of that key is being applied (from an
    /// observer) are queued and applied afterwards.
    pub fn update_hash(
        &self,
        store_key: &StoreKey,
        partial: DataHash,
        mark_dirty: bool,
    ) -> Result<(), StoreError> {
        let edits = partial.into_iter().map(|(key, value)| (key, Some(value))).collect();
        self.edit_hash(store_key, edits, mark_dirty)
    }

    /// Like `update_hash`, but an edit of `None` removes the attribute.
    pub(crate) fn edit_hash(
        &self,
        store_key: &StoreKey,
        edits: Vec<AttributeEdit>,
        mark_dirty: bool,
    ) -> Result<(), StoreError> {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.updating.contains(store_key) {
                trace!(%store_key, "deferring re-entrant update");
                state
                    .deferred
                    .entry(store_key.clone())
                    .or_default()
                    .push_back(DeferredUpdate { edits, mark_dirty });
                return Ok(());
            }
            state.updating.insert(store_key.clone());
        }

        let mut result = self.apply_update(store_key, edits, mark_dirty);
        loop {
            let next = {
                let mut state = self.inner.state.borrow_mut();
                let next = state
                    .deferred
                    .get_mut(store_key)
                    .and_then(VecDeque::pop_front);
                if next.is_none() {
                    state.deferred.remove(store_key);
                    state.updating.remove(store_key);
                }
                next
            };
            let Some(update) = next else {
                break;
            };
            let applied = self.apply_update(store_key, update.edits, update.mark_dirty);
            if result.is_ok() {
                result = applied;
            }
        }
        result
    }

    fn apply_update(
        &self,
        store_key: &StoreKey,
        edits: Vec<AttributeEdit>,
        mark_dirty: bool,
    ) -> Result<(), StoreError> {
        let _batch = self.batch();
        let mut announce = Announcements::default();
        {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let status = state.status(store_key);
            if !status.is_core(CoreStatus::Ready) {
                return Err(StoreError::NotPermitted {
                    store_key: store_key.clone(),
                    status,
                    operation: "update",
                });
            }
            let current = state
                .hashes
                .get(store_key)
                .cloned()
                .ok_or_else(|| StoreError::UnknownStoreKey(store_key.clone()))?;

            let mut next = (*current).clone();
            let mut changed = Vec::new();
            for (key, value) in edits {
                if next.get(&key) == value.as_ref() {
                    continue;
                }
                let old = match &value {
                    Some(value) => {
                        state.references.retain_present(store_key, &key, value);
                        next.insert(key.clone(), value.clone())
                    }
                    None => {
                        state.references.remove_attribute(store_key, &key);
                        next.remove(&key)
                    }
                };
                announce.attribute(store_key, &key, old, value);
                changed.push(key);
            }
            if changed.is_empty() {
                return Ok(());
            }
            if !mark_dirty {
                let mut committed = state
                    .committed
                    .get(store_key)
                    .map(|c| (**c).clone())
                    .unwrap_or_default();
                for key in &changed {
                    match next.get(key) {
                        Some(value) => committed.insert(key.clone(), value.clone()),
                        None => committed.remove(key),
                    };
                }
                state.committed.insert(store_key.clone(), Rc::new(committed));
            }
            state.hashes.insert(store_key.clone(), Rc::new(next));
            state.touch(store_key);

            let settled = state.settle_dirty(store_key, status)?;
            state.set_status(store_key, settled, &mut announce);
            if let Some(type_name) = state.type_of.get(store_key) {
                announce.type_changed(type_name);
            }
            if mark_dirty {
                announce.has_changes();
            }
            trace!(%store_key, ?changed, mark_dirty, "updated record data");
            announce.revalidate(store_key, changed);
        }
        self.announce(announce);
        Ok(())
    }

    /// Create a record from `data`, filling declared defaults. The record is
    /// `READY|NEW|DIRTY` until committed.
    pub fn create_record(&self, type_name: &str, data: DataHash) -> Result<StoreKey, StoreError> {
        let record_type = self.record_type(type_name)?;
        let mut hash = record_type.default_hash();
        hash.extend(data);
        let id = hash
            .get(RecordType::PRIMARY_KEY)
            .and_then(Value::as_str)
            .map(str::to_string);
        let store_key = self.get_store_key(type_name, id.as_deref());

        let _batch = self.batch();
        let mut announce = Announcements::default();
        {
            let mut state = self.inner.state.borrow_mut();
            let status = state.status(&store_key);
            let vacant = matches!(status.core(), CoreStatus::Empty | CoreStatus::NonExistent)
                || status == Status::DESTROYED;
            if !vacant || status.is(StatusFlags::LOADING) {
                return Err(StoreError::NotPermitted {
                    store_key: store_key.clone(),
                    status,
                    operation: "create",
                });
            }
            let keys: Vec<String> = hash.keys().cloned().collect();
            state.hashes.insert(store_key.clone(), Rc::new(hash));
            state.committed.remove(&store_key);
            state.touch(&store_key);
            state.set_status(&store_key, Status::CREATED, &mut announce);
            announce.type_changed(type_name);
            announce.has_changes();
            announce.revalidate(&store_key, keys);
        }
        debug!(%store_key, type_name, "created record");
        self.announce(announce);
        Ok(store_key)
    }

    /// Mark a record destroyed. A record that was never committed is dropped
    /// immediately; otherwise it becomes `DESTROYED|DIRTY` until committed.
    pub fn destroy_record(&self, store_key: &StoreKey) -> Result<(), StoreError> {
        let _batch = self.batch();
        let mut announce = Announcements::default();
        {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let status = state.status(store_key);
            match status.core() {
                CoreStatus::Destroyed => return Ok(()),
                CoreStatus::Ready => {}
                _ => {
                    return Err(StoreError::NotPermitted {
                        store_key: store_key.clone(),
                        status,
                        operation: "destroy",
                    })
                }
            }
            if status.is(StatusFlags::NEW) && !status.is(StatusFlags::COMMITTING) {
                state.release(store_key);
                state.unbind_id(store_key);
                state.set_status(store_key, Status::DESTROYED, &mut announce);
                announce.data_released(store_key);
            } else {
                let destroyed = status
                    .to_core(CoreStatus::Destroyed, StatusFlags::COMMITTING)?
                    .with(StatusFlags::DIRTY)?;
                if destroyed.is(StatusFlags::COMMITTING) {
                    state.queued_commits.insert(store_key.clone());
                }
                state.set_status(store_key, destroyed, &mut announce);
            }
            if let Some(type_name) = state.type_of.get(store_key) {
                announce.type_changed(type_name);
            }
            announce.has_changes();
        }
        debug!(%store_key, "destroyed record");
        self.announce(announce);
        Ok(())
    }

    /// Drop the data of a clean record to free memory. Records with unsynced
    /// changes or an outstanding fetch are kept and `false` is returned.
    pub fn unload_record(&self, store_key: &StoreKey) -> bool {
        let _batch = self.batch();
        let mut announce = Announcements::default();
        {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let status = state.status(store_key);
            if status.has_unsynced_changes() || status.is(StatusFlags::LOADING) {
                trace!(%store_key, %status, "record cannot be unloaded");
                return false;
            }
            if !state.hashes.contains_key(store_key) {
                return false;
            }
            state.release(store_key);
            if status.is_core(CoreStatus::Ready) {
                state.set_status(store_key, Status::EMPTY, &mut announce);
            }
            announce.data_released(store_key);
            if let Some(type_name) = state.type_of.get(store_key) {
                announce.type_changed(type_name);
            }
        }
        trace!(%store_key, "unloaded record");
        self.announce(announce);
        true
    }

    // ---- records -----------------------------------------------------------

    /// Record handle for a store key. The key is assigned to `type_name` if
    /// it has no type yet.
    pub fn materialise_record(
        &self,
        type_name: &str,
        store_key: &StoreKey,
    ) -> Result<Record, StoreError> {
        let record_type = self.record_type(type_name)?;
        {
            let mut state = self.inner.state.borrow_mut();
            match state.type_of.get(store_key) {
                Some(existing) if existing != type_name => {
                    return Err(StoreError::TypeMismatch {
                        attribute: RecordType::PRIMARY_KEY.to_string(),
                        expected: type_name.to_string(),
                        found: existing.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    state
                        .type_of
                        .insert(store_key.clone(), type_name.to_string());
                }
            }
        }
        self.touch(store_key);
        Ok(Record::attached(self.clone(), store_key.clone(), record_type))
    }

    /// Record for `id`, fetching it from the source if nothing is loaded.
    pub fn get_record(&self, type_name: &str, id: &str) -> Result<Record, StoreError> {
        self.record_type(type_name)?;
        let store_key = self.get_store_key(type_name, Some(id));
        let status = self.status(&store_key);
        if status.is_core(CoreStatus::Empty) && !status.is(StatusFlags::LOADING) {
            self.fetch_record(type_name, id)?;
        }
        self.materialise_record(type_name, &store_key)
    }

    // ---- references --------------------------------------------------------

    /// Note that `attribute` of `store_key` holds the placeholder for `target`.
    pub fn attr_maps_to_store_key(&self, store_key: &StoreKey, attribute: &str, target: &StoreKey) {
        self.inner
            .state
            .borrow_mut()
            .references
            .add(store_key, attribute, target);
    }

    pub fn attr_no_longer_maps_to_store_key(&self, store_key: &StoreKey, attribute: &str) {
        self.inner
            .state
            .borrow_mut()
            .references
            .remove_attribute(store_key, attribute);
    }

    pub(crate) fn reference_targets(&self, store_key: &StoreKey, attribute: &str) -> Vec<StoreKey> {
        self.inner
            .state
            .borrow()
            .references
            .targets(store_key, attribute)
    }

    // ---- validation --------------------------------------------------------

    pub fn error_for_attribute(&self, store_key: &StoreKey, attribute: &str) -> Option<String> {
        self.inner
            .state
            .borrow()
            .errors
            .get(store_key)
            .and_then(|errors| errors.get(attribute))
            .cloned()
    }

    pub fn errors(&self, store_key: &StoreKey) -> BTreeMap<String, String> {
        self.inner
            .state
            .borrow()
            .errors
            .get(store_key)
            .cloned()
            .unwrap_or_default()
    }

    fn revalidate(&self, store_key: &StoreKey, changed: &[String]) {
        let Ok(record_type) = self.record_type_of(store_key) else {
            return;
        };
        if record_type.validators_for(changed).next().is_none() {
            return;
        }
        let record = Record::attached(self.clone(), store_key.clone(), Rc::clone(&record_type));
        let results: Vec<(String, Option<String>)> = record_type
            .validators_for(changed)
            .filter_map(|attribute| {
                let validate = attribute.validate.as_ref()?;
                let value = record.get(&attribute.key);
                Some((attribute.key.clone(), validate(&value, &record)))
            })
            .collect();

        let (old, new) = {
            let mut state = self.inner.state.borrow_mut();
            let errors = state.errors.entry(store_key.clone()).or_default();
            let old = errors.clone();
            for (key, error) in results {
                match error {
                    Some(message) => errors.insert(key, message),
                    None => errors.remove(&key),
                };
            }
            let new = errors.clone();
            if new.is_empty() {
                state.errors.remove(store_key);
            }
            (old, new)
        };
        if old != new {
            self.notify(store_key, ERRORS_KEY, Some(errors_value(&old)), Some(errors_value(&new)));
        }
    }

    // ---- observation -------------------------------------------------------

    /// Per-record notifier, created on first use with the type's computed
    /// properties declared.
    pub(crate) fn notifier_for(&self, store_key: &StoreKey) -> Notifier {
        if let Some(notifier) = self.inner.notifiers.borrow().get(store_key) {
            return notifier.clone();
        }
        let notifier = Notifier::new();
        if let Ok(record_type) = self.record_type_of(store_key) {
            for computed in record_type.computed() {
                notifier.declare_computed(&computed.key, &computed.dependencies, computed.volatile);
            }
        }
        self.inner
            .notifiers
            .borrow_mut()
            .insert(store_key.clone(), notifier.clone());
        notifier
    }

    pub fn observe(&self, store_key: &StoreKey, key: &str, observer: Rc<dyn Observer>) -> ObserverId {
        self.notifier_for(store_key).observe(key, observer)
    }

    pub fn unobserve(&self, store_key: &StoreKey, key: &str, id: ObserverId) -> bool {
        let notifier = self.inner.notifiers.borrow().get(store_key).cloned();
        let removed = notifier.map(|n| n.unobserve(key, id)).unwrap_or(false);
        if removed && !self.inner.state.borrow().hashes.contains_key(store_key) {
            self.prune_notifier(store_key);
        }
        removed
    }

    /// Forget the notifier of a record nobody is watching.
    fn prune_notifier(&self, store_key: &StoreKey) {
        let mut notifiers = self.inner.notifiers.borrow_mut();
        if notifiers.get(store_key).is_some_and(Notifier::is_idle) {
            notifiers.remove(store_key);
            trace!(%store_key, "dropped idle notifier");
        }
    }

    pub(crate) fn notifier_count(&self) -> usize {
        self.inner.notifiers.borrow().len()
    }

    pub(crate) fn notify(&self, store_key: &StoreKey, key: &str, old: Option<Value>, new: Option<Value>) {
        let notifier = self.inner.notifiers.borrow().get(store_key).cloned();
        if let Some(notifier) = notifier {
            notifier.property_did_change(key, old, new);
        }
    }

    pub(crate) fn announce(&self, announce: Announcements) {
        let Announcements {
            changes,
            types,
            revalidate,
            invalidate,
            has_changes,
        } = announce;
        for store_key in invalidate {
            let notifier = self.inner.notifiers.borrow().get(&store_key).cloned();
            if let (Some(notifier), Ok(record_type)) = (notifier, self.record_type_of(&store_key)) {
                for computed in record_type.computed() {
                    notifier.invalidate(&computed.key);
                }
            }
            self.prune_notifier(&store_key);
        }
        for (store_key, key, old, new) in changes {
            self.notify(&store_key, &key, old, new);
        }
        for (store_key, keys) in revalidate {
            self.revalidate(&store_key, &keys);
        }
        for type_name in types {
            self.emit(StoreEvent::RecordsChanged { type_name });
        }
        if has_changes {
            self.emit(StoreEvent::HasChanges);
        }
    }

    // ---- events ------------------------------------------------------------

    pub fn add_listener(&self, listener: Weak<dyn StoreListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.get() + 1);
        self.inner.next_listener.set(id.0);
        self.inner.listeners.borrow_mut().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Register a query so it refreshes whenever records of its type change.
    pub fn add_query(&self, query: &LocalQuery) {
        let id = self.add_listener(query.listener());
        query.set_listener_id(Some(id));
        query.refresh();
    }

    pub fn remove_query(&self, query: &LocalQuery) {
        if let Some(id) = query.set_listener_id(None) {
            self.remove_listener(id);
        }
    }

    pub(crate) fn batch(&self) -> EventBatch<'_> {
        self.inner.event_depth.set(self.inner.event_depth.get() + 1);
        EventBatch { store: self }
    }

    /// Queue an event; delivered when the outermost operation finishes.
    pub(crate) fn emit(&self, event: StoreEvent) {
        {
            let mut pending = self.inner.pending_events.borrow_mut();
            if !pending.contains(&event) {
                pending.push(event);
            }
        }
        if self.inner.event_depth.get() == 0 {
            self.flush_events();
        }
    }

    fn flush_events(&self) {
        loop {
            let events = std::mem::take(&mut *self.inner.pending_events.borrow_mut());
            if events.is_empty() {
                return;
            }
            for event in events {
                self.dispatch(&event);
            }
        }
    }

    /// Deliver immediately, bypassing batching.
    pub(crate) fn dispatch(&self, event: &StoreEvent) {
        let listeners: Vec<Rc<dyn StoreListener>> = {
            let mut listeners = self.inner.listeners.borrow_mut();
            listeners.retain(|(_, weak)| weak.strong_count() > 0);
            listeners
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        trace!(?event, listeners = listeners.len(), "dispatching store event");
        for listener in listeners {
            listener.store_did_emit(self, event);
        }
    }
}

fn errors_value(errors: &BTreeMap<String, String>) -> Value {
    Value::Object(
        errors
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

//! Fetching from and committing to the source, and handling its answers.

use std::collections::BTreeSet;
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, trace, warn};

use super::changes::{ChangeSet, TypeChanges};
use super::events::StoreEvent;
use super::references::substitute;
use super::store::{Announcements, CommitKind, InFlight};
use super::{DataHash, Store, StoreKey};
use crate::error::StoreError;
use crate::query::{QueryRequest, QueryResult};
use crate::record::RecordType;
use crate::source::{CommitCallback, FetchCallback, FetchResult, QueryCallback};
use crate::status::{CoreStatus, Status, StatusFlags};

/// What a fetch callback answers for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FetchTarget {
    Record(StoreKey),
    All(String),
}

impl Store {
    /// Ask the source for a record. Returns `true` if a source took the
    /// request or a fetch is already outstanding.
    pub fn fetch_record(&self, type_name: &str, id: &str) -> Result<bool, StoreError> {
        let record_type = self.record_type(type_name)?;
        let store_key = self.get_store_key(type_name, Some(id));
        self.request_record(&record_type, &store_key, id, false)
    }

    /// Re-fetch a loaded record. Records without an id cannot be refreshed.
    pub fn refresh_record(&self, store_key: &StoreKey) -> Result<bool, StoreError> {
        let record_type = self.record_type_of(store_key)?;
        let Some(id) = self.id_for_store_key(store_key) else {
            return Ok(false);
        };
        self.request_record(&record_type, store_key, &id, true)
    }

    fn request_record(
        &self,
        record_type: &RecordType,
        store_key: &StoreKey,
        id: &str,
        refresh: bool,
    ) -> Result<bool, StoreError> {
        let status = self.status(store_key);
        if status.is(StatusFlags::LOADING) {
            return Ok(true);
        }
        if status.is_core(CoreStatus::Destroyed) || status.is(StatusFlags::NEW) {
            return Ok(false);
        }
        let Some(source) = self.source() else {
            debug!(%store_key, "no source to fetch from");
            return Ok(false);
        };

        let loading = status.with(StatusFlags::LOADING)?;
        self.transition(store_key, loading);
        let callback = FetchCallback::new(self, FetchTarget::Record(store_key.clone()));
        let accepted = if refresh {
            source.refresh_record(record_type, id, callback)
        } else {
            source.fetch_record(record_type, id, callback)
        };
        if !accepted {
            debug!(%store_key, id, "no source accepted fetch");
            if self.status(store_key) == loading {
                self.transition(store_key, status);
            }
        }
        Ok(accepted)
    }

    /// Ask the source for every record of a type, passing the last state
    /// string it reported.
    pub fn fetch_all_records(&self, type_name: &str) -> Result<bool, StoreError> {
        let record_type = self.record_type(type_name)?;
        let Some(source) = self.source() else {
            return Ok(false);
        };
        let state = self.type_state(type_name);
        let callback = FetchCallback::new(self, FetchTarget::All(type_name.to_string()));
        let accepted = source.fetch_all_records(&record_type, state.as_deref(), callback);
        debug!(type_name, ?state, accepted, "fetch all records");
        Ok(accepted)
    }

    pub(crate) fn fetch_query(&self, request: &QueryRequest, callback: QueryCallback) -> bool {
        match self.source() {
            Some(source) => source.fetch_query(request, callback),
            None => false,
        }
    }

    fn transition(&self, store_key: &StoreKey, status: Status) {
        let _batch = self.batch();
        let mut announce = Announcements::default();
        self.inner
            .state
            .borrow_mut()
            .set_status(store_key, status, &mut announce);
        self.announce(announce);
    }

    // ---- fetch answers -----------------------------------------------------

    pub(crate) fn source_did_fetch(&self, target: &FetchTarget, result: FetchResult) {
        let _batch = self.batch();
        match target {
            FetchTarget::Record(store_key) => self.record_did_fetch(store_key, result),
            FetchTarget::All(type_name) => match result {
                FetchResult::Loaded(response) => {
                    let loaded = self.load_records(type_name, response.records);
                    self.set_type_state(type_name, response.state);
                    debug!(type_name, loaded = loaded.len(), "loaded records");
                }
                FetchResult::NotFound => debug!(type_name, "source has no records of type"),
                FetchResult::Failed(message) => {
                    warn!(type_name, %message, "fetching all records failed")
                }
            },
        }
    }

    fn record_did_fetch(&self, store_key: &StoreKey, result: FetchResult) {
        let status = self.status(store_key);
        if !status.is(StatusFlags::LOADING) {
            trace!(%store_key, %status, "ignoring stale fetch result");
            return;
        }
        match result {
            FetchResult::Loaded(response) => {
                let id = self.id_for_store_key(store_key);
                let mut records = response.records;
                let position = records
                    .iter()
                    .position(|r| r.get(RecordType::PRIMARY_KEY).and_then(Value::as_str) == id.as_deref());
                match position {
                    Some(index) => {
                        let hash = records.remove(index);
                        self.load_hash(store_key, hash);
                        if let Some(type_name) = self.type_name_for_store_key(store_key) {
                            self.load_records(&type_name, records);
                            self.set_type_state(&type_name, response.state);
                        }
                    }
                    None => self.record_not_found(store_key),
                }
            }
            FetchResult::NotFound => self.record_not_found(store_key),
            FetchResult::Failed(message) => {
                warn!(%store_key, %message, "fetch failed");
                if let Ok(cleared) = status.without(StatusFlags::LOADING) {
                    self.transition(store_key, cleared);
                }
            }
        }
    }

    fn set_type_state(&self, type_name: &str, state: Option<String>) {
        if let Some(state) = state {
            self.inner
                .state
                .borrow_mut()
                .type_state
                .insert(type_name.to_string(), state);
        }
    }

    /// Load source data for records of a type, keyed by their ids. Records
    /// without an id are skipped.
    pub(crate) fn load_records(&self, type_name: &str, records: Vec<DataHash>) -> Vec<StoreKey> {
        let mut loaded = Vec::with_capacity(records.len());
        for hash in records {
            let Some(id) = hash
                .get(RecordType::PRIMARY_KEY)
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                warn!(type_name, "source returned a record without an id");
                continue;
            };
            let store_key = self.get_store_key(type_name, Some(&id));
            self.load_hash(&store_key, hash);
            loaded.push(store_key);
        }
        loaded
    }

    pub(crate) fn load_query_result(&self, type_name: &str, result: &QueryResult) -> Vec<StoreKey> {
        let _batch = self.batch();
        self.load_records(type_name, result.records.clone());
        self.set_type_state(type_name, result.state.clone());
        result
            .ids
            .iter()
            .map(|id| self.get_store_key(type_name, Some(id)))
            .collect()
    }

    /// Replace a record's data with what the source sent. Records with local
    /// changes keep them and are marked obsolete instead.
    fn load_hash(&self, store_key: &StoreKey, hash: DataHash) {
        let _batch = self.batch();
        let mut announce = Announcements::default();
        {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let status = state.status(store_key);
            if status.is_core(CoreStatus::Destroyed) {
                trace!(%store_key, "ignoring data for destroyed record");
                return;
            }
            if status.has_unsynced_changes() {
                let obsolete = status
                    .without(StatusFlags::LOADING)
                    .and_then(|s| s.with(StatusFlags::OBSOLETE))
                    .or_else(|_| status.without(StatusFlags::LOADING));
                if let Ok(obsolete) = obsolete {
                    state.set_status(store_key, obsolete, &mut announce);
                }
                debug!(%store_key, "source data arrived for record with local changes");
            } else {
                let hash = Rc::new(hash);
                let previous = state.hashes.insert(store_key.clone(), Rc::clone(&hash));
                state.committed.insert(store_key.clone(), Rc::clone(&hash));
                state.touch(store_key);
                let before = previous.map(|p| (*p).clone()).unwrap_or_default();
                announce.diff(store_key, &before, &hash);
                let changed: Vec<String> = hash
                    .keys()
                    .chain(before.keys())
                    .filter(|k| hash.get(*k) != before.get(*k))
                    .cloned()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                announce.revalidate(store_key, changed);
                state.set_status(store_key, Status::READY, &mut announce);
            }
            if let Some(type_name) = state.type_of.get(store_key) {
                announce.type_changed(type_name);
            }
        }
        self.announce(announce);
    }

    fn record_not_found(&self, store_key: &StoreKey) {
        let mut announce = Announcements::default();
        {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let status = state.status(store_key);
            match status.core() {
                CoreStatus::Empty | CoreStatus::NonExistent => {
                    state.set_status(store_key, Status::NON_EXISTENT, &mut announce);
                }
                CoreStatus::Ready if status.has_unsynced_changes() => {
                    if let Ok(cleared) = status.without(StatusFlags::LOADING) {
                        state.set_status(store_key, cleared, &mut announce);
                    }
                    warn!(%store_key, "record with local changes no longer exists at source");
                }
                CoreStatus::Ready => {
                    state.release(store_key);
                    state.unbind_id(store_key);
                    state.set_status(store_key, Status::DESTROYED, &mut announce);
                    announce.data_released(store_key);
                    if let Some(type_name) = state.type_of.get(store_key) {
                        announce.type_changed(type_name);
                    }
                }
                CoreStatus::Destroyed => {}
            }
        }
        self.announce(announce);
    }

    // ---- commit ------------------------------------------------------------

    /// Send every dirty record to the source.
    ///
    /// Fires [`StoreEvent::WillCommit`] first. Records already committing
    /// are left dirty and committed again once their outstanding commit is
    /// answered. Returns `false` if there was nothing to send.
    pub fn commit_changes(&self) -> Result<bool, StoreError> {
        let Some(source) = self.source() else {
            debug!("no source to commit to");
            return Ok(false);
        };
        self.dispatch(&StoreEvent::WillCommit);

        let _batch = self.batch();
        let mut announce = Announcements::default();
        let mut changes = ChangeSet::new();
        let sequence;
        {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            state.commit_sequence += 1;
            sequence = state.commit_sequence;
            let mut dirty: Vec<StoreKey> = state
                .status
                .iter()
                .filter(|(_, status)| status.is(StatusFlags::DIRTY))
                .map(|(store_key, _)| store_key.clone())
                .collect();
            dirty.sort();

            for store_key in dirty {
                let status = state.status(&store_key);
                if status.is(StatusFlags::COMMITTING) {
                    state.queued_commits.insert(store_key);
                    continue;
                }
                let Some(type_name) = state.type_of.get(&store_key).cloned() else {
                    continue;
                };
                let record_type = self.record_type(&type_name)?;
                let committing = status
                    .without(StatusFlags::DIRTY)?
                    .with(StatusFlags::COMMITTING)?;

                match status.core() {
                    CoreStatus::Ready if status.is(StatusFlags::NEW) => {
                        let Some(hash) = state.hashes.get(&store_key).cloned() else {
                            continue;
                        };
                        let bucket = changes.entry(&type_name);
                        bucket.create.store_keys.push(store_key.clone());
                        bucket.create.records.push(record_type.synced_payload(&hash));
                        state.committed.insert(store_key.clone(), hash);
                        state.in_flight.insert(
                            store_key.clone(),
                            InFlight {
                                kind: CommitKind::Create,
                                sequence,
                                rollback: None,
                            },
                        );
                        state.set_status(&store_key, committing, &mut announce);
                    }
                    CoreStatus::Ready => {
                        let Some(hash) = state.hashes.get(&store_key).cloned() else {
                            continue;
                        };
                        let changed: BTreeSet<String> = state
                            .changed_attributes(&store_key)
                            .into_iter()
                            .filter(|key| record_type.is_synced(key))
                            .collect();
                        let rollback = state.committed.insert(store_key.clone(), Rc::clone(&hash));
                        if changed.is_empty() {
                            let clean = status.without(StatusFlags::DIRTY)?;
                            state.set_status(&store_key, clean, &mut announce);
                            continue;
                        }
                        let bucket = changes.entry(&type_name);
                        bucket.update.store_keys.push(store_key.clone());
                        bucket.update.records.push(record_type.synced_payload(&hash));
                        bucket.update.changes.push(changed);
                        state.in_flight.insert(
                            store_key.clone(),
                            InFlight {
                                kind: CommitKind::Update,
                                sequence,
                                rollback,
                            },
                        );
                        state.set_status(&store_key, committing, &mut announce);
                    }
                    CoreStatus::Destroyed => {
                        let Some(id) = state.id_of.get(&store_key).cloned() else {
                            state.release(&store_key);
                            state.set_status(&store_key, Status::DESTROYED, &mut announce);
                            continue;
                        };
                        let bucket = changes.entry(&type_name);
                        bucket.destroy.store_keys.push(store_key.clone());
                        bucket.destroy.ids.push(id);
                        state.in_flight.insert(
                            store_key.clone(),
                            InFlight {
                                kind: CommitKind::Destroy,
                                sequence,
                                rollback: None,
                            },
                        );
                        state.set_status(&store_key, committing, &mut announce);
                    }
                    _ => {}
                }
            }
            for type_name in changes.type_names() {
                changes.entry(&type_name).state = state.type_state.get(&type_name).cloned();
            }
        }
        self.announce(announce);

        if changes.is_empty() {
            return Ok(false);
        }
        debug!(types = ?changes.type_names(), sequence, "committing changes");
        source.commit_changes(&mut changes, CommitCallback::new(self, sequence));
        if !changes.is_empty() {
            warn!(types = ?changes.type_names(), "no source handled changes");
            for (_, bucket) in changes.drain() {
                self.revert_unhandled(sequence, bucket);
            }
        }
        Ok(true)
    }

    fn revert_unhandled(&self, sequence: u64, bucket: TypeChanges) {
        self.source_did_not_create(sequence, &bucket.create.store_keys, false);
        self.source_did_not_update(sequence, &bucket.update.store_keys, false);
        self.source_did_not_destroy(sequence, &bucket.destroy.store_keys, false);
    }

    /// Remove the in-flight entry for `store_key` if it is of `kind` and was
    /// sent by dispatch `sequence`.
    fn settle_in_flight(
        &self,
        sequence: u64,
        store_key: &StoreKey,
        kind: CommitKind,
    ) -> Option<InFlight> {
        let mut state = self.inner.state.borrow_mut();
        match state.in_flight.get(store_key) {
            Some(in_flight) if in_flight.kind == kind && in_flight.sequence == sequence => {
                state.in_flight.remove(store_key)
            }
            _ => {
                trace!(%store_key, ?kind, sequence, "ignoring answer for commit not in flight");
                None
            }
        }
    }

    pub(crate) fn source_did_commit_create(&self, sequence: u64, created: &[(StoreKey, String)]) {
        let _batch = self.batch();
        let mut announce = Announcements::default();
        for (store_key, id) in created {
            if self.settle_in_flight(sequence, store_key, CommitKind::Create).is_none() {
                continue;
            }
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let type_name = state.type_of.get(store_key).cloned().unwrap_or_default();
            state.bind_id(store_key, &type_name, id);

            let id_value = Value::String(id.clone());
            if let Some(hash) = state.hashes.get(store_key).cloned() {
                if hash.get(RecordType::PRIMARY_KEY) != Some(&id_value) {
                    let mut next = (*hash).clone();
                    let old = next.insert(RecordType::PRIMARY_KEY.to_string(), id_value.clone());
                    state.hashes.insert(store_key.clone(), Rc::new(next));
                    announce.attribute(store_key, RecordType::PRIMARY_KEY, old, Some(id_value.clone()));
                }
            }
            if let Some(committed) = state.committed.get(store_key).cloned() {
                let mut next = (*committed).clone();
                next.insert(RecordType::PRIMARY_KEY.to_string(), id_value.clone());
                state.committed.insert(store_key.clone(), Rc::new(next));
            }

            let status = state.status(store_key);
            match status
                .without(StatusFlags::NEW | StatusFlags::COMMITTING)
                .and_then(|s| state.settle_dirty(store_key, s))
            {
                Ok(next) => state.set_status(store_key, next, &mut announce),
                Err(err) => warn!(%store_key, %err, "unexpected status after create"),
            }
            announce.type_changed(&type_name);

            for (dependent, attribute) in state.references.take_dependents(store_key) {
                if let Some(hash) = state.hashes.get(&dependent).cloned() {
                    if let Some(value) = hash.get(&attribute) {
                        let patched = substitute(value, store_key, id);
                        if &patched != value {
                            let mut next = (*hash).clone();
                            next.insert(attribute.clone(), patched.clone());
                            state.hashes.insert(dependent.clone(), Rc::new(next));
                            announce.attribute(&dependent, &attribute, Some(value.clone()), Some(patched));
                        }
                    }
                }
                if let Some(committed) = state.committed.get(&dependent).cloned() {
                    if let Some(value) = committed.get(&attribute) {
                        let patched = substitute(value, store_key, id);
                        if &patched != value {
                            let mut next = (*committed).clone();
                            next.insert(attribute.clone(), patched);
                            state.committed.insert(dependent.clone(), Rc::new(next));
                        }
                    }
                }
                if let Some(dependent_type) = state.type_of.get(&dependent) {
                    announce.type_changed(dependent_type);
                }
            }
            debug!(%store_key, id = %id, "create committed");
        }
        self.announce(announce);
        self.recommit_queued();
    }

    pub(crate) fn source_did_not_create(
        &self,
        sequence: u64,
        store_keys: &[StoreKey],
        permanent: bool,
    ) {
        let _batch = self.batch();
        let mut announce = Announcements::default();
        for store_key in store_keys {
            if self.settle_in_flight(sequence, store_key, CommitKind::Create).is_none() {
                continue;
            }
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let status = state.status(store_key);
            if permanent || status.is_core(CoreStatus::Destroyed) {
                state.release(store_key);
                state.unbind_id(store_key);
                state.set_status(store_key, Status::DESTROYED, &mut announce);
                announce.data_released(store_key);
            } else {
                state.committed.remove(store_key);
                state.set_status(store_key, Status::CREATED, &mut announce);
            }
            if let Some(type_name) = state.type_of.get(store_key) {
                announce.type_changed(type_name);
            }
            debug!(%store_key, permanent, "create rejected");
        }
        self.announce(announce);
        self.recommit_queued();
    }

    pub(crate) fn source_did_commit_update(&self, sequence: u64, store_keys: &[StoreKey]) {
        let _batch = self.batch();
        let mut announce = Announcements::default();
        for store_key in store_keys {
            if self.settle_in_flight(sequence, store_key, CommitKind::Update).is_none() {
                continue;
            }
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let status = state.status(store_key);
            match status
                .without(StatusFlags::COMMITTING)
                .and_then(|s| state.settle_dirty(store_key, s))
            {
                Ok(next) => state.set_status(store_key, next, &mut announce),
                Err(err) => warn!(%store_key, %err, "unexpected status after update"),
            }
        }
        self.announce(announce);
        self.recommit_queued();
    }

    /// Roll the committed baseline back; the local data stays and the record
    /// is dirty again. `obsolete` additionally flags that the source holds
    /// newer data.
    pub(crate) fn source_did_not_update(
        &self,
        sequence: u64,
        store_keys: &[StoreKey],
        obsolete: bool,
    ) {
        let _batch = self.batch();
        let mut announce = Announcements::default();
        for store_key in store_keys {
            let settled = self.settle_in_flight(sequence, store_key, CommitKind::Update);
            let Some(in_flight) = settled else {
                continue;
            };
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            match in_flight.rollback {
                Some(rollback) => state.committed.insert(store_key.clone(), rollback),
                None => state.committed.remove(store_key),
            };
            let status = state.status(store_key);
            let next = status
                .without(StatusFlags::COMMITTING)
                .and_then(|s| state.settle_dirty(store_key, s))
                .and_then(|s| {
                    if obsolete && s.is_core(CoreStatus::Ready) {
                        s.with(StatusFlags::OBSOLETE)
                    } else {
                        Ok(s)
                    }
                });
            match next {
                Ok(next) => state.set_status(store_key, next, &mut announce),
                Err(err) => warn!(%store_key, %err, "unexpected status after rejected update"),
            }
            debug!(%store_key, obsolete, "update rejected");
        }
        self.announce(announce);
        self.recommit_queued();
    }

    pub(crate) fn source_did_commit_destroy(&self, sequence: u64, store_keys: &[StoreKey]) {
        let _batch = self.batch();
        let mut announce = Announcements::default();
        for store_key in store_keys {
            if self.settle_in_flight(sequence, store_key, CommitKind::Destroy).is_none() {
                continue;
            }
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            state.release(store_key);
            state.unbind_id(store_key);
            state.set_status(store_key, Status::DESTROYED, &mut announce);
            announce.data_released(store_key);
            if let Some(type_name) = state.type_of.get(store_key) {
                announce.type_changed(type_name);
            }
            debug!(%store_key, "destroy committed");
        }
        self.announce(announce);
        self.recommit_queued();
    }

    pub(crate) fn source_did_not_destroy(
        &self,
        sequence: u64,
        store_keys: &[StoreKey],
        permanent: bool,
    ) {
        let _batch = self.batch();
        let mut announce = Announcements::default();
        for store_key in store_keys {
            if self.settle_in_flight(sequence, store_key, CommitKind::Destroy).is_none() {
                continue;
            }
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let status = state.status(store_key);
            let next = if permanent {
                status
                    .to_core(CoreStatus::Ready, StatusFlags::NONE)
                    .and_then(|s| state.settle_dirty(store_key, s))
            } else {
                Status::DESTROYED.with(StatusFlags::DIRTY)
            };
            match next {
                Ok(next) => state.set_status(store_key, next, &mut announce),
                Err(err) => warn!(%store_key, %err, "unexpected status after rejected destroy"),
            }
            if let Some(type_name) = state.type_of.get(store_key) {
                announce.type_changed(type_name);
            }
            debug!(%store_key, permanent, "destroy rejected");
        }
        self.announce(announce);
        self.recommit_queued();
    }

    /// Commit records that changed while an earlier commit was in flight,
    /// once none of them is still committing.
    fn recommit_queued(&self) {
        let ready = {
            let state = self.inner.state.borrow();
            !state.queued_commits.is_empty()
                && state
                    .queued_commits
                    .iter()
                    .all(|store_key| !state.status(store_key).is(StatusFlags::COMMITTING))
        };
        if !ready {
            return;
        }
        self.inner.state.borrow_mut().queued_commits.clear();
        trace!("committing queued changes");
        if let Err(err) = self.commit_changes() {
            warn!(%err, "queued commit failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AttributeDef, ValueType};
    use crate::source::{FetchResponse, Source};
    use serde_json::json;
    use std::cell::RefCell;

    /// Source that records requests and lets the test answer them.
    #[derive(Default)]
    struct ManualSource {
        fetches: RefCell<Vec<(String, FetchCallback)>>,
        commits: RefCell<Vec<(ChangeSet, CommitCallback)>>,
    }

    impl Source for ManualSource {
        fn fetch_record(&self, _t: &RecordType, id: &str, callback: FetchCallback) -> bool {
            self.fetches.borrow_mut().push((id.to_string(), callback));
            true
        }

        fn fetch_all_records(&self, _t: &RecordType, _s: Option<&str>, _c: FetchCallback) -> bool {
            false
        }

        fn fetch_query(&self, _r: &QueryRequest, _c: QueryCallback) -> bool {
            false
        }

        fn commit_changes(&self, changes: &mut ChangeSet, callback: CommitCallback) {
            let mut taken = ChangeSet::new();
            for (type_name, bucket) in changes.drain() {
                *taken.entry(&type_name) = bucket;
            }
            self.commits.borrow_mut().push((taken, callback));
        }
    }

    fn setup() -> (Store, Rc<ManualSource>) {
        let source = Rc::new(ManualSource::default());
        let store = Store::with_source(source.clone());
        store.register_type(
            RecordType::new("Todo")
                .with_attribute(AttributeDef::attr("title", ValueType::String))
                .with_attribute(AttributeDef::attr("expanded", ValueType::Boolean).no_sync()),
        );
        (store, source)
    }

    fn hash(value: Value) -> DataHash {
        match value {
            Value::Object(map) => map,
            _ => DataHash::new(),
        }
    }

    #[test]
    fn fetch_marks_loading_and_resolves_once() {
        let (store, source) = setup();
        assert!(store.fetch_record("Todo", "t1").unwrap());
        assert!(store.fetch_record("Todo", "t1").unwrap());
        assert_eq!(source.fetches.borrow().len(), 1);

        let sk = store.get_store_key("Todo", Some("t1"));
        assert!(store.status(&sk).is(StatusFlags::LOADING));

        let callback = source.fetches.borrow()[0].1.clone();
        let response = FetchResponse {
            records: vec![hash(json!({"id": "t1", "title": "milk"}))],
            state: Some("v1".into()),
        };
        assert!(callback.resolve(FetchResult::Loaded(response.clone())));
        assert!(!callback.resolve(FetchResult::Loaded(response)));
        assert_eq!(store.status(&sk), Status::READY);
        assert_eq!(store.type_state("Todo").as_deref(), Some("v1"));
    }

    #[test]
    fn not_found_marks_non_existent() {
        let (store, source) = setup();
        store.fetch_record("Todo", "missing").unwrap();
        let callback = source.fetches.borrow()[0].1.clone();
        callback.resolve(FetchResult::NotFound);
        let sk = store.get_store_key("Todo", Some("missing"));
        assert_eq!(store.status(&sk), Status::NON_EXISTENT);
    }

    #[test]
    fn commit_excludes_no_sync_attributes() {
        let (store, source) = setup();
        let sk = store
            .create_record("Todo", hash(json!({"title": "milk", "expanded": true})))
            .unwrap();
        assert!(store.commit_changes().unwrap());

        let commits = source.commits.borrow();
        let bucket = commits[0].0.get("Todo").unwrap();
        assert_eq!(bucket.create.store_keys, vec![sk.clone()]);
        assert!(!bucket.create.records[0].contains_key("expanded"));
        assert!(store.status(&sk).is(StatusFlags::COMMITTING));
    }

    #[test]
    fn edits_during_commit_are_recommitted() {
        let (store, source) = setup();
        let sk = store
            .create_record("Todo", hash(json!({"title": "milk"})))
            .unwrap();
        store.commit_changes().unwrap();
        store
            .update_hash(&sk, hash(json!({"title": "eggs"})), true)
            .unwrap();
        assert!(!store.commit_changes().unwrap());
        assert_eq!(source.commits.borrow().len(), 1);

        let callback = source.commits.borrow()[0].1.clone();
        callback.did_commit_create(&[(sk.clone(), "t1".into())]);

        let commits = source.commits.borrow();
        assert_eq!(commits.len(), 2);
        let update = &commits[1].0.get("Todo").unwrap().update;
        assert_eq!(update.store_keys, vec![sk.clone()]);
        assert!(update.changes[0].contains("title"));
        assert_eq!(update.records[0]["id"], json!("t1"));
    }

    #[test]
    fn late_answer_from_an_earlier_commit_is_ignored() {
        let (store, source) = setup();
        let sk = store
            .create_record("Todo", hash(json!({"title": "a"})))
            .unwrap();
        store.commit_changes().unwrap();
        source.commits.borrow()[0]
            .1
            .did_commit_create(&[(sk.clone(), "t1".into())]);

        store
            .update_hash(&sk, hash(json!({"title": "b"})), true)
            .unwrap();
        store.commit_changes().unwrap();
        let first = source.commits.borrow()[1].1.clone();
        first.did_commit_update(&[sk.clone()]);
        assert_eq!(store.status(&sk), Status::READY);

        store
            .update_hash(&sk, hash(json!({"title": "c"})), true)
            .unwrap();
        store.commit_changes().unwrap();
        let second = source.commits.borrow()[2].1.clone();

        first.did_commit_update(&[sk.clone()]);
        assert!(store.status(&sk).is(StatusFlags::COMMITTING));

        second.did_not_update(&[sk.clone()]);
        let status = store.status(&sk);
        assert!(status.is(StatusFlags::DIRTY));
        assert!(!status.is(StatusFlags::COMMITTING));
        assert_eq!(store.get_hash(&sk).unwrap()["title"], json!("c"));
        assert_eq!(store.committed_hash(&sk).unwrap()["title"], json!("b"));
    }

    #[test]
    fn rejected_update_stays_dirty() {
        let (store, source) = setup();
        let sk = store
            .create_record("Todo", hash(json!({"title": "milk"})))
            .unwrap();
        store.commit_changes().unwrap();
        source.commits.borrow()[0]
            .1
            .did_commit_create(&[(sk.clone(), "t1".into())]);

        store
            .update_hash(&sk, hash(json!({"title": "eggs"})), true)
            .unwrap();
        store.commit_changes().unwrap();
        source.commits.borrow()[1].1.did_not_update(&[sk.clone()]);

        let status = store.status(&sk);
        assert!(status.is(StatusFlags::DIRTY));
        assert!(!status.is(StatusFlags::COMMITTING));
        assert_eq!(store.get_hash(&sk).unwrap()["title"], json!("eggs"));
        assert_eq!(store.committed_hash(&sk).unwrap()["title"], json!("milk"));
    }

    #[test]
    fn commit_resolution_after_store_drop_is_noop() {
        let (store, source) = setup();
        let sk = store
            .create_record("Todo", hash(json!({"title": "milk"})))
            .unwrap();
        store.commit_changes().unwrap();
        drop(store);
        source.commits.borrow()[0]
            .1
            .did_commit_create(&[(sk, "t1".into())]);
    }
}

//! Handles a source uses to answer the store.
//!
//! Callbacks hold the store weakly: answering after the store is gone is a
//! no-op. Fetch and query callbacks resolve at most once; clones share the
//! same fired flag.

use std::cell::Cell;
use std::rc::{Rc, Weak};

use tracing::{trace, warn};

use super::FetchResult;
use crate::query::{QueryResult, RemoteQueryInner};
use crate::store::{FetchTarget, Store, StoreInner, StoreKey};

#[derive(Clone)]
pub struct FetchCallback {
    store: Weak<StoreInner>,
    target: FetchTarget,
    fired: Rc<Cell<bool>>,
}

impl std::fmt::Debug for FetchCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCallback")
            .field("target", &self.target)
            .field("fired", &self.fired.get())
            .finish()
    }
}

impl FetchCallback {
    pub(crate) fn new(store: &Store, target: FetchTarget) -> Self {
        FetchCallback {
            store: store.downgrade(),
            target,
            fired: Rc::new(Cell::new(false)),
        }
    }

    /// Deliver the answer. Returns `false` if the callback already fired or
    /// the store has been dropped.
    pub fn resolve(&self, result: FetchResult) -> bool {
        if self.fired.replace(true) {
            warn!(request = ?self.target, "fetch callback invoked more than once");
            return false;
        }
        let Some(store) = Store::upgrade(&self.store) else {
            trace!(request = ?self.target, "store dropped before fetch resolved");
            return false;
        };
        store.source_did_fetch(&self.target, result);
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.fired.get()
    }
}

/// Per-record outcome reporting for one commit dispatch. Each store key is
/// settled by the first report about it. Later reports, and reports about
/// records that have since been committed again, are ignored.
#[derive(Clone)]
pub struct CommitCallback {
    store: Weak<StoreInner>,
    sequence: u64,
}

impl std::fmt::Debug for CommitCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitCallback")
            .field("sequence", &self.sequence)
            .field("store_alive", &(self.store.strong_count() > 0))
            .finish()
    }
}

impl CommitCallback {
    pub(crate) fn new(store: &Store, sequence: u64) -> Self {
        CommitCallback {
            store: store.downgrade(),
            sequence,
        }
    }

    fn store(&self) -> Option<Store> {
        Store::upgrade(&self.store)
    }

    /// Creates were accepted; each store key is paired with its new id.
    pub fn did_commit_create(&self, created: &[(StoreKey, String)]) {
        if let Some(store) = self.store() {
            store.source_did_commit_create(self.sequence, created);
        }
    }

    /// Creates were rejected. A permanent rejection discards the records;
    /// otherwise they return to `READY|NEW|DIRTY`.
    pub fn did_not_create(&self, store_keys: &[StoreKey], permanent: bool) {
        if let Some(store) = self.store() {
            store.source_did_not_create(self.sequence, store_keys, permanent);
        }
    }

    pub fn did_commit_update(&self, store_keys: &[StoreKey]) {
        if let Some(store) = self.store() {
            store.source_did_commit_update(self.sequence, store_keys);
        }
    }

    /// Updates were rejected; the records stay dirty with their local data.
    pub fn did_not_update(&self, store_keys: &[StoreKey]) {
        if let Some(store) = self.store() {
            store.source_did_not_update(self.sequence, store_keys, false);
        }
    }

    /// Updates were rejected because the source holds newer data.
    pub fn record_is_obsolete(&self, store_keys: &[StoreKey]) {
        if let Some(store) = self.store() {
            store.source_did_not_update(self.sequence, store_keys, true);
        }
    }

    pub fn did_commit_destroy(&self, store_keys: &[StoreKey]) {
        if let Some(store) = self.store() {
            store.source_did_commit_destroy(self.sequence, store_keys);
        }
    }

    /// Destroys were rejected. A permanent rejection restores the records;
    /// otherwise they stay `DESTROYED|DIRTY` for the next commit.
    pub fn did_not_destroy(&self, store_keys: &[StoreKey], permanent: bool) {
        if let Some(store) = self.store() {
            store.source_did_not_destroy(self.sequence, store_keys, permanent);
        }
    }
}

#[derive(Clone)]
pub struct QueryCallback {
    store: Weak<StoreInner>,
    type_name: String,
    query: Weak<RemoteQueryInner>,
    fired: Rc<Cell<bool>>,
}

impl std::fmt::Debug for QueryCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCallback")
            .field("type_name", &self.type_name)
            .field("fired", &self.fired.get())
            .finish()
    }
}

impl QueryCallback {
    pub(crate) fn new(store: &Store, type_name: &str, query: Weak<RemoteQueryInner>) -> Self {
        QueryCallback {
            store: store.downgrade(),
            type_name: type_name.to_string(),
            query,
            fired: Rc::new(Cell::new(false)),
        }
    }

    /// Deliver one window of results. Records in the result are loaded into
    /// the store even if the query has since been destroyed.
    pub fn resolve(&self, result: QueryResult) -> bool {
        if self.fired.replace(true) {
            warn!("query callback invoked more than once");
            return false;
        }
        let Some(store) = Store::upgrade(&self.store) else {
            return false;
        };
        let store_keys = store.load_query_result(&self.type_name, &result);
        match self.query.upgrade() {
            Some(query) => {
                query.did_fetch(&result, store_keys);
                true
            }
            None => {
                trace!("query dropped before results arrived");
                false
            }
        }
    }

    pub fn fail(&self, message: &str) -> bool {
        if self.fired.replace(true) {
            return false;
        }
        warn!(%message, "query fetch failed");
        match self.query.upgrade() {
            Some(query) => {
                query.did_fail();
                true
            }
            None => false,
        }
    }
}

use super::Store;

/// Store-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Fired synchronously at the start of `commit_changes`, before any
    /// record is marked as committing.
    WillCommit,
    /// A local change (create, update, destroy) was made.
    HasChanges,
    /// The set of loaded records of a type, or their data, changed.
    RecordsChanged { type_name: String },
}

/// Receiver of [`StoreEvent`]s. Stores hold listeners weakly.
pub trait StoreListener {
    fn store_did_emit(&self, store: &Store, event: &StoreEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

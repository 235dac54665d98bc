//! The record store: the single in-memory authority for record data.
//!
//! Records are addressed by [`StoreKey`]. For every key the store tracks the
//! current data hash, the last committed hash, a [`Status`](crate::Status),
//! the type name and, once known, the primary key. Sources are reached only
//! through the [`Source`](crate::Source) trait and answer through callbacks
//! that re-enter the store.

mod changes;
mod events;
mod inverse;
mod references;
mod store;
mod store_key;
mod sync;

pub use changes::{ChangeSet, CreateBatch, DestroyBatch, InverseChanges, TypeChanges, UpdateBatch};
pub use events::{ListenerId, StoreEvent, StoreListener};
pub use store::Store;
pub use store_key::StoreKey;

pub(crate) use store::StoreInner;
pub(crate) use sync::FetchTarget;

/// Attribute values of one record, keyed by attribute name.
pub type DataHash = serde_json::Map<String, serde_json::Value>;

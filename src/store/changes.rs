//! Change sets exchanged with sources and the undo manager.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::store::AttributeEdit;
use super::{DataHash, StoreKey};

/// Records created locally, as parallel arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CreateBatch {
    pub store_keys: Vec<StoreKey>,
    pub records: Vec<DataHash>,
}

/// Records updated locally, as parallel arrays. `changes[i]` names the
/// attributes of `records[i]` that differ from the last committed state; a
/// named attribute missing from `records[i]` was removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateBatch {
    pub store_keys: Vec<StoreKey>,
    pub records: Vec<DataHash>,
    pub changes: Vec<BTreeSet<String>>,
}

/// Records destroyed locally, as parallel arrays of store keys and ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DestroyBatch {
    pub store_keys: Vec<StoreKey>,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TypeChanges {
    pub create: CreateBatch,
    pub update: UpdateBatch,
    pub destroy: DestroyBatch,
    /// Last state string the source reported for this type, if any.
    pub state: Option<String>,
}

impl TypeChanges {
    pub fn is_empty(&self) -> bool {
        self.create.store_keys.is_empty()
            && self.update.store_keys.is_empty()
            && self.destroy.store_keys.is_empty()
    }

    pub fn store_keys(&self) -> impl Iterator<Item = &StoreKey> {
        self.create
            .store_keys
            .iter()
            .chain(self.update.store_keys.iter())
            .chain(self.destroy.store_keys.iter())
    }
}

/// A commit payload grouped by type name.
///
/// A source takes the entries it handles with [`ChangeSet::take`] and leaves
/// the others in place for the next source.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ChangeSet {
    types: BTreeMap<String, TypeChanges>,
}

impl ChangeSet {
    pub fn new() -> Self {
        ChangeSet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn type_names(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    pub fn get(&self, type_name: &str) -> Option<&TypeChanges> {
        self.types.get(type_name)
    }

    pub fn take(&mut self, type_name: &str) -> Option<TypeChanges> {
        self.types.remove(type_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TypeChanges)> {
        self.types.iter()
    }

    pub(crate) fn entry(&mut self, type_name: &str) -> &mut TypeChanges {
        self.types.entry(type_name.to_string()).or_default()
    }

    pub(crate) fn drain(&mut self) -> Vec<(String, TypeChanges)> {
        std::mem::take(&mut self.types).into_iter().collect()
    }
}

/// The structural inverse of a store's pending changes; an undo entry.
///
/// Opaque outside the crate: produced by `Store::get_inverse_changes` and
/// consumed by `Store::apply_changes`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InverseChanges {
    pub(crate) create: Vec<(StoreKey, String, DataHash)>,
    /// Attribute values to restore; `None` for attributes the record did
    /// not have.
    pub(crate) update: Vec<(StoreKey, Vec<AttributeEdit>)>,
    pub(crate) destroy: Vec<StoreKey>,
}

impl InverseChanges {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.destroy.is_empty()
    }

    /// Number of records the entry touches.
    pub fn len(&self) -> usize {
        self.create.len() + self.update.len() + self.destroy.len()
    }
}

use tracing::debug;

use super::changes::InverseChanges;
use super::store::{Announcements, AttributeEdit};
use super::{DataHash, Store, StoreKey};
use crate::error::StoreError;
use crate::record::RecordType;
use crate::status::{CoreStatus, StatusFlags};

impl Store {
    /// Changes that would undo every pending local change: destroy what was
    /// created, restore committed values of what was updated and re-create
    /// what was destroyed.
    pub fn get_inverse_changes(&self) -> InverseChanges {
        let state = self.inner.state.borrow();
        let mut keys: Vec<&StoreKey> = state.status.keys().collect();
        keys.sort();

        let mut inverse = InverseChanges::default();
        for store_key in keys {
            let status = state.status(store_key);
            match status.core() {
                CoreStatus::Ready
                    if status.is(StatusFlags::NEW) && !status.is(StatusFlags::COMMITTING) =>
                {
                    inverse.destroy.push(store_key.clone());
                }
                CoreStatus::Ready if status.is(StatusFlags::DIRTY) => {
                    let committed = state.committed.get(store_key);
                    let edits: Vec<AttributeEdit> = state
                        .changed_attributes(store_key)
                        .into_iter()
                        .map(|key| {
                            let value = committed.and_then(|c| c.get(&key).cloned());
                            (key, value)
                        })
                        .collect();
                    if !edits.is_empty() {
                        inverse.update.push((store_key.clone(), edits));
                    }
                }
                CoreStatus::Destroyed
                    if status.is(StatusFlags::DIRTY) && !status.is(StatusFlags::COMMITTING) =>
                {
                    let hash = state
                        .committed
                        .get(store_key)
                        .or_else(|| state.hashes.get(store_key))
                        .map(|h| (**h).clone())
                        .unwrap_or_default();
                    let type_name = state.type_of.get(store_key).cloned().unwrap_or_default();
                    inverse.create.push((store_key.clone(), type_name, hash));
                }
                _ => {}
            }
        }
        inverse
    }

    /// Apply an undo entry as ordinary local changes. Store keys are
    /// resolved through earlier re-creations, and records that must be
    /// re-created after their destroy was committed get fresh store keys.
    pub fn apply_changes(&self, changes: &InverseChanges) -> Result<(), StoreError> {
        let _batch = self.batch();

        for store_key in &changes.destroy {
            let store_key = self.resolve_store_key(store_key);
            if self.status(&store_key).is_core(CoreStatus::Ready) {
                self.destroy_record(&store_key)?;
            }
        }

        for (store_key, edits) in &changes.update {
            let store_key = self.resolve_store_key(store_key);
            if self.status(&store_key).is_core(CoreStatus::Ready) {
                self.edit_hash(&store_key, edits.clone(), true)?;
            }
        }

        for (store_key, type_name, hash) in &changes.create {
            let store_key = self.resolve_store_key(store_key);
            let status = self.status(&store_key);
            let pending_destroy = status.is_core(CoreStatus::Destroyed)
                && status.is(StatusFlags::DIRTY)
                && !status.is(StatusFlags::COMMITTING)
                && self.get_hash(&store_key).is_some();
            if pending_destroy {
                self.undestroy(&store_key, hash)?;
                continue;
            }
            if status.is_core(CoreStatus::Ready) {
                continue;
            }
            let mut data = hash.clone();
            data.remove(RecordType::PRIMARY_KEY);
            let recreated = self.create_record(type_name, data)?;
            debug!(%store_key, %recreated, "re-created record under a new store key");
            self.inner
                .state
                .borrow_mut()
                .remapped
                .insert(store_key, recreated);
        }
        Ok(())
    }

    /// Revert every uncommitted local change.
    pub fn discard_changes(&self) -> Result<(), StoreError> {
        let inverse = self.get_inverse_changes();
        if inverse.is_empty() {
            return Ok(());
        }
        debug!(records = inverse.len(), "discarding local changes");
        self.apply_changes(&inverse)
    }

    /// Bring back a record whose destroy has not been committed.
    fn undestroy(&self, store_key: &StoreKey, hash: &DataHash) -> Result<(), StoreError> {
        let mut announce = Announcements::default();
        {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let status = state.status(store_key);
            let ready = status.to_core(CoreStatus::Ready, StatusFlags::NONE)?;
            let settled = state.settle_dirty(store_key, ready)?;
            state.set_status(store_key, settled, &mut announce);
            if let Some(type_name) = state.type_of.get(store_key) {
                announce.type_changed(type_name);
            }
            announce.has_changes();
        }
        self.announce(announce);

        let current = self.get_hash(store_key).map(|h| (*h).clone()).unwrap_or_default();
        let partial: DataHash = hash
            .iter()
            .filter(|(key, value)| current.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !partial.is_empty() {
            self.update_hash(store_key, partial, true)?;
        }
        self.touch(store_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AttributeDef, ValueType};
    use crate::status::Status;
    use serde_json::{json, Value};

    fn store_with_committed(title: &str) -> (Store, StoreKey) {
        let store = Store::new();
        store.register_type(
            RecordType::new("Todo").with_attribute(AttributeDef::attr("title", ValueType::String)),
        );
        let mut hash = DataHash::new();
        hash.insert("id".into(), json!("t1"));
        hash.insert("title".into(), json!(title));
        let loaded = store.load_records("Todo", vec![hash]);
        (store, loaded[0].clone())
    }

    fn partial(value: Value) -> DataHash {
        match value {
            Value::Object(map) => map,
            _ => DataHash::new(),
        }
    }

    #[test]
    fn inverse_restores_committed_values() {
        let (store, sk) = store_with_committed("milk");
        store
            .update_hash(&sk, partial(json!({"title": "eggs"})), true)
            .unwrap();
        let inverse = store.get_inverse_changes();
        assert_eq!(inverse.update.len(), 1);
        assert_eq!(
            inverse.update[0].1,
            vec![("title".to_string(), Some(json!("milk")))]
        );

        store.apply_changes(&inverse).unwrap();
        assert_eq!(store.get_hash(&sk).unwrap()["title"], json!("milk"));
        assert_eq!(store.status(&sk), Status::READY);
    }

    #[test]
    fn inverse_removes_attributes_added_since_commit() {
        let (store, sk) = store_with_committed("milk");
        store
            .update_hash(&sk, partial(json!({"note": "oat"})), true)
            .unwrap();
        let inverse = store.get_inverse_changes();
        assert_eq!(inverse.update[0].1, vec![("note".to_string(), None)]);

        store.apply_changes(&inverse).unwrap();
        let data = store.get_hash(&sk).unwrap();
        assert!(!data.contains_key("note"));
        assert_eq!(store.status(&sk), Status::READY);
    }

    #[test]
    fn discard_drops_created_and_restores_destroyed() {
        let (store, sk) = store_with_committed("milk");
        let created = store
            .create_record("Todo", partial(json!({"title": "new"})))
            .unwrap();
        store.destroy_record(&sk).unwrap();
        assert!(store.has_changes());

        store.discard_changes().unwrap();
        assert_eq!(store.status(&created), Status::DESTROYED);
        assert_eq!(store.status(&sk), Status::READY);
        assert!(!store.has_changes());
    }

    #[test]
    fn recreated_record_is_remapped() {
        let (store, sk) = store_with_committed("milk");
        let mut inverse = InverseChanges::default();
        let mut hash = DataHash::new();
        hash.insert("id".into(), json!("t1"));
        hash.insert("title".into(), json!("milk"));
        inverse.create.push((sk.clone(), "Todo".into(), hash));

        {
            let mut state = store.inner.state.borrow_mut();
            state.release(&sk);
            state.unbind_id(&sk);
            state.status.insert(sk.clone(), Status::DESTROYED);
        }
        store.apply_changes(&inverse).unwrap();

        let recreated = store.resolve_store_key(&sk);
        assert_ne!(recreated, sk);
        assert_eq!(store.status(&recreated), Status::CREATED);
        let data = store.get_hash(&recreated).unwrap();
        assert_eq!(data["title"], json!("milk"));
        assert!(!data.contains_key("id"));
    }
}

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::schema::{AttributeDef, AttributeKind, RecordType};
use crate::error::StoreError;
use crate::observable::{Observer, ObserverId};
use crate::status::Status;
use crate::store::{DataHash, Store, StoreKey};

#[derive(Clone)]
enum Binding {
    Detached(Rc<RefCell<DataHash>>),
    Attached { store: Store, store_key: StoreKey },
}

/// Typed view over one record's data.
///
/// Attached records read and write through their store; any two handles for
/// the same store key are interchangeable. A detached record holds its own
/// data until [`Record::save_to_store`] is called.
#[derive(Clone)]
pub struct Record {
    record_type: Rc<RecordType>,
    binding: Binding,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Record");
        debug.field("type", &self.record_type.name());
        match &self.binding {
            Binding::Detached(data) => debug.field("data", &*data.borrow()),
            Binding::Attached { store_key, .. } => debug.field("store_key", store_key),
        };
        debug.finish()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        match (&self.binding, &other.binding) {
            (
                Binding::Attached { store, store_key },
                Binding::Attached {
                    store: other_store,
                    store_key: other_key,
                },
            ) => store.ptr_eq(other_store) && store_key == other_key,
            (Binding::Detached(a), Binding::Detached(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Record {
    /// A detached record with the type's defaults.
    pub fn new(record_type: Rc<RecordType>) -> Self {
        let data = record_type.default_hash();
        Record {
            record_type,
            binding: Binding::Detached(Rc::new(RefCell::new(data))),
        }
    }

    pub(crate) fn attached(store: Store, store_key: StoreKey, record_type: Rc<RecordType>) -> Self {
        Record {
            record_type,
            binding: Binding::Attached { store, store_key },
        }
    }

    pub fn record_type(&self) -> &Rc<RecordType> {
        &self.record_type
    }

    pub fn store(&self) -> Option<&Store> {
        match &self.binding {
            Binding::Attached { store, .. } => Some(store),
            Binding::Detached(_) => None,
        }
    }

    pub fn store_key(&self) -> Option<&StoreKey> {
        match &self.binding {
            Binding::Attached { store_key, .. } => Some(store_key),
            Binding::Detached(_) => None,
        }
    }

    fn attachment(&self, operation: &'static str) -> Result<(&Store, &StoreKey), StoreError> {
        match &self.binding {
            Binding::Attached { store, store_key } => Ok((store, store_key)),
            Binding::Detached(_) => Err(StoreError::DetachedRecord(operation)),
        }
    }

    /// Detached records report `READY|NEW|DIRTY`.
    pub fn status(&self) -> Status {
        match &self.binding {
            Binding::Attached { store, store_key } => store.status(store_key),
            Binding::Detached(_) => Status::CREATED,
        }
    }

    pub fn id(&self) -> Option<String> {
        match &self.binding {
            Binding::Attached { store, store_key } => store.id_for_store_key(store_key),
            Binding::Detached(data) => data
                .borrow()
                .get(RecordType::PRIMARY_KEY)
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    /// Snapshot of the current attribute values.
    pub fn data(&self) -> DataHash {
        match &self.binding {
            Binding::Attached { store, store_key } => store
                .get_hash(store_key)
                .map(|hash| (*hash).clone())
                .unwrap_or_default(),
            Binding::Detached(data) => data.borrow().clone(),
        }
    }

    fn raw(&self, key: &str) -> Option<Value> {
        match &self.binding {
            Binding::Attached { store, store_key } => {
                store.touch(store_key);
                store
                    .get_hash(store_key)
                    .and_then(|hash| hash.get(key).cloned())
            }
            Binding::Detached(data) => data.borrow().get(key).cloned(),
        }
    }

    /// Value of an attribute or computed property. Unset attributes read as
    /// their default, or null.
    pub fn get(&self, key: &str) -> Value {
        if self.record_type.computed_property(key).is_some() {
            return self.get_computed(key);
        }
        if let Some(value) = self.raw(key) {
            return value;
        }
        self.record_type
            .attribute(key)
            .and_then(|attribute| attribute.default.clone())
            .unwrap_or(Value::Null)
    }

    fn get_computed(&self, key: &str) -> Value {
        let Some(computed) = self.record_type.computed_property(key) else {
            return Value::Null;
        };
        match &self.binding {
            Binding::Attached { store, store_key } => {
                let notifier = store.notifier_for(store_key);
                if let Some(cached) = notifier.cached(key) {
                    return cached;
                }
                let value = (computed.compute)(self);
                notifier.cache_value(key, value.clone());
                value
            }
            Binding::Detached(_) => (computed.compute)(self),
        }
    }

    /// Read an attribute into a Rust type.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.get(key))?)
    }

    fn attribute(&self, key: &str) -> Result<&AttributeDef, StoreError> {
        self.record_type
            .attribute(key)
            .ok_or_else(|| StoreError::UnknownAttribute {
                type_name: self.record_type.name().to_string(),
                attribute: key.to_string(),
            })
    }

    /// Write an attribute.
    ///
    /// Returns `Ok(false)` when nothing was written: the value is unchanged,
    /// or it is null and the attribute is not nullable. A value of the wrong
    /// type is an error.
    pub fn set(&self, key: &str, value: Value) -> Result<bool, StoreError> {
        let attribute = self.attribute(key)?;
        if !attribute.will_set(&value)? {
            return Ok(false);
        }
        if self.raw(key).as_ref() == Some(&value) {
            return Ok(false);
        }
        match &self.binding {
            Binding::Detached(data) => {
                data.borrow_mut().insert(key.to_string(), value);
            }
            Binding::Attached { store, store_key } => {
                let mut partial = DataHash::new();
                partial.insert(key.to_string(), value);
                store.update_hash(store_key, partial, !attribute.no_sync)?;
            }
        }
        Ok(true)
    }

    /// Write an attribute from a Rust value.
    pub fn set_from<T: Serialize>(&self, key: &str, value: &T) -> Result<bool, StoreError> {
        self.set(key, serde_json::to_value(value)?)
    }

    fn relation(&self, key: &str, to_many: bool) -> Result<&str, StoreError> {
        let attribute = self.attribute(key)?;
        match (&attribute.kind, to_many) {
            (AttributeKind::ToOne(target), false) | (AttributeKind::ToMany(target), true) => {
                Ok(target)
            }
            _ => Err(StoreError::TypeMismatch {
                attribute: key.to_string(),
                expected: if to_many { "to-many" } else { "to-one" }.to_string(),
                found: format!("{:?}", attribute.kind),
            }),
        }
    }

    fn resolve_reference(
        &self,
        store: &Store,
        store_key: &StoreKey,
        key: &str,
        target_type: &str,
        reference: &str,
    ) -> Result<Record, StoreError> {
        let placeholder = store
            .reference_targets(store_key, key)
            .into_iter()
            .find(|target| target.as_str() == reference);
        match placeholder {
            Some(target) => store.materialise_record(target_type, &target),
            None => store.get_record(target_type, reference),
        }
    }

    /// Reference value for `target`: its id, or its store key as a placeholder
    /// until it has one.
    fn reference_to(
        &self,
        key: &str,
        target_type: &str,
        target: &Record,
    ) -> Result<(Value, Option<StoreKey>), StoreError> {
        if target.record_type.name() != target_type {
            return Err(StoreError::TypeMismatch {
                attribute: key.to_string(),
                expected: target_type.to_string(),
                found: target.record_type.name().to_string(),
            });
        }
        let (store, _) = self.attachment("setting a relation")?;
        let (target_store, target_key) = target.attachment("relation target")?;
        if !store.ptr_eq(target_store) {
            return Err(StoreError::DetachedRecord("relation target in another store"));
        }
        Ok(match target.id() {
            Some(id) => (Value::String(id), None),
            None => (
                Value::String(target_key.as_str().to_string()),
                Some(target_key.clone()),
            ),
        })
    }

    pub fn get_to_one(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let target_type = self.relation(key, false)?;
        let (store, store_key) = self.attachment("to-one lookup")?;
        match self.raw(key) {
            Some(Value::String(reference)) => self
                .resolve_reference(store, store_key, key, target_type, &reference)
                .map(Some),
            _ => Ok(None),
        }
    }

    pub fn set_to_one(&self, key: &str, target: Option<&Record>) -> Result<bool, StoreError> {
        let target_type = self.relation(key, false)?.to_string();
        let (store, store_key) = self.attachment("setting a relation")?;
        let value = match target {
            Some(target) => {
                let (value, placeholder) = self.reference_to(key, &target_type, target)?;
                if let Some(placeholder) = placeholder {
                    store.attr_maps_to_store_key(store_key, key, &placeholder);
                }
                value
            }
            None => Value::Null,
        };
        let changed = self.set(key, value.clone())?;
        if value.is_null() {
            store.attr_no_longer_maps_to_store_key(store_key, key);
        }
        Ok(changed)
    }

    pub fn get_to_many(&self, key: &str) -> Result<Vec<Record>, StoreError> {
        let target_type = self.relation(key, true)?;
        let (store, store_key) = self.attachment("to-many lookup")?;
        let references = match self.raw(key) {
            Some(Value::Array(items)) => items,
            _ => return Ok(Vec::new()),
        };
        references
            .iter()
            .filter_map(Value::as_str)
            .map(|reference| self.resolve_reference(store, store_key, key, target_type, reference))
            .collect()
    }

    pub fn set_to_many(&self, key: &str, targets: &[Record]) -> Result<bool, StoreError> {
        let target_type = self.relation(key, true)?.to_string();
        let (store, store_key) = self.attachment("setting a relation")?;
        let mut values = Vec::with_capacity(targets.len());
        for target in targets {
            let (value, placeholder) = self.reference_to(key, &target_type, target)?;
            if let Some(placeholder) = placeholder {
                store.attr_maps_to_store_key(store_key, key, &placeholder);
            }
            values.push(value);
        }
        self.set(key, Value::Array(values))
    }

    // ---- validation --------------------------------------------------------

    fn validate_detached(&self, attribute: &AttributeDef) -> Option<String> {
        let validate = attribute.validate.as_ref()?;
        validate(&self.get(&attribute.key), self)
    }

    pub fn error_for_attribute(&self, key: &str) -> Option<String> {
        match &self.binding {
            Binding::Attached { store, store_key } => store.error_for_attribute(store_key, key),
            Binding::Detached(_) => self
                .record_type
                .attribute(key)
                .and_then(|attribute| self.validate_detached(attribute)),
        }
    }

    pub fn errors(&self) -> BTreeMap<String, String> {
        match &self.binding {
            Binding::Attached { store, store_key } => store.errors(store_key),
            Binding::Detached(_) => self
                .record_type
                .attributes()
                .iter()
                .filter_map(|a| self.validate_detached(a).map(|e| (a.key.clone(), e)))
                .collect(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors().is_empty()
    }

    // ---- lifecycle ---------------------------------------------------------

    pub fn destroy(&self) -> Result<(), StoreError> {
        let (store, store_key) = self.attachment("destroy")?;
        store.destroy_record(store_key)
    }

    /// Create the detached record's data in `store` and return the attached
    /// record.
    pub fn save_to_store(&self, store: &Store) -> Result<Record, StoreError> {
        let data = match &self.binding {
            Binding::Detached(data) => data,
            Binding::Attached { store_key, .. } => {
                return Err(StoreError::AlreadyAttached(store_key.clone()))
            }
        };
        let data = data.borrow().clone();
        let store_key = store.create_record(self.record_type.name(), data)?;
        store.materialise_record(self.record_type.name(), &store_key)
    }

    pub fn refresh(&self) -> Result<bool, StoreError> {
        let (store, store_key) = self.attachment("refresh")?;
        store.refresh_record(store_key)
    }

    // ---- observation -------------------------------------------------------

    /// Observe an attribute, computed property, `status` or `errors`.
    pub fn observe(&self, key: &str, observer: Rc<dyn Observer>) -> Result<ObserverId, StoreError> {
        let (store, store_key) = self.attachment("observe")?;
        Ok(store.observe(store_key, key, observer))
    }

    pub fn unobserve(&self, key: &str, id: ObserverId) -> bool {
        match &self.binding {
            Binding::Attached { store, store_key } => store.unobserve(store_key, key, id),
            Binding::Detached(_) => false,
        }
    }

    pub fn begin_property_changes(&self) {
        if let Binding::Attached { store, store_key } = &self.binding {
            store.notifier_for(store_key).begin_property_changes();
        }
    }

    pub fn end_property_changes(&self) {
        if let Binding::Attached { store, store_key } = &self.binding {
            store.notifier_for(store_key).end_property_changes();
        }
    }
}

//! A source backed by process memory, answering on the next tick of a
//! [`RunLoop`]. Useful for tests and for wiring a store before a real
//! backend exists.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, warn};

use super::{CommitCallback, FetchCallback, FetchResponse, FetchResult, QueryCallback, Source};
use crate::error::StoreError;
use crate::query::{QueryRequest, QueryResult};
use crate::record::RecordType;
use crate::run_loop::RunLoop;
use crate::store::{ChangeSet, DataHash, StoreKey, TypeChanges};

/// How the next commit is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The records keep their local changes and may be committed again.
    Temporary,
    /// Creates are discarded, updates marked obsolete, destroys undone.
    Permanent,
}

#[derive(Default)]
struct Table {
    id_prefix: String,
    next_id: u64,
    version: u64,
    rows: BTreeMap<String, Vec<u8>>,
}

impl Table {
    fn state(&self) -> String {
        self.version.to_string()
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("{}{}", self.id_prefix, self.next_id)
    }

    fn read(&self, id: &str) -> Option<Result<DataHash, StoreError>> {
        self.rows
            .get(id)
            .map(|bytes| serde_json::from_slice(bytes).map_err(StoreError::from))
    }

    fn write(&mut self, id: &str, hash: &DataHash) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(hash)?;
        self.rows.insert(id.to_string(), bytes);
        Ok(())
    }

    fn all(&self) -> Result<Vec<DataHash>, StoreError> {
        self.rows
            .values()
            .map(|bytes| serde_json::from_slice(bytes).map_err(StoreError::from))
            .collect()
    }
}

#[derive(Default)]
struct Storage {
    tables: HashMap<String, Table>,
    reject_next: Option<Rejection>,
}

/// Holds records per type as serialized JSON.
///
/// Only types added with [`InMemorySource::with_type`] are handled; requests
/// for other types return `false` so an aggregate can try another source.
#[derive(Clone)]
pub struct InMemorySource {
    run_loop: RunLoop,
    storage: Rc<RefCell<Storage>>,
}

impl InMemorySource {
    pub fn new(run_loop: &RunLoop) -> Self {
        InMemorySource {
            run_loop: run_loop.clone(),
            storage: Rc::new(RefCell::new(Storage::default())),
        }
    }

    /// Handle `type_name`, allocating ids as `prefix1`, `prefix2`, ...
    pub fn with_type(self, type_name: &str, id_prefix: &str) -> Self {
        self.storage.borrow_mut().tables.insert(
            type_name.to_string(),
            Table {
                id_prefix: id_prefix.to_string(),
                ..Table::default()
            },
        );
        self
    }

    pub fn handles(&self, type_name: &str) -> bool {
        self.storage.borrow().tables.contains_key(type_name)
    }

    /// Seed a record directly, allocating an id if the hash has none.
    pub fn insert(&self, type_name: &str, mut hash: DataHash) -> Result<String, StoreError> {
        let mut storage = self.storage.borrow_mut();
        let table = storage
            .tables
            .get_mut(type_name)
            .ok_or_else(|| StoreError::UnknownType(type_name.to_string()))?;
        let id = match hash.get(RecordType::PRIMARY_KEY).and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = table.allocate_id();
                hash.insert(RecordType::PRIMARY_KEY.to_string(), Value::from(id.clone()));
                id
            }
        };
        table.write(&id, &hash)?;
        table.version += 1;
        Ok(id)
    }

    pub fn get(&self, type_name: &str, id: &str) -> Option<DataHash> {
        let storage = self.storage.borrow();
        storage.tables.get(type_name)?.read(id)?.ok()
    }

    pub fn len(&self, type_name: &str) -> usize {
        self.storage
            .borrow()
            .tables
            .get(type_name)
            .map_or(0, |table| table.rows.len())
    }

    pub fn state(&self, type_name: &str) -> Option<String> {
        self.storage.borrow().tables.get(type_name).map(Table::state)
    }

    /// Refuse the next commit this source receives.
    pub fn reject_next_commit(&self, rejection: Rejection) {
        self.storage.borrow_mut().reject_next = Some(rejection);
    }
}

impl Source for InMemorySource {
    fn fetch_record(&self, record_type: &RecordType, id: &str, callback: FetchCallback) -> bool {
        let type_name = record_type.name().to_string();
        if !self.handles(&type_name) {
            return false;
        }
        let storage = Rc::clone(&self.storage);
        let id = id.to_string();
        self.run_loop.next_tick(move || {
            let result = {
                let storage = storage.borrow();
                match storage.tables.get(&type_name) {
                    None => FetchResult::NotFound,
                    Some(table) => match table.read(&id) {
                        None => FetchResult::NotFound,
                        Some(Err(err)) => FetchResult::Failed(err.to_string()),
                        Some(Ok(hash)) => FetchResult::Loaded(FetchResponse {
                            records: vec![hash],
                            state: Some(table.state()),
                        }),
                    },
                }
            };
            callback.resolve(result);
        });
        true
    }

    fn fetch_all_records(
        &self,
        record_type: &RecordType,
        state: Option<&str>,
        callback: FetchCallback,
    ) -> bool {
        let type_name = record_type.name().to_string();
        if !self.handles(&type_name) {
            return false;
        }
        let storage = Rc::clone(&self.storage);
        let known_state = state.map(str::to_string);
        self.run_loop.next_tick(move || {
            let result = {
                let storage = storage.borrow();
                match storage.tables.get(&type_name) {
                    None => FetchResult::NotFound,
                    Some(table) if known_state.as_deref() == Some(table.state().as_str()) => {
                        FetchResult::Loaded(FetchResponse {
                            records: Vec::new(),
                            state: Some(table.state()),
                        })
                    }
                    Some(table) => match table.all() {
                        Ok(records) => FetchResult::Loaded(FetchResponse {
                            records,
                            state: Some(table.state()),
                        }),
                        Err(err) => FetchResult::Failed(err.to_string()),
                    },
                }
            };
            callback.resolve(result);
        });
        true
    }

    fn fetch_query(&self, request: &QueryRequest, callback: QueryCallback) -> bool {
        if !self.handles(&request.type_name) {
            return false;
        }
        let storage = Rc::clone(&self.storage);
        let request = request.clone();
        self.run_loop.next_tick(move || {
            let answer = {
                let storage = storage.borrow();
                match storage.tables.get(&request.type_name) {
                    Some(table) => run_query(table, &request),
                    None => Ok(QueryResult::default()),
                }
            };
            match answer {
                Ok(result) => {
                    callback.resolve(result);
                }
                Err(err) => {
                    callback.fail(&err.to_string());
                }
            }
        });
        true
    }

    fn commit_changes(&self, changes: &mut ChangeSet, callback: CommitCallback) {
        let taken: Vec<(String, TypeChanges)> = changes
            .type_names()
            .into_iter()
            .filter(|type_name| self.handles(type_name))
            .filter_map(|type_name| {
                let bucket = changes.take(&type_name)?;
                Some((type_name, bucket))
            })
            .collect();
        if taken.is_empty() {
            return;
        }
        let rejection = self.storage.borrow_mut().reject_next.take();
        let storage = Rc::clone(&self.storage);
        self.run_loop.next_tick(move || {
            for (type_name, bucket) in taken {
                match rejection {
                    Some(rejection) => reject(&type_name, bucket, rejection, &callback),
                    None => apply(&storage, &type_name, bucket, &callback),
                }
            }
        });
    }
}

fn reject(type_name: &str, bucket: TypeChanges, rejection: Rejection, callback: &CommitCallback) {
    debug!(type_name, ?rejection, "rejecting commit");
    let permanent = rejection == Rejection::Permanent;
    if !bucket.create.store_keys.is_empty() {
        callback.did_not_create(&bucket.create.store_keys, permanent);
    }
    if !bucket.update.store_keys.is_empty() {
        if permanent {
            callback.record_is_obsolete(&bucket.update.store_keys);
        } else {
            callback.did_not_update(&bucket.update.store_keys);
        }
    }
    if !bucket.destroy.store_keys.is_empty() {
        callback.did_not_destroy(&bucket.destroy.store_keys, permanent);
    }
}

fn apply(
    storage: &RefCell<Storage>,
    type_name: &str,
    bucket: TypeChanges,
    callback: &CommitCallback,
) {
    let mut created: Vec<(StoreKey, String)> = Vec::new();
    let mut not_created: Vec<StoreKey> = Vec::new();
    let mut updated: Vec<StoreKey> = Vec::new();
    let mut obsolete: Vec<StoreKey> = Vec::new();
    let mut destroyed: Vec<StoreKey> = Vec::new();
    {
        let mut guard = storage.borrow_mut();
        let Some(table) = guard.tables.get_mut(type_name) else {
            return;
        };

        for (store_key, mut hash) in bucket.create.store_keys.into_iter().zip(bucket.create.records) {
            let id = table.allocate_id();
            hash.insert(RecordType::PRIMARY_KEY.to_string(), Value::from(id.clone()));
            match table.write(&id, &hash) {
                Ok(()) => created.push((store_key, id)),
                Err(err) => {
                    warn!(type_name, %store_key, %err, "could not store created record");
                    not_created.push(store_key);
                }
            }
        }

        let updates = bucket
            .update
            .store_keys
            .into_iter()
            .zip(bucket.update.records)
            .zip(bucket.update.changes);
        for ((store_key, hash), changed) in updates {
            let id = hash
                .get(RecordType::PRIMARY_KEY)
                .and_then(Value::as_str)
                .map(str::to_string);
            let Some(current) = id.as_deref().and_then(|id| table.read(id)) else {
                obsolete.push(store_key);
                continue;
            };
            let mut merged = current.unwrap_or_default();
            for key in changed.iter().filter(|key| !hash.contains_key(*key)) {
                merged.remove(key);
            }
            merged.extend(hash);
            match id.as_deref().map(|id| table.write(id, &merged)) {
                Some(Ok(())) => updated.push(store_key),
                _ => obsolete.push(store_key),
            }
        }

        for (store_key, id) in bucket.destroy.store_keys.into_iter().zip(bucket.destroy.ids) {
            table.rows.remove(&id);
            destroyed.push(store_key);
        }

        if !(created.is_empty() && updated.is_empty() && destroyed.is_empty()) {
            table.version += 1;
        }
    }
    debug!(
        type_name,
        created = created.len(),
        updated = updated.len(),
        destroyed = destroyed.len(),
        "commit applied"
    );

    if !created.is_empty() {
        callback.did_commit_create(&created);
    }
    if !not_created.is_empty() {
        callback.did_not_create(&not_created, false);
    }
    if !updated.is_empty() {
        callback.did_commit_update(&updated);
    }
    if !obsolete.is_empty() {
        callback.record_is_obsolete(&obsolete);
    }
    if !destroyed.is_empty() {
        callback.did_commit_destroy(&destroyed);
    }
}

/// Filter by equality on every key of an object `where` clause, order by the
/// named attribute (a leading `-` reverses it) and slice out the range.
fn run_query(table: &Table, request: &QueryRequest) -> Result<QueryResult, StoreError> {
    let mut rows = table.all()?;
    if let Some(Value::Object(clause)) = &request.filter {
        rows.retain(|row| {
            clause
                .iter()
                .all(|(key, expected)| row.get(key).unwrap_or(&Value::Null) == expected)
        });
    }
    if let Some(sort) = &request.sort {
        let (key, descending) = match sort.strip_prefix('-') {
            Some(key) => (key, true),
            None => (sort.as_str(), false),
        };
        rows.sort_by(|a, b| {
            let ordering = compare_values(a.get(key), b.get(key));
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }

    let total = rows.len();
    let start = request.range.start.min(total);
    let end = request.range.end.min(total).max(start);
    let records: Vec<DataHash> = rows.drain(start..end).collect();
    let ids = records
        .iter()
        .filter_map(|row| row.get(RecordType::PRIMARY_KEY).and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    Ok(QueryResult {
        position: start,
        ids,
        total,
        records,
        state: Some(table.state()),
    })
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

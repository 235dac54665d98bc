//! The capability through which a store reaches remote data.
//!
//! Every request either returns `false` (not handled) or returns `true` and
//! answers later, exactly once, through the callback it was given.

mod aggregate;
mod callback;
mod in_memory;

pub use aggregate::AggregateSource;
pub use callback::{CommitCallback, FetchCallback, QueryCallback};
pub use in_memory::{InMemorySource, Rejection};

use crate::query::QueryRequest;
use crate::record::RecordType;
use crate::store::{ChangeSet, DataHash};

/// Records returned by a fetch together with the source's state string for
/// the type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResponse {
    pub records: Vec<DataHash>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    Loaded(FetchResponse),
    NotFound,
    Failed(String),
}

pub trait Source {
    fn fetch_record(&self, record_type: &RecordType, id: &str, callback: FetchCallback) -> bool;

    /// Fetch every record of a type. `state` is the last state string the
    /// source reported, letting it answer with only what changed.
    fn fetch_all_records(
        &self,
        record_type: &RecordType,
        state: Option<&str>,
        callback: FetchCallback,
    ) -> bool;

    /// Re-fetch a record the store already holds.
    fn refresh_record(&self, record_type: &RecordType, id: &str, callback: FetchCallback) -> bool {
        self.fetch_record(record_type, id, callback)
    }

    fn fetch_query(&self, request: &QueryRequest, callback: QueryCallback) -> bool;

    /// Take the types this source handles out of `changes` and commit them,
    /// reporting per record through `callback`.
    fn commit_changes(&self, changes: &mut ChangeSet, callback: CommitCallback);
}

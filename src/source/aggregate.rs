use std::rc::Rc;

use tracing::trace;

use super::{CommitCallback, FetchCallback, QueryCallback, Source};
use crate::query::QueryRequest;
use crate::record::RecordType;
use crate::store::ChangeSet;

/// Tries each inner source in order. Fetches go to the first source that
/// accepts them; commits are offered to every source, each taking the types
/// it handles from what the earlier ones left.
#[derive(Clone, Default)]
pub struct AggregateSource {
    sources: Vec<Rc<dyn Source>>,
}

impl AggregateSource {
    pub fn new() -> Self {
        AggregateSource::default()
    }

    pub fn with_source(mut self, source: Rc<dyn Source>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn add_source(&mut self, source: Rc<dyn Source>) {
        self.sources.push(source);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl Source for AggregateSource {
    fn fetch_record(&self, record_type: &RecordType, id: &str, callback: FetchCallback) -> bool {
        self.sources
            .iter()
            .any(|source| source.fetch_record(record_type, id, callback.clone()))
    }

    fn fetch_all_records(
        &self,
        record_type: &RecordType,
        state: Option<&str>,
        callback: FetchCallback,
    ) -> bool {
        self.sources
            .iter()
            .any(|source| source.fetch_all_records(record_type, state, callback.clone()))
    }

    fn refresh_record(&self, record_type: &RecordType, id: &str, callback: FetchCallback) -> bool {
        self.sources
            .iter()
            .any(|source| source.refresh_record(record_type, id, callback.clone()))
    }

    fn fetch_query(&self, request: &QueryRequest, callback: QueryCallback) -> bool {
        self.sources
            .iter()
            .any(|source| source.fetch_query(request, callback.clone()))
    }

    fn commit_changes(&self, changes: &mut ChangeSet, callback: CommitCallback) {
        for (index, source) in self.sources.iter().enumerate() {
            trace!(source = index, types = ?changes.type_names(), "offering changes");
            source.commit_changes(changes, callback.clone());
        }
    }
}

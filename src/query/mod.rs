//! Ordered lists of store keys over the records of one type.
//!
//! [`LocalQuery`] filters and sorts what the store already holds and keeps
//! itself current through store events. [`RemoteQuery`] asks the source for
//! windows of a list it computes and fills them in as they arrive.

mod local;
mod remote;

pub use local::{Filter, LocalQuery, Sort};
pub(crate) use remote::RemoteQueryInner;
pub use remote::{QueryRequest, QueryResult, RemoteQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    Empty,
    Loading,
    Ready,
    Obsolete,
    Destroyed,
}

impl QueryStatus {
    pub fn name(self) -> &'static str {
        match self {
            QueryStatus::Empty => "empty",
            QueryStatus::Loading => "loading",
            QueryStatus::Ready => "ready",
            QueryStatus::Obsolete => "obsolete",
            QueryStatus::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

mod config;
mod error;
mod memory;
mod observable;
mod query;
mod record;
mod run_loop;
mod source;
mod status;
mod store;
mod undo;

pub use config::{ConfigError, MemoryConfig, QueryConfig, StoreConfig, UndoConfig};
pub use error::StoreError;
pub use memory::{EvictedRecord, MemoryManager, Restriction};
pub use observable::{Notifier, ObservableObject, Observer, ObserverId, PropertyChange};
pub use query::{
    Filter, LocalQuery, QueryRequest, QueryResult, QueryStatus, RemoteQuery, Sort,
};
pub use record::{
    AttributeDef, AttributeKind, ComputeFn, ComputedDef, Record, RecordType, Validator, ValueType,
};
pub use run_loop::{RunLoop, TaskId};
pub use source::{
    AggregateSource, CommitCallback, FetchCallback, FetchResponse, FetchResult, InMemorySource,
    QueryCallback, Rejection, Source,
};
pub use status::{CoreStatus, Status, StatusError, StatusFlags};
pub use store::{
    ChangeSet, CreateBatch, DataHash, DestroyBatch, InverseChanges, ListenerId, Store, StoreEvent,
    StoreKey, StoreListener, TypeChanges, UpdateBatch,
};
pub use undo::UndoManager;

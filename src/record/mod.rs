//! Typed records over store data and the declarations that describe them.

mod record;
mod schema;

pub use record::Record;
pub use schema::{
    AttributeDef, AttributeKind, ComputeFn, ComputedDef, RecordType, Validator, ValueType,
};

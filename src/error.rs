use std::fmt;

use crate::status::{Status, StatusError};
use crate::store::StoreKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    UnknownType(String),
    UnknownStoreKey(StoreKey),
    UnknownAttribute {
        type_name: String,
        attribute: String,
    },
    TypeMismatch {
        attribute: String,
        expected: String,
        found: String,
    },
    DetachedRecord(&'static str),
    AlreadyAttached(StoreKey),
    InvalidStatus(StatusError),
    /// The record's status does not permit the operation.
    NotPermitted {
        store_key: StoreKey,
        status: Status,
        operation: &'static str,
    },
    Serde(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::UnknownType(name) => write!(f, "unknown record type {}", name),
            StoreError::UnknownStoreKey(store_key) => {
                write!(f, "no record is loaded for store key {}", store_key)
            }
            StoreError::UnknownAttribute {
                type_name,
                attribute,
            } => write!(f, "{} has no attribute named {}", type_name, attribute),
            StoreError::TypeMismatch {
                attribute,
                expected,
                found,
            } => write!(
                f,
                "type mismatch on attribute {} (expected {}, got {})",
                attribute, expected, found
            ),
            StoreError::DetachedRecord(operation) => {
                write!(f, "{} requires a record attached to a store", operation)
            }
            StoreError::AlreadyAttached(store_key) => {
                write!(f, "record is already stored under {}", store_key)
            }
            StoreError::InvalidStatus(err) => write!(f, "invalid status transition: {}", err),
            StoreError::NotPermitted {
                store_key,
                status,
                operation,
            } => write!(
                f,
                "cannot {} record {} while it is {}",
                operation, store_key, status
            ),
            StoreError::Serde(message) => write!(f, "serialization error: {}", message),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StatusError> for StoreError {
    fn from(err: StatusError) -> Self {
        StoreError::InvalidStatus(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serde(err.to_string())
    }
}

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identity of a record's data while it is resident in a store.
///
/// Keys are allocated in sequence (`k1`, `k2`, ...) and order by allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreKey(String);

impl StoreKey {
    pub(crate) fn from_sequence(sequence: u64) -> Self {
        StoreKey(format!("k{}", sequence))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for StoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for StoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_allocation() {
        let mut keys = vec![
            StoreKey::from_sequence(10),
            StoreKey::from_sequence(2),
            StoreKey::from_sequence(1),
        ];
        keys.sort();
        let names: Vec<&str> = keys.iter().map(StoreKey::as_str).collect();
        assert_eq!(names, vec!["k1", "k2", "k10"]);
    }

    #[test]
    fn serializes_as_plain_string() {
        let key = StoreKey::from_sequence(7);
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"k7\"");
    }
}

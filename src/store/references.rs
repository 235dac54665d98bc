//! Deferred reference resolution.
//!
//! A to-one or to-many attribute that points at a record without an id holds
//! the target's store key as a placeholder. The graph remembers every such
//! edge so the placeholders can be rewritten in one pass once the target's
//! create is confirmed.

use std::collections::HashMap;

use serde_json::Value;

use super::StoreKey;

#[derive(Debug, Default)]
pub(crate) struct ReferenceGraph {
    /// target -> (dependent, attribute)
    dependents: HashMap<StoreKey, Vec<(StoreKey, String)>>,
    /// (dependent, attribute) -> targets
    targets: HashMap<(StoreKey, String), Vec<StoreKey>>,
}

impl ReferenceGraph {
    pub(crate) fn add(&mut self, dependent: &StoreKey, attribute: &str, target: &StoreKey) {
        let edge = (dependent.clone(), attribute.to_string());
        let targets = self.targets.entry(edge.clone()).or_default();
        if targets.contains(target) {
            return;
        }
        targets.push(target.clone());
        self.dependents.entry(target.clone()).or_default().push(edge);
    }

    pub(crate) fn remove_attribute(&mut self, dependent: &StoreKey, attribute: &str) {
        let edge = (dependent.clone(), attribute.to_string());
        let Some(targets) = self.targets.remove(&edge) else {
            return;
        };
        for target in targets {
            self.unlink(&target, &edge);
        }
    }

    /// Drop targets of `(dependent, attribute)` whose placeholder no longer
    /// appears in `value`.
    pub(crate) fn retain_present(&mut self, dependent: &StoreKey, attribute: &str, value: &Value) {
        let edge = (dependent.clone(), attribute.to_string());
        let Some(targets) = self.targets.get_mut(&edge) else {
            return;
        };
        let mut dropped = Vec::new();
        targets.retain(|target| {
            let keep = mentions(value, target);
            if !keep {
                dropped.push(target.clone());
            }
            keep
        });
        if targets.is_empty() {
            self.targets.remove(&edge);
        }
        for target in dropped {
            self.unlink(&target, &edge);
        }
    }

    pub(crate) fn targets(&self, dependent: &StoreKey, attribute: &str) -> Vec<StoreKey> {
        self.targets
            .get(&(dependent.clone(), attribute.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Remove and return every edge pointing at `target`.
    pub(crate) fn take_dependents(&mut self, target: &StoreKey) -> Vec<(StoreKey, String)> {
        let edges = self.dependents.remove(target).unwrap_or_default();
        for edge in &edges {
            if let Some(targets) = self.targets.get_mut(edge) {
                targets.retain(|t| t != target);
                if targets.is_empty() {
                    self.targets.remove(edge);
                }
            }
        }
        edges
    }

    /// Forget every edge from or to `store_key`.
    pub(crate) fn remove_record(&mut self, store_key: &StoreKey) {
        let owned: Vec<String> = self
            .targets
            .keys()
            .filter(|(dependent, _)| dependent == store_key)
            .map(|(_, attribute)| attribute.clone())
            .collect();
        for attribute in owned {
            self.remove_attribute(store_key, &attribute);
        }
        self.take_dependents(store_key);
    }

    fn unlink(&mut self, target: &StoreKey, edge: &(StoreKey, String)) {
        if let Some(edges) = self.dependents.get_mut(target) {
            edges.retain(|e| e != edge);
            if edges.is_empty() {
                self.dependents.remove(target);
            }
        }
    }
}

fn mentions(value: &Value, target: &StoreKey) -> bool {
    match value {
        Value::String(s) => s == target.as_str(),
        Value::Array(items) => items.iter().any(|item| mentions(item, target)),
        _ => false,
    }
}

/// Replace the placeholder for `target` with `id` inside `value`.
pub(crate) fn substitute(value: &Value, target: &StoreKey, id: &str) -> Value {
    match value {
        Value::String(s) if s == target.as_str() => Value::String(id.to_string()),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute(item, target, id))
                .collect(),
        ),
        other => other.clone(),
    }
}

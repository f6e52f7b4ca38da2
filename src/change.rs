//! Structural change detection between a draft and its benchmark.
//!
//! The benchmark is a deep snapshot of the draft at materialization
//! time. After every mutation the draft is diffed against it
//! field-by-field; the resulting `ChangeSet` drives the `changed`
//! metastate flag and lets `write` send a minimal changed-fields
//! payload to the backend.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Classification of one top-level field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Present in the draft but not the benchmark.
    Added,
    /// Present in the benchmark but not the draft.
    Removed,
    /// Present in both with structurally different values.
    Changed,
}

/// The set of top-level fields that differ between benchmark and draft.
///
/// Keys are ordered so the set has a stable presentation. Containers
/// are compared by deep structural equality; scalars by value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    entries: BTreeMap<String, ChangeKind>,
}

impl ChangeSet {
    /// Diff a benchmark against the current draft.
    ///
    /// Both values are normally objects; for non-object roots the whole
    /// value is compared and recorded under the empty key.
    pub fn diff(benchmark: &Value, draft: &Value) -> Self {
        let mut entries = BTreeMap::new();

        match (benchmark.as_object(), draft.as_object()) {
            (Some(before), Some(after)) => {
                for (key, value) in before {
                    match after.get(key) {
                        None => {
                            entries.insert(key.clone(), ChangeKind::Removed);
                        }
                        Some(current) if current != value => {
                            entries.insert(key.clone(), ChangeKind::Changed);
                        }
                        Some(_) => {}
                    }
                }
                for key in after.keys() {
                    if !before.contains_key(key) {
                        entries.insert(key.clone(), ChangeKind::Added);
                    }
                }
            }
            _ => {
                if benchmark != draft {
                    entries.insert(String::new(), ChangeKind::Changed);
                }
            }
        }

        Self { entries }
    }

    /// True when benchmark and draft agree.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of differing fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Classification for one field, if it differs.
    pub fn kind(&self, key: &str) -> Option<ChangeKind> {
        self.entries.get(key).copied()
    }

    /// Iterate over differing fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ChangeKind)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Build the minimal changed-fields payload for an update: an
    /// object holding the draft's current value for every added or
    /// changed field. Removed fields are omitted (the backend contract
    /// for removal is `update` with the field absent).
    pub fn minimal_payload(&self, draft: &Value) -> Value {
        let mut out = Map::new();
        if let Some(fields) = draft.as_object() {
            for (key, kind) in self.iter() {
                if matches!(kind, ChangeKind::Added | ChangeKind::Changed) {
                    if let Some(value) = fields.get(key) {
                        out.insert(key.to_string(), value.clone());
                    }
                }
            }
        }
        Value::Object(out)
    }
}

//! Draft editing.
//!
//! A [`DraftHandle`] is the only way to mutate a path's draft. Every
//! `set`/`remove`/`merge` goes through one pipeline: serialize the
//! input (rejecting unrepresentable values before anything changes),
//! apply the edit under the entry lock, recompute the retained diff
//! against the benchmark, emit events, and kick off a fresh
//! validation generation.
//!
//! Key paths are `/`-separated (`"author/name"`). `set` creates
//! missing intermediate objects; numeric segments index into arrays.
//! Handles are path-scoped: `child` narrows the key-path prefix
//! without granting access to any other path.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::router::{Descriptor, DEADEND};
use crate::store::{canonical, OpenState};

impl OpenState {
    /// Obtain a draft handle for `path`, materializing the draft if
    /// needed (from confirmed state via `to_draft`, else from
    /// `default_draft`). Fails with [`Error::Permission`] when the
    /// path is not writable, including the deadend path.
    pub fn draft(&self, path: &str) -> Result<DraftHandle> {
        let path = canonical(path);
        if path == DEADEND {
            return Err(Error::Permission {
                path: path.to_string(),
            });
        }
        let (descriptor, _params) = self.touch(path)?;
        self.materialize_draft(path, &descriptor)?;
        Ok(DraftHandle {
            engine: self.clone(),
            descriptor,
            path: path.to_string(),
            base: String::new(),
        })
    }

    /// Apply `edit` to the draft, recompute changes, emit, and start
    /// a new validation generation. Rematerializes the draft first
    /// when a reset or purge dropped it since the handle was created.
    pub(crate) fn mutate_draft(
        &self,
        path: &str,
        descriptor: &Descriptor,
        edit: impl FnOnce(&mut Value) -> Result<()>,
    ) -> Result<()> {
        // A purge may have removed the entry entirely.
        self.touch(path)?;
        self.materialize_draft(path, descriptor)?;

        {
            let mut entry = match self.inner.entries.get_mut(path) {
                Some(entry) => entry,
                None => return Ok(()),
            };
            let Some(draft) = entry.draft.as_mut() else {
                return Ok(());
            };
            edit(&mut draft.value)?;
            let changed = draft.recompute();
            entry.meta.changed = changed;
        }

        self.emit(path, EventKind::Mutable);
        self.emit(path, EventKind::Metastate);
        self.revalidate(path, descriptor, None);
        Ok(())
    }
}

/// An editing capability for one path's draft. Cheap to clone.
#[derive(Clone)]
pub struct DraftHandle {
    engine: OpenState,
    descriptor: Descriptor,
    path: String,
    /// Key-path prefix; empty at the draft root.
    base: String,
}

impl DraftHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn key_path(&self) -> &str {
        &self.base
    }

    /// A handle scoped to a sub-tree of the draft.
    pub fn child(&self, key_path: &str) -> DraftHandle {
        DraftHandle {
            engine: self.engine.clone(),
            descriptor: self.descriptor.clone(),
            path: self.path.clone(),
            base: join_key_path(&self.base, key_path),
        }
    }

    /// Set the value at `key_path` (relative to this handle),
    /// creating missing intermediate objects. Unserializable input
    /// is rejected before the draft is touched.
    pub fn set(&self, key_path: &str, value: impl Serialize) -> Result<()> {
        let full = join_key_path(&self.base, key_path);
        let json = serde_json::to_value(value).map_err(|err| Error::Serialization {
            key_path: full.clone(),
            reason: err.to_string(),
        })?;
        self.engine
            .mutate_draft(&self.path, &self.descriptor, |root| {
                let slot = descend_mut(root, &full)?;
                *slot = json;
                Ok(())
            })
    }

    /// Remove the key at `key_path`. Removing an absent key is a
    /// no-op (the mutation pipeline still runs, so an earlier diff is
    /// recomputed).
    pub fn remove(&self, key_path: &str) -> Result<()> {
        let full = join_key_path(&self.base, key_path);
        self.engine
            .mutate_draft(&self.path, &self.descriptor, |root| {
                remove_at(root, &full);
                Ok(())
            })
    }

    /// Merge the top-level entries of an object into this handle's
    /// sub-tree, like assigning several keys at once.
    pub fn merge(&self, value: impl Serialize) -> Result<()> {
        let json = serde_json::to_value(value).map_err(|err| Error::Serialization {
            key_path: self.base.clone(),
            reason: err.to_string(),
        })?;
        let Value::Object(incoming) = json else {
            return Err(Error::Serialization {
                key_path: self.base.clone(),
                reason: "merge requires an object".to_string(),
            });
        };
        let base = self.base.clone();
        self.engine
            .mutate_draft(&self.path, &self.descriptor, move |root| {
                let slot = descend_mut(root, &base)?;
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(target) = slot {
                    for (key, value) in incoming {
                        target.insert(key, value);
                    }
                }
                Ok(())
            })
    }

    /// Snapshot of this handle's sub-tree of the draft.
    pub fn value(&self) -> Option<Value> {
        let root = self.engine.draft_value(&self.path)?;
        descend(&root, &self.base).cloned()
    }

    /// Snapshot of the value at `key_path`, if present.
    pub fn get(&self, key_path: &str) -> Option<Value> {
        let root = self.engine.draft_value(&self.path)?;
        descend(&root, &join_key_path(&self.base, key_path)).cloned()
    }
}

impl std::fmt::Debug for DraftHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DraftHandle")
            .field("path", &self.path)
            .field("key_path", &self.base)
            .finish()
    }
}

// ============================================================================
// Key-path navigation
// ============================================================================

fn join_key_path(base: &str, key_path: &str) -> String {
    let key_path = key_path.trim_matches('/');
    if base.is_empty() {
        key_path.to_string()
    } else if key_path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{key_path}")
    }
}

fn segments(key_path: &str) -> impl Iterator<Item = &str> {
    key_path.split('/').filter(|segment| !segment.is_empty())
}

/// Walk `key_path` immutably. `None` when any step is absent.
fn descend<'a>(root: &'a Value, key_path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments(key_path) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Walk `key_path` mutably, creating missing intermediate objects.
/// Descending through a scalar is a shape violation and fails without
/// modifying anything below the scalar.
fn descend_mut<'a>(root: &'a mut Value, key_path: &str) -> Result<&'a mut Value> {
    let mut current = root;
    for segment in segments(key_path) {
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => {
                let index =
                    segment
                        .parse::<usize>()
                        .map_err(|_| Error::Serialization {
                            key_path: key_path.to_string(),
                            reason: format!("'{segment}' is not an array index"),
                        })?;
                items.get_mut(index).ok_or_else(|| Error::Serialization {
                    key_path: key_path.to_string(),
                    reason: format!("index {index} out of bounds"),
                })?
            }
            _ => {
                return Err(Error::Serialization {
                    key_path: key_path.to_string(),
                    reason: format!("cannot descend through scalar at '{segment}'"),
                })
            }
        };
    }
    Ok(current)
}

/// Remove the final segment of `key_path` from its parent container.
/// Absent keys and indices are ignored.
fn remove_at(root: &mut Value, key_path: &str) {
    let parts: Vec<&str> = segments(key_path).collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };
    let mut current = root;
    for segment in parents {
        current = match current {
            Value::Object(map) => match map.get_mut(*segment) {
                Some(next) => next,
                None => return,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i))
            {
                Some(next) => next,
                None => return,
            },
            _ => return,
        };
    }
    match current {
        Value::Object(map) => {
            map.remove(*last);
        }
        Value::Array(items) => {
            if let Ok(index) = last.parse::<usize>() {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descend_walks_objects_and_arrays() {
        let root = json!({"author": {"tags": ["a", "b"]}});
        assert_eq!(descend(&root, "author/tags/1"), Some(&json!("b")));
        assert_eq!(descend(&root, ""), Some(&root));
        assert_eq!(descend(&root, "author/missing"), None);
        assert_eq!(descend(&root, "author/tags/7"), None);
    }

    #[test]
    fn test_descend_mut_creates_intermediates() {
        let mut root = json!({});
        *descend_mut(&mut root, "author/name").unwrap() = json!("sam");
        assert_eq!(root, json!({"author": {"name": "sam"}}));
    }

    #[test]
    fn test_descend_mut_refuses_scalar_parent() {
        let mut root = json!({"count": 3});
        let err = descend_mut(&mut root, "count/nested").unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
        // The scalar is untouched.
        assert_eq!(root, json!({"count": 3}));
    }

    #[test]
    fn test_remove_at_object_and_array() {
        let mut root = json!({"tags": ["a", "b", "c"], "title": "x"});
        remove_at(&mut root, "tags/1");
        remove_at(&mut root, "title");
        remove_at(&mut root, "absent/deep");
        assert_eq!(root, json!({"tags": ["a", "c"]}));
    }

    #[test]
    fn test_join_key_path() {
        assert_eq!(join_key_path("", "author"), "author");
        assert_eq!(join_key_path("author", "name"), "author/name");
        assert_eq!(join_key_path("author", ""), "author");
        assert_eq!(join_key_path("", "/author/name/"), "author/name");
    }
}

//! Per-path bookkeeping owned by the orchestrator.
//!
//! Each path has exactly one `PathEntry` holding its quadruple of
//! views (confirmed state, draft, metastate, rejections) plus the last
//! operation errors and the validation generation machinery. Entries
//! are created lazily on first access and removed only by `purge`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::change::ChangeSet;
use crate::error::Error;
use crate::metastate::Metastate;

/// The draft and its change-detection companions.
///
/// A draft always carries a benchmark (deep snapshot at
/// materialization) and the retained diff against it.
pub(crate) struct DraftState {
    /// The mutable working copy.
    pub value: Value,
    /// Snapshot of `value` at materialization time.
    pub benchmark: Value,
    /// Retained diff from the most recent mutation.
    pub changes: ChangeSet,
    /// The draft came from `default_draft()` (no confirmed state), so
    /// it counts as changed even while the diff is empty.
    pub from_default: bool,
}

impl DraftState {
    pub fn new(value: Value, from_default: bool) -> Self {
        Self {
            benchmark: value.clone(),
            value,
            changes: ChangeSet::default(),
            from_default,
        }
    }

    /// Recompute the retained diff; returns the `changed` flag value.
    pub fn recompute(&mut self) -> bool {
        self.changes = ChangeSet::diff(&self.benchmark, &self.value);
        self.changed()
    }

    pub fn changed(&self) -> bool {
        !self.changes.is_empty() || self.from_default
    }
}

/// All engine-owned views for one path.
pub(crate) struct PathEntry {
    pub state: Option<Arc<Value>>,
    pub draft: Option<DraftState>,
    pub meta: Metastate,
    pub rejections: Vec<String>,
    /// Last read/write/delete failure, keyed by intent when given,
    /// else by the operation kind.
    pub errors: HashMap<String, Error>,
    /// Monotonically increasing validation generation; a resolving
    /// async validation whose generation is stale is discarded.
    pub generation: u64,
    /// Broadcasts the highest settled generation for `validation()`
    /// waiters.
    settled_tx: watch::Sender<u64>,
    /// Cancels the in-progress async validation when superseded.
    pub cancel: CancellationToken,
}

impl PathEntry {
    pub fn new(readonly: bool) -> Self {
        let mut meta = Metastate::default();
        if readonly {
            meta.writable = false;
        }
        let (settled_tx, _) = watch::channel(0);
        Self {
            state: None,
            draft: None,
            meta,
            rejections: Vec::new(),
            errors: HashMap::new(),
            generation: 0,
            settled_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Start a new validation generation, superseding the previous
    /// one. Returns the generation number and its cancellation token.
    pub fn begin_validation(&mut self) -> (u64, CancellationToken) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.generation += 1;
        (self.generation, self.cancel.clone())
    }

    /// Mark a generation as settled (its async work finished or was
    /// discarded). Settlement only moves forward.
    pub fn settle(&self, generation: u64) {
        self.settled_tx.send_if_modified(|current| {
            if *current < generation {
                *current = generation;
                true
            } else {
                false
            }
        });
    }

    /// Subscribe to settlement progress.
    pub fn settled_rx(&self) -> watch::Receiver<u64> {
        self.settled_tx.subscribe()
    }

    /// Replace the rejection list and recompute validity.
    pub fn set_rejections(&mut self, rejections: Vec<String>) {
        self.rejections = rejections;
        self.meta.valid = self.rejections.is_empty();
    }

    /// Append rejections (async validator output) and recompute
    /// validity.
    pub fn append_rejections(&mut self, more: Vec<String>) {
        self.rejections.extend(more);
        self.meta.valid = self.rejections.is_empty();
    }

    pub fn record_error(&mut self, key: impl Into<String>, err: Error) {
        self.errors.insert(key.into(), err);
    }
}

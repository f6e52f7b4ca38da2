//! The path-addressable synchronization store.
//!
//! `OpenState` owns the router, the per-path entries, the event
//! listeners and the read coalescer, and orchestrates every operation
//! against them. It is cheap to clone (all clones share one engine)
//! and every method takes `&self`, so callers can drive reads, writes
//! and draft edits concurrently from any task.
//!
//! Locking discipline: per-path entries live in a [`DashMap`] and are
//! only ever locked for short, non-awaiting critical sections. User
//! code (handlers, validators, listeners) is always invoked with no
//! entry lock held.

mod coalesce;
mod entry;
mod read;
mod write;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::{EventKind, ListenerRegistry};
use crate::metastate::Metastate;
use crate::router::{Descriptor, PathParams, Router, DEADEND};

pub use coalesce::ReadStats;
pub use read::ReadOptions;

pub(crate) use coalesce::{ReadAttempt, ReadCoalescer};
pub(crate) use entry::{DraftState, PathEntry};

use crate::handler::PathContext;

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for an [`OpenState`] engine.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Broadcast capacity per coalesced read window. Waiters beyond
    /// this lag out and observe a dropped read.
    pub coalesce_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            coalesce_capacity: 16,
        }
    }
}

impl StoreConfig {
    pub fn with_coalesce_capacity(mut self, capacity: usize) -> Self {
        self.coalesce_capacity = capacity;
        self
    }
}

// ============================================================================
// Engine
// ============================================================================

pub(crate) struct Inner {
    pub(crate) router: RwLock<Router>,
    pub(crate) entries: DashMap<String, PathEntry>,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) reads: ReadCoalescer,
}

/// The synchronization engine. See the [module docs](self).
#[derive(Clone)]
pub struct OpenState {
    pub(crate) inner: Arc<Inner>,
}

impl Default for OpenState {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenState {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                router: RwLock::new(Router::new()),
                entries: DashMap::new(),
                listeners: ListenerRegistry::new(),
                reads: ReadCoalescer::new(config.coalesce_capacity),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Registration and routing
    // ------------------------------------------------------------------

    /// Register a resource handler under a path template. Fails with
    /// [`Error::Conflict`] when another descriptor already covers the
    /// same path shape.
    pub fn register(
        &self,
        name: impl Into<String>,
        template: &str,
        handler: Arc<dyn crate::handler::ResourceHandler>,
    ) -> Result<()> {
        self.router_write().register(name, template, handler)
    }

    /// Register a batch of descriptors, stopping at the first
    /// conflict.
    pub fn add_handlers(&self, descriptors: impl IntoIterator<Item = Descriptor>) -> Result<()> {
        let mut router = self.router_write();
        for descriptor in descriptors {
            router.insert(descriptor)?;
        }
        Ok(())
    }

    /// Resolve `path` against the registered patterns and make sure a
    /// per-path entry exists for it.
    pub(crate) fn touch(&self, path: &str) -> Result<(Descriptor, PathParams)> {
        let (descriptor, params) = self.router_read().resolve(path)?;
        let readonly = descriptor.handler.readonly();
        drop(
            self.inner
                .entries
                .entry(path.to_string())
                .or_insert_with(|| PathEntry::new(readonly)),
        );
        Ok((descriptor, params))
    }

    fn router_read(&self) -> RwLockReadGuard<'_, Router> {
        self.inner
            .router
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn router_write(&self) -> RwLockWriteGuard<'_, Router> {
        self.inner
            .router
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Subscribe to change notifications for one path.
    pub fn on(&self, path: &str, listener: impl Fn(EventKind) + Send + Sync + 'static) {
        let path = canonical(path);
        self.inner.listeners.subscribe(path, listener);
    }

    pub(crate) fn emit(&self, path: &str, kind: EventKind) {
        self.inner.listeners.emit(path, kind);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Current metastate for `path`. The deadend path reports the
    /// inert metastate; unregistered paths fail with
    /// [`Error::NotFound`].
    pub fn metastate(&self, path: &str) -> Result<Metastate> {
        let path = canonical(path);
        if path == DEADEND {
            return Ok(Metastate::inert());
        }
        self.touch(path)?;
        Ok(self
            .inner
            .entries
            .get(path)
            .map(|entry| entry.meta)
            .unwrap_or_default())
    }

    /// Confirmed state for `path`, if any has been committed.
    pub fn state(&self, path: &str) -> Option<Arc<Value>> {
        let path = canonical(path);
        if path == DEADEND {
            return Some(Arc::new(Value::Null));
        }
        self.inner
            .entries
            .get(path)
            .and_then(|entry| entry.state.clone())
    }

    /// Snapshot of the current draft value, if one is materialized.
    pub fn draft_value(&self, path: &str) -> Option<Value> {
        let path = canonical(path);
        if path == DEADEND {
            return Some(Value::Null);
        }
        self.inner
            .entries
            .get(path)
            .and_then(|entry| entry.draft.as_ref().map(|draft| draft.value.clone()))
    }

    /// Rejections produced by the most recent settled-or-running
    /// validation generation.
    pub fn rejections(&self, path: &str) -> Vec<String> {
        let path = canonical(path);
        self.inner
            .entries
            .get(path)
            .map(|entry| entry.rejections.clone())
            .unwrap_or_default()
    }

    /// The retained diff between benchmark and draft, if a draft
    /// exists.
    pub fn changes(&self, path: &str) -> Option<crate::change::ChangeSet> {
        let path = canonical(path);
        self.inner
            .entries
            .get(path)
            .and_then(|entry| entry.draft.as_ref().map(|draft| draft.changes.clone()))
    }

    /// The last recorded error for `path` under `key` (an intent name
    /// or one of `"read"` / `"write"` / `"delete"`).
    pub fn last_error(&self, path: &str, key: &str) -> Option<Error> {
        let path = canonical(path);
        self.inner
            .entries
            .get(path)
            .and_then(|entry| entry.errors.get(key).cloned())
    }

    /// Read-dedup statistics.
    pub fn read_stats(&self) -> ReadStats {
        self.inner.reads.stats()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Drop every view of `path`: state, draft, metastate,
    /// rejections, errors, listeners. In-flight async validation is
    /// cancelled and any coalesced read window is closed.
    pub fn purge(&self, path: &str) {
        let path = canonical(path);
        if let Some((_, entry)) = self.inner.entries.remove(path) {
            entry.cancel.cancel();
            debug!(path, "path purged");
        }
        self.inner.listeners.remove(path);
        self.inner.reads.cancel(path);
    }

    /// Discard the draft and benchmark so the next draft access
    /// rematerializes from current confirmed state. Clears `changed`
    /// and `failed`.
    pub fn reset_mutable(&self, path: &str) {
        let path = canonical(path);
        let existed = {
            match self.inner.entries.get_mut(path) {
                Some(mut entry) => {
                    entry.draft = None;
                    entry.meta.changed = false;
                    entry.meta.failed = false;
                    true
                }
                None => false,
            }
        };
        if existed {
            self.emit(path, EventKind::Mutable);
            self.emit(path, EventKind::Metastate);
        }
    }

    /// Transplant the confirmed state of `from` to `to`, then purge
    /// `from`. The value is committed under `to` without re-running
    /// `adapt` (it already ran when `from` was committed).
    pub fn move_path(&self, from: &str, to: &str) -> Result<()> {
        let from = canonical(from);
        let to = canonical(to);
        let (descriptor, _params) = self.touch(to)?;
        let state = self
            .inner
            .entries
            .get(from)
            .and_then(|entry| entry.state.clone())
            .ok_or_else(|| Error::NotFound {
                path: from.to_string(),
            })?;
        self.commit_state(to, &descriptor, (*state).clone(), true);
        self.purge(from);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internal plumbing shared by read / write / draft
    // ------------------------------------------------------------------

    /// Commit a backend value as the confirmed state for `path`.
    /// Runs `adapt` exactly once (unless the value was already
    /// adapted), flips `present`, clears `expired`, and kicks off a
    /// permission recompute when the handler defines one.
    pub(crate) fn commit_state(
        &self,
        path: &str,
        descriptor: &Descriptor,
        mut value: Value,
        pre_adapted: bool,
    ) -> Arc<Value> {
        if !pre_adapted {
            descriptor.handler.adapt(&mut value);
        }
        let state = Arc::new(value);
        {
            if let Some(mut entry) = self.inner.entries.get_mut(path) {
                entry.state = Some(state.clone());
                entry.meta.present = true;
                entry.meta.expired = false;
                if descriptor.handler.readonly() {
                    entry.meta.writable = false;
                }
            }
        }
        self.emit(path, EventKind::State);
        self.emit(path, EventKind::Metastate);
        if descriptor.handler.has_permissions() {
            self.spawn_permission_recompute(path, descriptor, state.clone());
        }
        state
    }

    /// Evaluate the handler's permission predicates against freshly
    /// committed state, off the caller's critical path.
    fn spawn_permission_recompute(&self, path: &str, descriptor: &Descriptor, state: Arc<Value>) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!(path, "no runtime available; skipping permission recompute");
                return;
            }
        };
        let engine = self.clone();
        let descriptor = descriptor.clone();
        let path = path.to_string();
        handle.spawn(async move {
            let readable = descriptor.handler.readable(&state).await;
            let writable = descriptor.handler.writable(&state).await;
            let mut dirty = false;
            {
                if let Some(mut entry) = engine.inner.entries.get_mut(&path) {
                    match readable {
                        Ok(Some(allowed)) => {
                            entry.meta.readable = allowed;
                            dirty = true;
                        }
                        Ok(None) => {}
                        Err(err) => warn!(path = %path, error = %err, "readable predicate failed"),
                    }
                    // A readonly descriptor stays unwritable no matter
                    // what the predicate says.
                    if !descriptor.handler.readonly() {
                        match writable {
                            Ok(Some(allowed)) => {
                                entry.meta.writable = allowed;
                                dirty = true;
                            }
                            Ok(None) => {}
                            Err(err) => warn!(path = %path, error = %err, "writable predicate failed"),
                        }
                    }
                }
            }
            if dirty {
                engine.emit(&path, EventKind::Metastate);
            }
        });
    }

    /// Materialize a draft for `path` if none exists: from the
    /// confirmed state via `to_draft`, else from `default_draft`.
    /// Materialization immediately runs validation so `valid`
    /// reflects the fresh draft.
    pub(crate) fn materialize_draft(&self, path: &str, descriptor: &Descriptor) -> Result<()> {
        // Source the draft outside the entry lock; to_draft and
        // default_draft are user code.
        let (writable, has_draft, state) = {
            match self.inner.entries.get(path) {
                Some(entry) => (entry.meta.writable, entry.draft.is_some(), entry.state.clone()),
                None => {
                    return Err(Error::NotFound {
                        path: path.to_string(),
                    })
                }
            }
        };
        // Writability gates even an already-materialized draft: a
        // permission predicate may have revoked access since.
        if !writable {
            return Err(Error::Permission {
                path: path.to_string(),
            });
        }
        if has_draft {
            return Ok(());
        }

        let (value, from_default) = match &state {
            Some(state) => (descriptor.handler.to_draft(state), false),
            None => (descriptor.handler.default_draft(), true),
        };

        let installed = {
            match self.inner.entries.get_mut(path) {
                Some(mut entry) => {
                    // Another task may have materialized concurrently.
                    if entry.draft.is_some() {
                        false
                    } else {
                        let draft = DraftState::new(value, from_default);
                        entry.meta.changed = draft.changed();
                        entry.draft = Some(draft);
                        true
                    }
                }
                None => false,
            }
        };

        if installed {
            self.emit(path, EventKind::Mutable);
            self.emit(path, EventKind::Metastate);
            self.revalidate(path, descriptor, None);
        }
        Ok(())
    }

    /// Build the context handlers receive alongside an operation.
    pub(crate) fn context(&self, path: &str) -> PathContext {
        match self.inner.entries.get(path) {
            Some(entry) => PathContext {
                path: path.to_string(),
                state: entry.state.clone(),
                metastate: entry.meta,
                draft: entry.draft.as_ref().map(|draft| draft.value.clone()),
            },
            None => PathContext {
                path: path.to_string(),
                state: None,
                metastate: Metastate::default(),
                draft: None,
            },
        }
    }

    pub(crate) fn record_error(&self, path: &str, key: &str, err: Error) {
        if let Some(mut entry) = self.inner.entries.get_mut(path) {
            entry.record_error(key, err);
        }
    }
}

/// The error-record key for an operation: the caller's intent when
/// given, else the operation kind.
pub(crate) fn error_key(intent: Option<&str>, operation: &str) -> String {
    intent.unwrap_or(operation).to_string()
}

/// Canonical entry key for a path: the leading slash is
/// insignificant, so `/posts/1` and `posts/1` address the same entry.
pub(crate) fn canonical(path: &str) -> &str {
    path.trim_start_matches('/')
}

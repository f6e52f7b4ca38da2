//! The read pipeline: coalescing, flag choreography, commit, merge
//! conflict detection, and draft forcing.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::router::{Descriptor, PathParams, DEADEND};
use crate::store::{canonical, error_key, OpenState, ReadAttempt};

/// Per-call read behavior.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Result intent, used as the error-record key on failure.
    pub intent: Option<String>,
    /// Commit fresh state even when the draft has unsaved changes,
    /// instead of failing with [`Error::MergeConflict`]. The stale
    /// draft is preserved either way.
    pub allow_merge_conflict: bool,
    /// Commit the fetched value as confirmed state. Turning this off
    /// returns the value without changing any view.
    pub remember_state: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            intent: None,
            allow_merge_conflict: false,
            remember_state: true,
        }
    }
}

impl ReadOptions {
    pub fn intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    pub fn allow_merge_conflict(mut self, allow: bool) -> Self {
        self.allow_merge_conflict = allow;
        self
    }

    pub fn remember_state(mut self, remember: bool) -> Self {
        self.remember_state = remember;
        self
    }
}

impl OpenState {
    /// Confirmed state for `path`, reading from the backend only when
    /// none is present yet.
    pub async fn get(&self, path: &str) -> Result<Arc<Value>> {
        let path = canonical(path);
        if path == DEADEND {
            return Ok(Arc::new(Value::Null));
        }
        if let Some(state) = self.state(path) {
            return Ok(state);
        }
        self.read(path).await
    }

    /// Read `path` from the backend with default options.
    pub async fn read(&self, path: &str) -> Result<Arc<Value>> {
        self.read_with(path, ReadOptions::default()).await
    }

    /// Read `path` from the backend.
    ///
    /// Concurrent reads of the same path are deduplicated: one
    /// backend call runs and its outcome (success or failure) is
    /// delivered to every caller. The first caller's options govern
    /// the shared read; joiners' options are ignored.
    pub async fn read_with(&self, path: &str, options: ReadOptions) -> Result<Arc<Value>> {
        let path = canonical(path);
        if path == DEADEND {
            return Ok(Arc::new(Value::Null));
        }
        let (descriptor, params) = self.touch(path)?;

        match self.inner.reads.register(path) {
            ReadAttempt::Joined(mut rx) => match rx.recv().await {
                Ok(outcome) => outcome,
                // Window closed without an outcome (purge) or the
                // waiter lagged out of the broadcast buffer.
                Err(_) => Err(Error::ReadDropped {
                    path: path.to_string(),
                }),
            },
            ReadAttempt::New => {
                // If this future is dropped mid-read, the guard closes
                // the window so later readers are not trapped waiting.
                let mut guard = WindowGuard {
                    engine: Some(self.clone()),
                    path: path.to_string(),
                };
                let outcome = self.perform_read(path, &descriptor, &params, &options).await;
                guard.engine = None;
                self.inner.reads.complete(path, outcome.clone());
                outcome
            }
        }
    }

    async fn perform_read(
        &self,
        path: &str,
        descriptor: &Descriptor,
        params: &PathParams,
        options: &ReadOptions,
    ) -> Result<Arc<Value>> {
        // Mark the window: reading, and existing state is suspect
        // until the fresh value lands.
        {
            if let Some(mut entry) = self.inner.entries.get_mut(path) {
                entry.meta.reading = true;
                entry.meta.expired = true;
            }
        }
        self.emit(path, EventKind::Metastate);

        let ctx = self.context(path);
        let fetched = descriptor.handler.read(&ctx, params).await;
        let outcome = self.finish_read(path, descriptor, options, fetched);

        {
            if let Some(mut entry) = self.inner.entries.get_mut(path) {
                entry.meta.reading = false;
            }
        }
        self.emit(path, EventKind::Metastate);
        outcome
    }

    fn finish_read(
        &self,
        path: &str,
        descriptor: &Descriptor,
        options: &ReadOptions,
        fetched: Result<Option<Value>>,
    ) -> Result<Arc<Value>> {
        let key = error_key(options.intent.as_deref(), "read");

        let value = match fetched {
            Ok(Some(value)) => value,
            Ok(None) => {
                let err = Error::NotFound {
                    path: path.to_string(),
                };
                self.record_error(path, &key, err.clone());
                return Err(err);
            }
            Err(err) => {
                self.record_error(path, &key, err.clone());
                return Err(err);
            }
        };

        if !options.remember_state {
            debug!(path, "read complete, state not retained");
            return Ok(Arc::new(value));
        }

        let conflicted = self
            .inner
            .entries
            .get(path)
            .map(|entry| entry.meta.changed)
            .unwrap_or(false);

        // Fresh state is committed before the conflict is raised, so
        // callers that catch the error still observe current state
        // next to their stale draft.
        let state = self.commit_state(path, descriptor, value, false);

        if conflicted && !options.allow_merge_conflict {
            let err = Error::MergeConflict {
                path: path.to_string(),
            };
            self.record_error(path, &key, err.clone());
            return Err(err);
        }

        // A writable path always carries a draft once state exists.
        let writable = self
            .inner
            .entries
            .get(path)
            .map(|entry| entry.meta.writable)
            .unwrap_or(false);
        if writable {
            self.materialize_draft(path, descriptor)?;
        }

        Ok(state)
    }
}

/// Closes a coalescing window if the initiating read is dropped
/// before it completes, waking joined readers with a recv error.
struct WindowGuard {
    engine: Option<OpenState>,
    path: String,
}

impl Drop for WindowGuard {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.inner.reads.cancel(&self.path);
        }
    }
}

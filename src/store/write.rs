//! The write and delete pipelines.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::router::{Descriptor, PathParams, DEADEND};
use crate::store::{canonical, error_key, OpenState, ReadOptions};
use crate::validation::ValidationOutcome;

impl OpenState {
    /// Persist the draft for `path`.
    ///
    /// The draft is validated in full first (sync and async); any
    /// rejection aborts with [`Error::Validation`] and sets the
    /// `failed` flag. Otherwise the input runs through `prep_input`
    /// and dispatches to the handler's `update` when confirmed state
    /// is present, else `create`. A handler returning a value commits
    /// it directly; returning `None` triggers a fresh read.
    ///
    /// Concurrent writes to one path are not serialized; callers
    /// that overlap them get whatever the backend makes of the
    /// interleaving.
    pub async fn write(&self, path: &str) -> Result<Arc<Value>> {
        self.write_with(path, None).await
    }

    /// [`write`](Self::write) with an explicit intent, which selects
    /// the validator branch and keys the error record.
    pub async fn write_with(&self, path: &str, intent: Option<&str>) -> Result<Arc<Value>> {
        let path = canonical(path);
        if path == DEADEND {
            return Err(Error::Permission {
                path: path.to_string(),
            });
        }
        let (descriptor, params) = self.touch(path)?;
        // Permission errors surface before the writing flag flips.
        self.materialize_draft(path, &descriptor)?;

        {
            if let Some(mut entry) = self.inner.entries.get_mut(path) {
                entry.meta.writing = true;
            }
        }
        self.emit(path, EventKind::Metastate);

        let result = self.perform_write(path, &descriptor, &params, intent).await;

        {
            if let Some(mut entry) = self.inner.entries.get_mut(path) {
                entry.meta.writing = false;
                if let Err(err) = &result {
                    entry.meta.failed = true;
                    entry.record_error(error_key(intent, "write"), err.clone());
                }
            }
        }
        self.emit(path, EventKind::Metastate);
        result
    }

    async fn perform_write(
        &self,
        path: &str,
        descriptor: &Descriptor,
        params: &PathParams,
        intent: Option<&str>,
    ) -> Result<Arc<Value>> {
        // Validation and the draft snapshot must agree on one
        // generation: a draft edit landing while the async validator
        // is awaited supersedes the pass, and dispatching that newer
        // draft would skip its rejections. Re-run until the generation
        // validated is the generation snapshotted.
        let (draft, changes, has_state) = loop {
            let (generation, rejections) = match self.validate_now(path, descriptor, intent).await
            {
                ValidationOutcome::NoDraft => {
                    return Err(Error::NotFound {
                        path: path.to_string(),
                    })
                }
                ValidationOutcome::Superseded => continue,
                ValidationOutcome::Settled {
                    generation,
                    rejections,
                } => (generation, rejections),
            };
            if !rejections.is_empty() {
                return Err(Error::Validation {
                    path: path.to_string(),
                    rejections,
                });
            }
            let snapshot = self.inner.entries.get(path).and_then(|entry| {
                if entry.generation != generation {
                    return None;
                }
                entry.draft.as_ref().map(|draft| {
                    (
                        draft.value.clone(),
                        draft.changes.clone(),
                        entry.state.is_some(),
                    )
                })
            });
            match snapshot {
                Some(snapshot) => break snapshot,
                // Superseded between settling and snapshotting.
                None => continue,
            }
        };
        let input = descriptor.handler.prep_input(&draft);

        let ctx = self.context(path);
        let returned = if has_state {
            descriptor.handler.update(&ctx, params, input, &changes).await?
        } else {
            descriptor.handler.create(&ctx, input).await?
        };

        // The draft is spent: drop it so the next access
        // rematerializes from the fresh state.
        {
            if let Some(mut entry) = self.inner.entries.get_mut(path) {
                entry.draft = None;
                entry.meta.changed = false;
            }
        }
        self.emit(path, EventKind::Mutable);

        match returned {
            Some(value) => Ok(self.commit_state(path, descriptor, value, false)),
            None => {
                debug!(path, "write returned no value, issuing fresh read");
                self.read_with(path, ReadOptions::default()).await
            }
        }
    }

    /// Delete the resource at `path`. On success every view of the
    /// path is purged; on failure the views survive and the error is
    /// recorded.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.delete_with(path, None).await
    }

    /// [`delete`](Self::delete) with an explicit intent keying the
    /// error record.
    pub async fn delete_with(&self, path: &str, intent: Option<&str>) -> Result<()> {
        let path = canonical(path);
        if path == DEADEND {
            return Err(Error::Permission {
                path: path.to_string(),
            });
        }
        let (descriptor, params) = self.touch(path)?;

        {
            if let Some(mut entry) = self.inner.entries.get_mut(path) {
                entry.meta.writing = true;
            }
        }
        self.emit(path, EventKind::Metastate);

        let ctx = self.context(path);
        match descriptor.handler.delete(&ctx, &params).await {
            Ok(()) => {
                self.purge(path);
                Ok(())
            }
            Err(err) => {
                {
                    if let Some(mut entry) = self.inner.entries.get_mut(path) {
                        entry.meta.writing = false;
                        entry.meta.failed = true;
                        entry.record_error(error_key(intent, "delete"), err.clone());
                    }
                }
                self.emit(path, EventKind::Metastate);
                Err(err)
            }
        }
    }
}

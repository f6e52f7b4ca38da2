//! Draft validation with supersession.
//!
//! Every mutation (and every draft materialization) starts a new
//! validation generation: the synchronous validator's rejections
//! replace the current list immediately, and the asynchronous
//! validator's rejections are appended later only if the generation
//! is still current. An overlapping newer mutation cancels the older
//! run's token and outranks it by generation number, so a slow async
//! validator can never clobber the rejections of a newer draft.
//!
//! `validation(path)` hands out a [`ValidationHandle`] that resolves
//! once the generation current at call time has settled (its async
//! work finished, was discarded, or the path was purged).

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::events::EventKind;
use crate::router::Descriptor;
use crate::store::{canonical, OpenState};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// One validation generation's inputs, snapshotted at start so the
/// validators run without any entry lock held.
pub(crate) struct ValidationRun {
    pub generation: u64,
    pub token: CancellationToken,
    pub draft: Value,
    pub intent: String,
}

/// Outcome of an inline full validation pass.
pub(crate) enum ValidationOutcome {
    /// No draft is materialized for the path.
    NoDraft,
    /// A newer mutation took over the entry while the pass ran; the
    /// entry's rejections and draft belong to that newer generation.
    Superseded,
    /// The pass finished while still current.
    Settled {
        generation: u64,
        rejections: Vec<String>,
    },
}

/// Awaitable settlement of the validation generation that was
/// current when the handle was created.
pub struct ValidationHandle {
    rx: watch::Receiver<u64>,
    target: u64,
}

impl ValidationHandle {
    pub(crate) fn new(rx: watch::Receiver<u64>, target: u64) -> Self {
        Self { rx, target }
    }

    /// A handle that is already settled (no draft, or path unknown).
    pub(crate) fn ready() -> Self {
        let (tx, rx) = watch::channel(0);
        drop(tx);
        Self { rx, target: 0 }
    }

    /// Wait until the target generation has settled. Resolves
    /// immediately when it already has, and when the path is purged
    /// while waiting.
    pub async fn settled(mut self) {
        loop {
            if *self.rx.borrow() >= self.target {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender dropped: path purged.
                return;
            }
        }
    }
}

impl OpenState {
    /// Handle for awaiting settlement of the currently pending
    /// validation for `path`.
    pub fn validation(&self, path: &str) -> ValidationHandle {
        let path = canonical(path);
        match self.inner.entries.get(path) {
            Some(entry) => ValidationHandle::new(entry.settled_rx(), entry.generation),
            None => ValidationHandle::ready(),
        }
    }

    /// Start a fresh validation generation for `path`'s draft.
    /// Returns `None` when no draft is materialized.
    pub(crate) fn begin_validation_run(
        &self,
        path: &str,
        intent: Option<&str>,
    ) -> Option<ValidationRun> {
        let mut entry = self.inner.entries.get_mut(path)?;
        let draft = entry.draft.as_ref()?.value.clone();
        let intent = intent
            .unwrap_or(if entry.state.is_some() {
                "update"
            } else {
                "create"
            })
            .to_string();
        let (generation, token) = entry.begin_validation();
        Some(ValidationRun {
            generation,
            token,
            draft,
            intent,
        })
    }

    /// Run the synchronous validator and install its rejections if
    /// the run is still current. Settles the generation when the
    /// handler has no async validator.
    pub(crate) fn apply_sync_validation(
        &self,
        path: &str,
        descriptor: &Descriptor,
        run: &ValidationRun,
    ) {
        let mut rejections = Vec::new();
        descriptor
            .handler
            .validate(&run.draft, &mut rejections, &run.intent);

        let mut dirty = false;
        {
            if let Some(mut entry) = self.inner.entries.get_mut(path) {
                if entry.generation == run.generation {
                    entry.set_rejections(rejections);
                    dirty = true;
                } else {
                    debug!(
                        path,
                        generation = run.generation,
                        current = entry.generation,
                        "discarding superseded sync validation"
                    );
                }
                if !descriptor.handler.has_async_validation() {
                    entry.settle(run.generation);
                }
            }
        }
        if dirty {
            self.emit(path, EventKind::Metastate);
        }
    }

    /// Run the async validator to completion (or cancellation) and
    /// append its rejections if the generation is still current.
    /// Always settles the generation.
    pub(crate) async fn run_async_validation(
        &self,
        path: &str,
        descriptor: &Descriptor,
        run: ValidationRun,
    ) {
        let outcome = tokio::select! {
            _ = run.token.cancelled() => None,
            result = descriptor.handler.validate_async(&run.draft, &run.intent) => Some(result),
        };

        let mut dirty = false;
        match outcome {
            None => {
                debug!(path, generation = run.generation, "async validation cancelled");
            }
            Some(Err(err)) => {
                warn!(path, error = %err, "async validator failed");
            }
            Some(Ok(rejections)) => {
                if let Some(mut entry) = self.inner.entries.get_mut(path) {
                    if entry.generation == run.generation {
                        entry.append_rejections(rejections);
                        dirty = true;
                    } else {
                        debug!(
                            path,
                            discarded = rejections.len(),
                            "discarding outdated async rejections"
                        );
                    }
                }
            }
        }
        if let Some(entry) = self.inner.entries.get(path) {
            entry.settle(run.generation);
        }
        if dirty {
            self.emit(path, EventKind::Metastate);
        }
    }

    /// Fire-and-forget validation of the current draft: sync part
    /// inline, async part on a spawned task. Used by draft
    /// materialization and mutation.
    pub(crate) fn revalidate(&self, path: &str, descriptor: &Descriptor, intent: Option<&str>) {
        let Some(run) = self.begin_validation_run(path, intent) else {
            return;
        };
        self.apply_sync_validation(path, descriptor, &run);
        if !descriptor.handler.has_async_validation() {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!(path, "no runtime available; async validation skipped");
                if let Some(entry) = self.inner.entries.get(path) {
                    entry.settle(run.generation);
                }
                return;
            }
        };
        let engine = self.clone();
        let descriptor = descriptor.clone();
        let path = path.to_string();
        handle.spawn(async move {
            engine.run_async_validation(&path, &descriptor, run).await;
        });
    }

    /// Full validation pass awaited inline, as a write does before
    /// dispatching. Reports whether the pass was still current when it
    /// finished; a caller that needs the validated draft must re-run
    /// on [`ValidationOutcome::Superseded`] rather than trust the
    /// entry's live rejection list, which a newer mutation now owns.
    pub(crate) async fn validate_now(
        &self,
        path: &str,
        descriptor: &Descriptor,
        intent: Option<&str>,
    ) -> ValidationOutcome {
        let Some(run) = self.begin_validation_run(path, intent) else {
            return ValidationOutcome::NoDraft;
        };
        let generation = run.generation;
        self.apply_sync_validation(path, descriptor, &run);
        if descriptor.handler.has_async_validation() {
            self.run_async_validation(path, descriptor, run).await;
        }
        match self.inner.entries.get(path) {
            Some(entry) if entry.generation == generation => ValidationOutcome::Settled {
                generation,
                rejections: entry.rejections.clone(),
            },
            _ => ValidationOutcome::Superseded,
        }
    }
}

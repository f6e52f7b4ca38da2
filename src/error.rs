//! Error taxonomy for the OpenState engine.
//!
//! Every primary operation (`read`, `write`, `delete`, draft access)
//! propagates failures to the caller through this enum. The only
//! failures that are logged and suppressed instead are permission
//! predicates and listener callbacks, which must never block state
//! propagation.
//!
//! `Error` is `Clone` so that one failure can be delivered to every
//! waiter of a deduplicated read and retained in the per-path error
//! record at the same time. Backend errors are wrapped in an `Arc` for
//! that reason.

use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the OpenState engine.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// No registered descriptor matches the path, or a backend read
    /// returned nothing for it.
    #[error("nothing found for path '{path}'")]
    NotFound { path: String },

    /// A handler registration collided with an equivalent pattern.
    #[error("cannot register '{name}' ({pattern}); pattern already reserved by '{existing}'")]
    Conflict {
        name: String,
        pattern: String,
        existing: String,
    },

    /// A draft was requested for a path that is not writable.
    #[error("path '{path}' is not writable")]
    Permission { path: String },

    /// A value assigned to a draft is not representable in the
    /// canonical serializable form.
    #[error("value for '{key_path}' is not serializable: {reason}")]
    Serialization { key_path: String, reason: String },

    /// A write was refused because validation rejections are
    /// outstanding.
    #[error("write refused for '{path}'; {} outstanding rejection(s)", rejections.len())]
    Validation {
        path: String,
        rejections: Vec<String>,
    },

    /// A completed read would replace confirmed state while the draft
    /// holds unsaved changes.
    #[error("merge conflict for '{path}'; confirmed state updated while draft has unsaved changes")]
    MergeConflict { path: String },

    /// The descriptor does not implement the requested operation.
    #[error("a {operation}() method has not been defined for this resource type")]
    NotImplemented { operation: &'static str },

    /// A backend callable failed.
    #[error("backend operation failed: {0}")]
    Backend(Arc<anyhow::Error>),

    /// The in-flight read serving this caller was dropped before it
    /// produced a result (for example because the path was purged).
    #[error("in-flight read for '{path}' was dropped")]
    ReadDropped { path: String },
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Backend(Arc::new(err))
    }
}

impl Error {
    /// True if this is a merge-conflict failure.
    pub fn is_merge_conflict(&self) -> bool {
        matches!(self, Error::MergeConflict { .. })
    }

    /// True if this is a validation refusal.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }
}

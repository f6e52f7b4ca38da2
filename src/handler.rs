//! Resource descriptor trait and the context handed to backend calls.
//!
//! A `ResourceHandler` binds a path pattern to its persistence
//! callables (read/create/update/delete), draft shaping hooks, and
//! validators. The engine owns all per-path bookkeeping; handlers are
//! collaborators that see only a read-only, path-scoped snapshot of
//! the engine's views.
//!
//! Every method has a default: operations a resource type does not
//! support fail at call time with `NotImplemented` rather than at
//! registration, so readonly descriptors only define `read`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::change::ChangeSet;
use crate::error::{Error, Result};
use crate::metastate::Metastate;
use crate::router::PathParams;

/// Read-only, path-scoped snapshot passed to every backend callable.
///
/// Holds the engine's current views for the one path the call is
/// about; there is no ambient access to other paths or global state.
#[derive(Debug, Clone)]
pub struct PathContext {
    /// The full path the operation addresses.
    pub path: String,
    /// Confirmed state, if any.
    pub state: Option<Arc<Value>>,
    /// Status flags at the time the call was dispatched.
    pub metastate: Metastate,
    /// The draft value, if one is materialized.
    pub draft: Option<Value>,
}

/// Backend binding for one resource type.
///
/// Async callables return `anyhow`-compatible errors through
/// [`Error::Backend`]; implementations can use `?` on any error type.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Readonly descriptors never materialize drafts and refuse writes.
    fn readonly(&self) -> bool {
        false
    }

    /// Fetch the resource. `Ok(None)` means not found.
    async fn read(&self, _ctx: &PathContext, _params: &PathParams) -> Result<Option<Value>> {
        Err(Error::NotImplemented { operation: "read" })
    }

    /// Persist a new resource. Returning `Ok(None)` makes the engine
    /// issue a fresh read instead of committing a value directly.
    async fn create(&self, _ctx: &PathContext, _input: Value) -> Result<Option<Value>> {
        Err(Error::NotImplemented { operation: "create" })
    }

    /// Persist changes to an existing resource. `changes` is the
    /// retained draft-vs-benchmark diff so the implementation can send
    /// a minimal payload.
    async fn update(
        &self,
        _ctx: &PathContext,
        _params: &PathParams,
        _input: Value,
        _changes: &ChangeSet,
    ) -> Result<Option<Value>> {
        Err(Error::NotImplemented { operation: "update" })
    }

    /// Remove the resource from the backend.
    async fn delete(&self, _ctx: &PathContext, _params: &PathParams) -> Result<()> {
        Err(Error::NotImplemented { operation: "delete" })
    }

    /// Starting draft for a path with no confirmed state.
    fn default_draft(&self) -> Value {
        Value::Object(Map::new())
    }

    /// Derive an editable draft from confirmed state.
    fn to_draft(&self, state: &Value) -> Value {
        state.clone()
    }

    /// Shape the draft into the backend's input format.
    fn prep_input(&self, draft: &Value) -> Value {
        draft.clone()
    }

    /// One-time adjustment applied to a value before it is committed
    /// as confirmed state.
    fn adapt(&self, _resource: &mut Value) {}

    /// Synchronous validator; push failure messages onto `rejections`.
    fn validate(&self, _draft: &Value, _rejections: &mut Vec<String>, _intent: &str) {}

    /// Declares the asynchronous validator. When false,
    /// `validate_async` is never invoked.
    fn has_async_validation(&self) -> bool {
        false
    }

    /// Asynchronous validator; returned messages are appended to the
    /// rejection list unless a newer validation run has started.
    async fn validate_async(&self, _draft: &Value, _intent: &str) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Declares the permission predicates. When false, `readable` and
    /// `writable` are never invoked.
    fn has_permissions(&self) -> bool {
        false
    }

    /// Recompute the readable flag after a state commit. `Ok(None)`
    /// leaves the flag unchanged. Failures are logged, not propagated.
    async fn readable(&self, _state: &Value) -> anyhow::Result<Option<bool>> {
        Ok(None)
    }

    /// Recompute the writable flag after a state commit. `Ok(None)`
    /// leaves the flag unchanged. Failures are logged, not propagated.
    async fn writable(&self, _state: &Value) -> anyhow::Result<Option<bool>> {
        Ok(None)
    }
}

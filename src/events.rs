//! Per-path change events and the listener registry.
//!
//! Subscriptions are per path only; there is no wildcard or global
//! subscription. Listener callbacks run synchronously at emission in
//! registration order. A panicking listener is caught and logged so it
//! cannot block state propagation to later listeners or to the engine
//! itself.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::error;

/// What changed for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Confirmed state was replaced.
    State,
    /// The draft was mutated, materialized, or discarded.
    Mutable,
    /// One or more status flags changed.
    Metastate,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::State => write!(f, "state"),
            EventKind::Mutable => write!(f, "mutable"),
            EventKind::Metastate => write!(f, "metastate"),
        }
    }
}

type Listener = Arc<dyn Fn(EventKind) + Send + Sync>;

/// Path-keyed listener table.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<String, Vec<Listener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback for one path.
    pub fn subscribe(&self, path: &str, callback: impl Fn(EventKind) + Send + Sync + 'static) {
        self.listeners
            .entry(path.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Invoke every callback registered for the path, in order.
    ///
    /// Callbacks are cloned out of the table before invocation so a
    /// listener can re-enter the engine (and this registry) safely.
    pub fn emit(&self, path: &str, kind: EventKind) {
        let callbacks: Vec<Listener> = match self.listeners.get(path) {
            Some(entry) => entry.clone(),
            None => return,
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(kind))).is_err() {
                error!(path = %path, event = %kind, "Listener panicked; continuing");
            }
        }
    }

    /// Drop all callbacks for the path.
    pub fn remove(&self, path: &str) {
        self.listeners.remove(path);
    }

    /// Number of callbacks registered for the path.
    pub fn count(&self, path: &str) -> usize {
        self.listeners.get(path).map(|e| e.len()).unwrap_or(0)
    }
}

//! Derived per-path status flags.
//!
//! Every path has one `Metastate` record, created lazily with default
//! values and updated by the orchestrator as operations progress. UI
//! code renders from these flags instead of inspecting engine
//! internals.
//!
//! Two flags are derived rather than stored so their invariants hold
//! structurally: `current() == present && !expired` and
//! `invalid() == !valid`.

/// Per-path status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metastate {
    /// Confirmed state exists for this path.
    pub present: bool,
    /// The draft differs from its benchmark (or was created with no
    /// confirmed state to compare against).
    pub changed: bool,
    /// A backend read is in flight.
    pub reading: bool,
    /// A backend write or delete is in flight.
    pub writing: bool,
    /// The last write or delete failed; sticky until `reset_mutable`.
    pub failed: bool,
    /// Permission predicate allows reading.
    pub readable: bool,
    /// Permission predicate allows writing; forced false for readonly
    /// descriptors.
    pub writable: bool,
    /// Reserved for cache-layer integration; never set by the engine.
    pub cached: bool,
    /// Confirmed state is stale (a refresh is in flight or was
    /// requested).
    pub expired: bool,
    /// The last validation run produced no rejections. False until the
    /// first run.
    pub valid: bool,
}

impl Default for Metastate {
    fn default() -> Self {
        Self {
            present: false,
            changed: false,
            reading: false,
            writing: false,
            failed: false,
            readable: true,
            writable: true,
            cached: false,
            expired: false,
            valid: false,
        }
    }
}

impl Metastate {
    /// Confirmed state exists and is not stale.
    pub fn current(&self) -> bool {
        self.present && !self.expired
    }

    /// Inverse of `valid`.
    pub fn invalid(&self) -> bool {
        !self.valid
    }

    /// The inert record carried by the deadend sentinel path: never
    /// writable, nothing pending, nothing rejected.
    pub fn inert() -> Self {
        Self {
            writable: false,
            valid: true,
            ..Self::default()
        }
    }
}

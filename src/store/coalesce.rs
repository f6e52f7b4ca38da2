//! Read deduplication.
//!
//! Concurrent reads of the same path are coalesced: the first caller
//! performs the backend read, everyone else subscribes to a broadcast
//! channel and receives the same outcome (success or failure) without
//! a second backend call. The in-flight window closes when the
//! initiating read completes or the path is purged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::Error;

/// Outcome delivered to every waiter of a coalesced read.
pub(crate) type ReadOutcome = Result<Arc<Value>, Error>;

/// Result of registering interest in a read.
pub(crate) enum ReadAttempt {
    /// No read is in flight; the caller must perform it and call
    /// `complete` (or `cancel`) to close the window.
    New,
    /// A read is already in flight; await the receiver instead.
    Joined(broadcast::Receiver<ReadOutcome>),
}

/// Statistics counters for read deduplication.
#[derive(Debug, Clone, Default)]
pub struct ReadStats {
    /// Total read registrations.
    pub total: u64,
    /// Registrations that initiated a backend read.
    pub initiated: u64,
    /// Registrations served by an already in-flight read.
    pub joined: u64,
}

pub(crate) struct ReadCoalescer {
    in_flight: DashMap<String, broadcast::Sender<ReadOutcome>>,
    capacity: usize,
    total: AtomicU64,
    initiated: AtomicU64,
    joined: AtomicU64,
}

impl ReadCoalescer {
    pub fn new(capacity: usize) -> Self {
        Self {
            in_flight: DashMap::new(),
            capacity,
            total: AtomicU64::new(0),
            initiated: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Register interest in reading `path`.
    pub fn register(&self, path: &str) -> ReadAttempt {
        self.total.fetch_add(1, Ordering::Relaxed);

        match self.in_flight.entry(path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                self.joined.fetch_add(1, Ordering::Relaxed);
                debug!(path, "joining in-flight read");
                ReadAttempt::Joined(occupied.get().subscribe())
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                self.initiated.fetch_add(1, Ordering::Relaxed);
                let (tx, _) = broadcast::channel(self.capacity);
                vacant.insert(tx);
                ReadAttempt::New
            }
        }
    }

    /// Deliver the outcome to all waiters and close the window.
    pub fn complete(&self, path: &str, outcome: ReadOutcome) {
        if let Some((_, tx)) = self.in_flight.remove(path) {
            // Send fails when no waiter joined; that is the common
            // single-reader case.
            let delivered = tx.send(outcome).unwrap_or(0);
            if delivered > 0 {
                debug!(path, waiters = delivered, "coalesced read delivered");
            }
        }
    }

    /// Drop the in-flight window without delivering an outcome.
    /// Waiters observe a closed channel.
    pub fn cancel(&self, path: &str) {
        if self.in_flight.remove(path).is_some() {
            debug!(path, "in-flight read cancelled");
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> ReadStats {
        ReadStats {
            total: self.total.load(Ordering::Relaxed),
            initiated: self.initiated.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
        }
    }
}

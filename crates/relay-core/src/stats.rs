//! Relay counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by all pipelines of a relay.
#[derive(Debug, Default)]
pub struct RelayStats {
    published: AtomicU64,
    received: AtomicU64,
    persisted: AtomicU64,
    broadcast: AtomicU64,
    dropped: AtomicU64,
    duplicates: AtomicU64,
}

impl RelayStats {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_broadcast(&self) {
        self.broadcast.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            broadcast: self.broadcast.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Messages accepted by the bus from the publish API.
    pub published: u64,
    /// Payloads delivered to a pipeline.
    pub received: u64,
    /// Successful store writes.
    pub persisted: u64,
    /// Successful broadcasts.
    pub broadcast: u64,
    /// Payloads dropped on a decode, store or broadcast failure.
    pub dropped: u64,
    /// Redelivered tasks ignored while the original was still in flight.
    pub duplicates: u64,
}

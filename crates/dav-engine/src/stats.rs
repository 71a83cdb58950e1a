//! Engine activity counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for lock and transfer activity.
///
/// Thread-safe counters using atomic operations for lock-free updates.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Locks granted
    pub locks_granted: AtomicU64,

    /// Lock requests refused with a conflict
    pub lock_conflicts: AtomicU64,

    /// Successful lock refreshes
    pub locks_refreshed: AtomicU64,

    /// Locks removed by UNLOCK or resource deletion
    pub locks_released: AtomicU64,

    /// Locks purged after their deadline passed
    pub locks_expired: AtomicU64,

    /// Mutations refused because a lock token was missing
    pub mutations_denied: AtomicU64,

    /// MOVE/COPY invocations
    pub transfers: AtomicU64,

    /// Entries created at a destination
    pub entries_created: AtomicU64,

    /// Entries overwritten at a destination
    pub entries_overwritten: AtomicU64,

    /// Entries that ended in OverwriteFailed or CleanupFailed
    pub partial_failures: AtomicU64,

    /// Content bytes written to destinations
    pub bytes_transferred: AtomicU64,
}

impl EngineStats {
    /// Create new empty counters
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_lock_granted(&self) {
        self.locks_granted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_lock_conflict(&self) {
        self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_lock_refreshed(&self, count: usize) {
        self.locks_refreshed.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_locks_released(&self, count: usize) {
        self.locks_released.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_locks_expired(&self, count: usize) {
        self.locks_expired.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_mutation_denied(&self) {
        self.mutations_denied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_transfer(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_created(&self) {
        self.entries_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_overwritten(&self) {
        self.entries_overwritten.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_partial_failure(&self) {
        self.partial_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_bytes(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get current snapshot of the counters
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            locks_granted: self.locks_granted.load(Ordering::Relaxed),
            lock_conflicts: self.lock_conflicts.load(Ordering::Relaxed),
            locks_refreshed: self.locks_refreshed.load(Ordering::Relaxed),
            locks_released: self.locks_released.load(Ordering::Relaxed),
            locks_expired: self.locks_expired.load(Ordering::Relaxed),
            mutations_denied: self.mutations_denied.load(Ordering::Relaxed),
            transfers: self.transfers.load(Ordering::Relaxed),
            entries_created: self.entries_created.load(Ordering::Relaxed),
            entries_overwritten: self.entries_overwritten.load(Ordering::Relaxed),
            partial_failures: self.partial_failures.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`EngineStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct EngineStatsSnapshot {
    pub locks_granted: u64,
    pub lock_conflicts: u64,
    pub locks_refreshed: u64,
    pub locks_released: u64,
    pub locks_expired: u64,
    pub mutations_denied: u64,
    pub transfers: u64,
    pub entries_created: u64,
    pub entries_overwritten: u64,
    pub partial_failures: u64,
    pub bytes_transferred: u64,
}

impl EngineStatsSnapshot {
    /// Locks currently believed active (granted minus released and expired).
    pub fn locks_outstanding(&self) -> u64 {
        self.locks_granted
            .saturating_sub(self.locks_released + self.locks_expired)
    }
}

//! Internal metrics: lock-free counters and gauges, snapshotted on demand.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters and gauges tracked by a node.
#[derive(Debug, Default)]
pub struct RaftMetrics {
    elections_started: AtomicU64,
    leadership_changes: AtomicU64,
    entries_appended: AtomicU64,
    entries_applied: AtomicU64,
    snapshots_captured: AtomicU64,
    snapshots_installed: AtomicU64,
    snapshot_chunks_sent: AtomicU64,
    snapshot_chunks_resent: AtomicU64,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
}

/// Point-in-time copy of [`RaftMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub elections_started: u64,
    pub leadership_changes: u64,
    pub entries_appended: u64,
    pub entries_applied: u64,
    pub snapshots_captured: u64,
    pub snapshots_installed: u64,
    pub snapshot_chunks_sent: u64,
    pub snapshot_chunks_resent: u64,
    pub commit_index: u64,
    pub last_applied: u64,
}

impl RaftMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_elections_started(&self) {
        self.elections_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_leadership_changes(&self) {
        self.leadership_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_entries_appended(&self, count: u64) {
        self.entries_appended.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_entries_applied(&self, count: u64) {
        self.entries_applied.fetch_add(count, Ordering::Relaxed);
    }

    pub fn incr_snapshots_captured(&self) {
        self.snapshots_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_snapshots_installed(&self) {
        self.snapshots_installed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_snapshot_chunks_sent(&self) {
        self.snapshot_chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_snapshot_chunks_resent(&self) {
        self.snapshot_chunks_resent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_commit_index(&self, value: u64) {
        self.commit_index.store(value, Ordering::Relaxed);
    }

    pub fn set_last_applied(&self, value: u64) {
        self.last_applied.store(value, Ordering::Relaxed);
    }

    /// Copy out all values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            elections_started: self.elections_started.load(Ordering::Relaxed),
            leadership_changes: self.leadership_changes.load(Ordering::Relaxed),
            entries_appended: self.entries_appended.load(Ordering::Relaxed),
            entries_applied: self.entries_applied.load(Ordering::Relaxed),
            snapshots_captured: self.snapshots_captured.load(Ordering::Relaxed),
            snapshots_installed: self.snapshots_installed.load(Ordering::Relaxed),
            snapshot_chunks_sent: self.snapshot_chunks_sent.load(Ordering::Relaxed),
            snapshot_chunks_resent: self.snapshot_chunks_resent.load(Ordering::Relaxed),
            commit_index: self.commit_index.load(Ordering::Relaxed),
            last_applied: self.last_applied.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = RaftMetrics::new();
        metrics.incr_elections_started();
        metrics.incr_elections_started();
        metrics.add_entries_appended(5);
        metrics.set_commit_index(9);

        let snap = metrics.snapshot();
        assert_eq!(snap.elections_started, 2);
        assert_eq!(snap.entries_appended, 5);
        assert_eq!(snap.commit_index, 9);
        assert_eq!(snap.snapshots_captured, 0);
    }
}

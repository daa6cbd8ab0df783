//! Snapshot capture lifecycle.

use bytes::Bytes;
use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::journal::{EntryJournal, TermInfo};
use crate::log::ReplicatedLog;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::types::ServerConfig;

/// Coordinates snapshot capture, persistence and the log trim that follows.
///
/// At most one capture runs at a time; replication keeps flowing while it does, but log
/// trimming is deferred until the capture completes.
#[derive(Debug)]
pub struct SnapshotManager {
    store: Option<SnapshotStore>,
    batch_count: u64,
    data_threshold: usize,
    capturing: bool,
}

impl SnapshotManager {
    /// Create a manager. `store` is `None` for memory-only operation.
    pub fn new(store: Option<SnapshotStore>, batch_count: u64, data_threshold: usize) -> Self {
        Self {
            store,
            batch_count,
            data_threshold,
            capturing: false,
        }
    }

    /// Whether a capture is in progress.
    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// Whether the log has grown past either capture trigger.
    pub fn should_capture(&self, log: &ReplicatedLog) -> bool {
        if self.capturing {
            return false;
        }
        let applied_since = log.last_applied().saturating_sub(log.snapshot_index());
        applied_since >= self.batch_count || log.data_size() >= self.data_threshold
    }

    /// Mark a capture as started. Returns false if one is already running.
    pub fn begin_capture(&mut self) -> bool {
        if self.capturing {
            return false;
        }
        self.capturing = true;
        true
    }

    /// Mark the running capture as finished.
    pub fn end_capture(&mut self) {
        self.capturing = false;
    }

    /// Assemble a snapshot from the current state.
    pub fn build(
        &self,
        log: &ReplicatedLog,
        state: Bytes,
        term_info: TermInfo,
        server_config: Option<ServerConfig>,
    ) -> Snapshot {
        Snapshot {
            last_applied_index: log.last_applied(),
            last_applied_term: log.term_of(log.last_applied()).unwrap_or(0),
            state,
            unapplied_entries: log.unapplied_entries(),
            term_info,
            server_config,
        }
    }

    /// Persist a snapshot, then move the log boundary and compact the journal.
    pub fn persist_and_commit(
        &mut self,
        snapshot: &Snapshot,
        log: &mut ReplicatedLog,
        journal: Option<&mut EntryJournal>,
    ) -> Result<()> {
        if let Some(store) = &self.store {
            store.save(snapshot)?;
        }
        log.advance_snapshot_to(snapshot.last_applied_index, snapshot.last_applied_term);
        if let Some(journal) = journal {
            journal.compact_to(log.snapshot_index())?;
        }
        info!(
            index = snapshot.last_applied_index,
            term = snapshot.last_applied_term,
            "snapshot committed"
        );
        Ok(())
    }

    /// Compress a state-machine snapshot for the wire.
    pub fn encode_install(state: &[u8]) -> Bytes {
        Bytes::from(lz4_flex::compress_prepend_size(state))
    }

    /// Decompress snapshot bytes received from a leader.
    pub fn decode_install(data: &[u8]) -> Result<Bytes> {
        let state = lz4_flex::decompress_size_prepended(data).map_err(|e| {
            debug!(error = %e, "failed to decompress installed snapshot");
            StorageError::Corrupt {
                file: "<install-snapshot>".into(),
                reason: e.to_string(),
            }
        })?;
        Ok(Bytes::from(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogEntry;

    fn filled_log(count: u64) -> ReplicatedLog {
        let mut log = ReplicatedLog::new();
        for i in 1..=count {
            log.append(LogEntry::data(i, 1, Bytes::from(vec![0u8; 10])))
                .unwrap();
        }
        log.set_commit_index(count);
        log.set_last_applied(count);
        log
    }

    #[test]
    fn test_should_capture_on_batch_count() {
        let manager = SnapshotManager::new(None, 5, usize::MAX);
        assert!(!manager.should_capture(&filled_log(4)));
        assert!(manager.should_capture(&filled_log(5)));
    }

    #[test]
    fn test_should_capture_on_data_size() {
        let manager = SnapshotManager::new(None, u64::MAX, 30);
        assert!(manager.should_capture(&filled_log(3)));
        assert!(!manager.should_capture(&filled_log(2)));
    }

    #[test]
    fn test_capture_guard() {
        let mut manager = SnapshotManager::new(None, 1, usize::MAX);
        assert!(manager.begin_capture());
        assert!(!manager.begin_capture());
        assert!(!manager.should_capture(&filled_log(10)));
        manager.end_capture();
        assert!(manager.begin_capture());
    }

    #[test]
    fn test_persist_and_commit_trims_log() {
        let mut manager = SnapshotManager::new(None, 5, usize::MAX);
        let mut log = filled_log(10);
        let snapshot = manager.build(&log, Bytes::from_static(b"state"), TermInfo::new(1), None);

        manager
            .persist_and_commit(&snapshot, &mut log, None)
            .unwrap();
        assert_eq!(log.snapshot_index(), 10);
        assert!(log.is_empty());
    }

    #[test]
    fn test_build_includes_unapplied_entries() {
        let manager = SnapshotManager::new(None, 5, usize::MAX);
        let mut log = filled_log(10);
        log.set_last_applied(8);

        let snapshot = manager.build(&log, Bytes::new(), TermInfo::new(1), None);
        assert_eq!(snapshot.last_applied_index, 8);
        assert_eq!(snapshot.unapplied_entries.len(), 2);
        assert_eq!(snapshot.last_index(), 10);
    }

    #[test]
    fn test_install_encoding_roundtrip() {
        let state = vec![42u8; 4096];
        let encoded = SnapshotManager::encode_install(&state);
        assert!(encoded.len() < state.len());
        let decoded = SnapshotManager::decode_install(&encoded).unwrap();
        assert_eq!(&decoded[..], &state[..]);
    }
}

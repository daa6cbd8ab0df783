//! Configuration for the consensus engine.

use std::path::PathBuf;
use std::time::Duration;

/// Raft protocol and storage configuration.
///
/// The election timeout is derived: `heartbeat_interval * election_timeout_factor`, with
/// a random variance of up to half the timeout added per election round so members do not
/// stampede.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between leader heartbeats.
    pub heartbeat_interval: Duration,

    /// Multiplier applied to the heartbeat interval to obtain the election timeout.
    pub election_timeout_factor: u32,

    /// Interval at which a leader verifies it can still reach a quorum of voting
    /// followers.
    pub isolated_check_interval: Duration,

    /// Number of applied entries after which a snapshot capture is triggered.
    pub snapshot_batch_count: u64,

    /// In-memory journal data size (bytes) after which a snapshot capture is triggered.
    pub snapshot_data_threshold: usize,

    /// Upper bound on the payload bytes packed into a single AppendEntries batch, and
    /// the size of each InstallSnapshot chunk.
    pub maximum_message_slice_size: usize,

    /// Directory for the entry journal and snapshot store. `None` keeps all state in
    /// memory (no recovery after restart).
    pub storage_dir: Option<PathBuf>,

    /// Capacity of one journal segment file.
    pub journal_segment_size: usize,

    /// Number of snapshot files retained on disk.
    pub retained_snapshots: usize,

    /// Overall deadline for one server-change operation (AddServer, RemoveServer,
    /// ChangeServersVotingStatus), covering catch-up snapshot installation and
    /// configuration consensus.
    pub server_change_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_factor: 20,
            isolated_check_interval: Duration::from_secs(5),
            snapshot_batch_count: 20_000,
            snapshot_data_threshold: 64 * 1024 * 1024,
            maximum_message_slice_size: 480 * 1024,
            storage_dir: None,
            journal_segment_size: 8 * 1024 * 1024,
            retained_snapshots: 2,
            server_change_timeout: Duration::from_secs(10),
        }
    }
}

impl RaftConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the election timeout factor.
    pub fn with_election_timeout_factor(mut self, factor: u32) -> Self {
        self.election_timeout_factor = factor;
        self
    }

    /// Set the isolated-leader check interval.
    pub fn with_isolated_check_interval(mut self, interval: Duration) -> Self {
        self.isolated_check_interval = interval;
        self
    }

    /// Set the snapshot batch count.
    pub fn with_snapshot_batch_count(mut self, count: u64) -> Self {
        self.snapshot_batch_count = count;
        self
    }

    /// Set the snapshot data threshold in bytes.
    pub fn with_snapshot_data_threshold(mut self, bytes: usize) -> Self {
        self.snapshot_data_threshold = bytes;
        self
    }

    /// Set the maximum message slice size.
    pub fn with_maximum_message_slice_size(mut self, bytes: usize) -> Self {
        self.maximum_message_slice_size = bytes;
        self
    }

    /// Set the storage directory, enabling durable state.
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Set the journal segment size.
    pub fn with_journal_segment_size(mut self, bytes: usize) -> Self {
        self.journal_segment_size = bytes;
        self
    }

    /// Set the number of retained snapshots.
    pub fn with_retained_snapshots(mut self, count: usize) -> Self {
        self.retained_snapshots = count;
        self
    }

    /// Set the server-change operation deadline.
    pub fn with_server_change_timeout(mut self, timeout: Duration) -> Self {
        self.server_change_timeout = timeout;
        self
    }

    /// The non-randomized election timeout.
    pub fn election_timeout(&self) -> Duration {
        self.heartbeat_interval * self.election_timeout_factor
    }

    /// Deadline for one InstallSnapshot chunk acknowledgement.
    pub fn chunk_timeout(&self) -> Duration {
        self.election_timeout() * 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RaftConfig::default();
        assert_eq!(config.election_timeout(), Duration::from_secs(2));
        assert_eq!(config.chunk_timeout(), Duration::from_secs(6));
        assert!(config.storage_dir.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = RaftConfig::new()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_election_timeout_factor(10)
            .with_snapshot_batch_count(100)
            .with_storage_dir("/tmp/raft");

        assert_eq!(config.election_timeout(), Duration::from_millis(500));
        assert_eq!(config.snapshot_batch_count, 100);
        assert_eq!(config.storage_dir.as_deref().unwrap().to_str(), Some("/tmp/raft"));
    }
}

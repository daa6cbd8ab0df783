//! The in-memory replicated log.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::error::{Result, StorageError};
use crate::log::entry::LogEntry;
use crate::types::{LogIndex, Term, NONE};

/// The in-memory portion of the replicated log, fronted by a snapshot boundary.
///
/// Entries at or below `snapshot_index` are only reachable through the snapshot. The
/// commit index and last-applied index live here as well, since every decision about
/// them is made against the log.
///
/// # Invariants
/// - Entries are contiguous: `entries[i].index == snapshot_index + 1 + i`.
/// - `last_applied <= commit_index <= last_index()`.
/// - Trimming never crosses `last_applied`.
#[derive(Debug, Default)]
pub struct ReplicatedLog {
    /// Index of the last entry covered by the snapshot, 0 if none.
    snapshot_index: LogIndex,

    /// Term of the last entry covered by the snapshot, 0 if none.
    snapshot_term: Term,

    /// Entries above the snapshot boundary.
    entries: VecDeque<LogEntry>,

    /// Highest index known to be committed.
    commit_index: LogIndex,

    /// Highest index applied to the state machine.
    last_applied: LogIndex,

    /// Sum of payload sizes of `entries`.
    data_size: usize,
}

impl ReplicatedLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last entry, falling back to the snapshot boundary.
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .back()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    /// Term of the last entry, falling back to the snapshot boundary.
    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// The snapshot boundary index.
    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    /// The snapshot boundary term.
    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    /// Highest committed index.
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Set the commit index.
    pub fn set_commit_index(&mut self, index: LogIndex) {
        trace!(index, "advancing commit index");
        self.commit_index = index;
    }

    /// Highest applied index.
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Set the last applied index.
    pub fn set_last_applied(&mut self, index: LogIndex) {
        self.last_applied = index;
    }

    /// Number of in-memory entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the in-memory log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of payload sizes held in memory.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Whether `index` is present in the in-memory log.
    pub fn is_present(&self, index: LogIndex) -> bool {
        index != NONE && index > self.snapshot_index && index <= self.last_index()
    }

    /// Whether `index` is only reachable through the snapshot.
    pub fn is_in_snapshot(&self, index: LogIndex) -> bool {
        index != NONE && index <= self.snapshot_index && self.snapshot_index != NONE
    }

    /// Get the entry at `index`, if present in memory.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if !self.is_present(index) {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Term of the entry at `index`, consulting the snapshot boundary. Returns `None`
    /// when the index is neither in memory nor the boundary itself.
    pub fn term_of(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index && self.snapshot_index != NONE {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Append a locally created entry. The entry must directly follow the current last
    /// index.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(StorageError::LogGap {
                last_index: self.last_index(),
                first_new: entry.index,
            }
            .into());
        }
        self.data_size += entry.data_size();
        self.entries.push_back(entry);
        Ok(())
    }

    /// Append entries received from a leader.
    ///
    /// Entries already present with a matching term are skipped. The first entry whose
    /// term conflicts with an existing one truncates the log from that index before the
    /// new entries are appended. Returns the entries that were actually added, in order,
    /// so the caller can apply voting configurations and persist them.
    pub fn append_received(&mut self, entries: &[LogEntry]) -> Result<Vec<LogEntry>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        // Validate internal contiguity first.
        for pair in entries.windows(2) {
            if pair[1].index != pair[0].index + 1 {
                return Err(StorageError::NonContiguous {
                    prev_index: pair[0].index,
                    curr_index: pair[1].index,
                }
                .into());
            }
        }

        let first_new = entries[0].index;
        if first_new > self.last_index() + 1 {
            return Err(StorageError::LogGap {
                last_index: self.last_index(),
                first_new,
            }
            .into());
        }

        let mut added = Vec::new();
        for entry in entries {
            if entry.index <= self.snapshot_index {
                // Already covered by the snapshot.
                continue;
            }
            match self.term_of(entry.index) {
                Some(term) if term == entry.term => {
                    // Already have it.
                    continue;
                }
                Some(_) => {
                    // Conflict: remove this entry and everything after it.
                    debug!(index = entry.index, "conflicting entry, truncating log tail");
                    self.truncate_from(entry.index)?;
                }
                None => {}
            }
            self.append(entry.clone())?;
            added.push(entry.clone());
        }
        Ok(added)
    }

    /// Remove all entries at or above `index`.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.snapshot_index {
            return Err(StorageError::Compacted(self.snapshot_index).into());
        }
        while self
            .entries
            .back()
            .map(|e| e.index >= index)
            .unwrap_or(false)
        {
            let removed = self.entries.pop_back().expect("checked non-empty");
            self.data_size -= removed.data_size();
        }
        Ok(())
    }

    /// Entries from `from` (inclusive), bounded by `max_entries` and a total payload
    /// size of `max_data_size`. At least one entry is returned when `from` is present,
    /// even if it alone exceeds the size bound.
    pub fn get_from(&self, from: LogIndex, max_entries: usize, max_data_size: usize) -> Vec<LogEntry> {
        let mut result = Vec::new();
        let mut total = 0usize;
        let mut index = from;
        while result.len() < max_entries {
            let Some(entry) = self.get(index) else { break };
            let size = entry.data_size();
            if !result.is_empty() && total + size > max_data_size {
                break;
            }
            total += size;
            result.push(entry.clone());
            index += 1;
        }
        result
    }

    /// Entries above `last_applied`, used when capturing a snapshot.
    pub fn unapplied_entries(&self) -> Vec<LogEntry> {
        self.get_from(self.last_applied + 1, usize::MAX, usize::MAX)
    }

    /// Move the snapshot boundary to `index`/`term`, dropping covered entries.
    ///
    /// Used after a snapshot has been persisted, and for trimming already replicated
    /// entries without an actual capture. The boundary never crosses `last_applied`.
    pub fn advance_snapshot_to(&mut self, index: LogIndex, term: Term) {
        let target = index.min(self.last_applied);
        if target <= self.snapshot_index {
            return;
        }
        while self
            .entries
            .front()
            .map(|e| e.index <= target)
            .unwrap_or(false)
        {
            let removed = self.entries.pop_front().expect("checked non-empty");
            self.data_size -= removed.data_size();
        }
        self.snapshot_index = target;
        // When trimming short of `index`, the term must be that of the boundary entry;
        // the caller-provided term is only valid at `index` itself.
        self.snapshot_term = if target == index { term } else { self.snapshot_term };
    }

    /// Trim entries replicated to every follower and already applied locally.
    ///
    /// This is the in-memory purge performed without capturing state; the boundary term
    /// is taken from the log itself.
    pub fn trim_replicated(&mut self, replicated_to_all: LogIndex) {
        let target = replicated_to_all.min(self.last_applied);
        if target <= self.snapshot_index {
            return;
        }
        if let Some(term) = self.term_of(target) {
            trace!(index = target, "trimming replicated entries");
            self.advance_snapshot_to(target, term);
        }
    }

    /// Reset the log to match an installed snapshot, discarding everything in memory.
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: Term) {
        self.entries.clear();
        self.data_size = 0;
        self.snapshot_index = index;
        self.snapshot_term = term;
        if self.commit_index < index {
            self.commit_index = index;
        }
        if self.last_applied < index {
            self.last_applied = index;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::entry::Payload;
    use bytes::Bytes;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry::data(index, term, Bytes::from(vec![0u8; 8]))
    }

    fn filled_log(count: u64, term: u64) -> ReplicatedLog {
        let mut log = ReplicatedLog::new();
        for i in 1..=count {
            log.append(entry(i, term)).unwrap();
        }
        log
    }

    #[test]
    fn test_append_contiguous() {
        let log = filled_log(5, 1);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.last_term(), 1);
        assert_eq!(log.len(), 5);
        assert_eq!(log.data_size(), 40);
    }

    #[test]
    fn test_append_gap_rejected() {
        let mut log = filled_log(3, 1);
        let result = log.append(entry(7, 1));
        assert!(matches!(
            result,
            Err(crate::error::Error::Storage(StorageError::LogGap {
                last_index: 3,
                first_new: 7
            }))
        ));
    }

    #[test]
    fn test_append_received_skips_duplicates() {
        let mut log = filled_log(3, 1);
        let added = log
            .append_received(&[entry(2, 1), entry(3, 1), entry(4, 1)])
            .unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].index, 4);
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn test_append_received_truncates_conflict() {
        let mut log = filled_log(5, 1);
        // Entries 3-4 now arrive with term 2: 3 conflicts, 4-5 replaced.
        let added = log.append_received(&[entry(3, 2), entry(4, 2)]).unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.term_of(3), Some(2));
        assert_eq!(log.term_of(4), Some(2));
    }

    #[test]
    fn test_append_received_non_contiguous_rejected() {
        let mut log = ReplicatedLog::new();
        let result = log.append_received(&[entry(1, 1), entry(3, 1)]);
        assert!(matches!(
            result,
            Err(crate::error::Error::Storage(StorageError::NonContiguous {
                prev_index: 1,
                curr_index: 3
            }))
        ));
    }

    #[test]
    fn test_get_from_respects_size_bound() {
        let log = filled_log(10, 1);
        // Each entry is 8 bytes; a 20-byte bound fits two.
        let batch = log.get_from(1, 100, 20);
        assert_eq!(batch.len(), 2);

        // A single entry over the bound is still returned.
        let batch = log.get_from(1, 100, 1);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_snapshot_boundary() {
        let mut log = filled_log(10, 1);
        log.set_commit_index(10);
        log.set_last_applied(7);

        log.advance_snapshot_to(7, 1);
        assert_eq!(log.snapshot_index(), 7);
        assert_eq!(log.len(), 3);
        assert!(!log.is_present(7));
        assert!(log.is_in_snapshot(7));
        assert!(log.is_present(8));
        assert_eq!(log.term_of(7), Some(1));
        assert_eq!(log.term_of(6), None);
    }

    #[test]
    fn test_trim_never_crosses_last_applied() {
        let mut log = filled_log(10, 1);
        log.set_commit_index(10);
        log.set_last_applied(4);

        // Followers have everything, but only 4 was applied locally.
        log.trim_replicated(10);
        assert_eq!(log.snapshot_index(), 4);
        assert_eq!(log.len(), 6);
    }

    #[test]
    fn test_reset_to_snapshot() {
        let mut log = filled_log(5, 1);
        log.reset_to_snapshot(12, 3);

        assert_eq!(log.last_index(), 12);
        assert_eq!(log.last_term(), 3);
        assert_eq!(log.commit_index(), 12);
        assert_eq!(log.last_applied(), 12);
        assert!(log.is_empty());
        assert_eq!(log.data_size(), 0);
    }

    #[test]
    fn test_unapplied_entries() {
        let mut log = filled_log(6, 1);
        log.set_last_applied(4);
        let unapplied = log.unapplied_entries();
        assert_eq!(unapplied.len(), 2);
        assert_eq!(unapplied[0].index, 5);
    }

    #[test]
    fn test_noop_payload_size_accounting() {
        let mut log = ReplicatedLog::new();
        log.append(LogEntry::new(1, 1, Payload::Noop)).unwrap();
        assert_eq!(log.data_size(), 0);
    }
}

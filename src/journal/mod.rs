//! Durable entry journal and term-info persistence.
//!
//! The journal stores log entries above the snapshot boundary across fixed-capacity
//! segment files. Recovery replays every segment in order; compaction deletes segments
//! fully covered by a snapshot; a conflict truncation rewrites the affected tail
//! segment.

mod segment;

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::access::MemberName;
use crate::error::{Result, StorageError};
use crate::log::LogEntry;
use crate::types::{LogIndex, Term};

use segment::{parse_segment_file_name, Segment};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const TERM_INFO_FILE: &str = "term-info.bin";

/// Persisted election state: the current term and who this member voted for in it.
///
/// Written to stable storage *before* a vote is granted or a higher term adopted, so a
/// restarted member can never vote twice in one term.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TermInfo {
    /// Current term.
    pub term: Term,

    /// The member voted for in `term`, if any.
    pub voted_for: Option<MemberName>,
}

impl TermInfo {
    /// Term info for a fresh term with no vote cast.
    pub fn new(term: Term) -> Self {
        Self {
            term,
            voted_for: None,
        }
    }

    /// Term info recording a vote.
    pub fn voted(term: Term, voted_for: MemberName) -> Self {
        Self {
            term,
            voted_for: Some(voted_for),
        }
    }
}

/// Segmented on-disk entry journal.
#[derive(Debug)]
pub struct EntryJournal {
    dir: PathBuf,
    segment_capacity: u64,
    segments: Vec<Segment>,
}

impl EntryJournal {
    /// Open the journal in `dir`, creating it if needed, and replay all entries.
    pub fn open(dir: impl Into<PathBuf>, segment_capacity: usize) -> Result<(Self, Vec<LogEntry>)> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut names: Vec<(LogIndex, PathBuf)> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                let first = parse_segment_file_name(path.file_name()?.to_str()?)?;
                Some((first, path))
            })
            .collect();
        names.sort_by_key(|(first, _)| *first);

        let mut segments: Vec<Segment> = Vec::new();
        let mut entries: Vec<LogEntry> = Vec::new();
        let mut torn = false;
        for (first, path) in names {
            if torn {
                // Everything after a torn segment is unreachable.
                warn!(path = %path.display(), "removing journal segment after torn predecessor");
                fs::remove_file(&path)?;
                continue;
            }
            let (segment, mut replayed) = Segment::open(path, first)?;
            // A segment that lost its tail (or everything) breaks contiguity with its
            // successors; they are stale leftovers from before the loss.
            let contiguous = match (entries.last(), replayed.first()) {
                (Some(last), Some(next)) => next.index == last.index + 1,
                (Some(_), None) => false,
                _ => true,
            };
            if !contiguous {
                warn!(path = %segment.path().display(), "journal segment out of sequence, truncating here");
                segment.delete()?;
                torn = true;
                continue;
            }
            entries.append(&mut replayed);
            segments.push(segment);
        }

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            entries = entries.len(),
            "journal opened"
        );

        Ok((
            Self {
                dir,
                segment_capacity: segment_capacity as u64,
                segments,
            },
            entries,
        ))
    }

    /// Append one entry durably.
    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let record_size = Segment::record_size(entry)?;
        let needs_roll = match self.segments.last() {
            Some(seg) => seg.size + record_size > self.segment_capacity && seg.size > 0,
            None => true,
        };
        if needs_roll {
            debug!(first_index = entry.index, "rolling journal segment");
            self.segments.push(Segment::create(&self.dir, entry.index)?);
        }
        self.segments
            .last_mut()
            .expect("segment just ensured")
            .append(entry)
    }

    /// Remove all entries at or above `index`.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        while self
            .segments
            .last()
            .map(|s| s.first_index >= index)
            .unwrap_or(false)
        {
            let segment = self.segments.pop().expect("checked non-empty");
            segment.delete()?;
        }
        if let Some(last) = self.segments.last_mut() {
            if last.last_index >= index {
                last.truncate_from(index)?;
            }
        }
        Ok(())
    }

    /// Delete segments fully covered by a snapshot at `index`.
    pub fn compact_to(&mut self, index: LogIndex) -> Result<()> {
        while self.segments.len() > 1 {
            // A segment is covered when the next segment starts at or below index + 1.
            let next_first = self.segments[1].first_index;
            if self.segments[0].last_index <= index && next_first <= index + 1 {
                let segment = self.segments.remove(0);
                debug!(path = %segment.path().display(), "deleting compacted journal segment");
                segment.delete()?;
            } else {
                break;
            }
        }
        if self.segments.len() == 1 && self.segments[0].last_index <= index && self.segments[0].last_index != 0 {
            let segment = self.segments.remove(0);
            segment.delete()?;
        }
        Ok(())
    }

    /// Index of the last journaled entry, 0 when empty.
    pub fn last_index(&self) -> LogIndex {
        self.segments.last().map(|s| s.last_index).unwrap_or(0)
    }

    /// Number of segment files.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

/// Durable store for [`TermInfo`], written atomically via temp file + rename.
#[derive(Debug)]
pub struct TermInfoStore {
    path: PathBuf,
}

impl TermInfoStore {
    /// Create a store rooted in `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            path: dir.as_ref().join(TERM_INFO_FILE),
        })
    }

    /// Persist term info. Returns only after the data is durable.
    pub fn store(&self, info: &TermInfo) -> Result<()> {
        let payload = bincode::serialize(info)?;
        let tmp = self.path.with_extension("bin.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&CASTAGNOLI.checksum(&payload).to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Load the persisted term info, if any.
    pub fn load(&self) -> Result<Option<TermInfo>> {
        let mut buf = Vec::new();
        match File::open(&self.path) {
            Ok(mut file) => {
                file.read_to_end(&mut buf)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if buf.len() < 4 {
            return Err(StorageError::Corrupt {
                file: self.path.display().to_string(),
                reason: "short term-info file".into(),
            }
            .into());
        }
        let crc = u32::from_le_bytes(buf[..4].try_into().unwrap());
        let payload = &buf[4..];
        if CASTAGNOLI.checksum(payload) != crc {
            return Err(StorageError::Corrupt {
                file: self.path.display().to_string(),
                reason: "term-info checksum mismatch".into(),
            }
            .into());
        }
        let info = bincode::deserialize(payload).map_err(|e| StorageError::Corrupt {
            file: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(index: u64) -> LogEntry {
        LogEntry::data(index, 1, Bytes::from(vec![7u8; 64]))
    }

    #[test]
    fn test_journal_append_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut journal, replayed) = EntryJournal::open(dir.path(), 1024).unwrap();
            assert!(replayed.is_empty());
            for i in 1..=20 {
                journal.append(&entry(i)).unwrap();
            }
            assert!(journal.segment_count() > 1);
        }

        let (journal, replayed) = EntryJournal::open(dir.path(), 1024).unwrap();
        assert_eq!(replayed.len(), 20);
        assert_eq!(journal.last_index(), 20);
        for (i, e) in replayed.iter().enumerate() {
            assert_eq!(e.index, i as u64 + 1);
        }
    }

    #[test]
    fn test_journal_truncate_from() {
        let dir = tempfile::tempdir().unwrap();
        let (mut journal, _) = EntryJournal::open(dir.path(), 1024).unwrap();
        for e in (1..=20).map(entry) {
            journal.append(&e).unwrap();
        }

        journal.truncate_from(9).unwrap();
        assert_eq!(journal.last_index(), 8);

        // Appends continue cleanly after truncation.
        journal.append(&entry(9)).unwrap();
        drop(journal);

        let (_, replayed) = EntryJournal::open(dir.path(), 1024).unwrap();
        assert_eq!(replayed.len(), 9);
        assert_eq!(replayed.last().unwrap().index, 9);
    }

    #[test]
    fn test_journal_compact_to() {
        let dir = tempfile::tempdir().unwrap();
        let (mut journal, _) = EntryJournal::open(dir.path(), 512).unwrap();
        for i in 1..=30 {
            journal.append(&entry(i)).unwrap();
        }
        let before = journal.segment_count();
        journal.compact_to(20).unwrap();
        assert!(journal.segment_count() < before);

        // Entries above the compaction point survive.
        drop(journal);
        let (_, replayed) = EntryJournal::open(dir.path(), 512).unwrap();
        assert!(replayed.iter().any(|e| e.index == 30));
        assert!(replayed.first().unwrap().index > 1);
    }

    #[test]
    fn test_term_info_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TermInfoStore::new(dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), None);

        let info = TermInfo::voted(5, MemberName::new("n2"));
        store.store(&info).unwrap();
        assert_eq!(store.load().unwrap(), Some(info));
    }

    #[test]
    fn test_term_info_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = TermInfoStore::new(dir.path()).unwrap();
        store.store(&TermInfo::new(3)).unwrap();

        // Flip a byte in the payload.
        let path = dir.path().join(TERM_INFO_FILE);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(store.load().is_err());
    }
}

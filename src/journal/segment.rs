//! Segment file framing.
//!
//! A segment is a sequence of records, each framed as
//! `[u32 payload length][u32 CRC-32 of payload][payload]` with little-endian integers.
//! A torn tail (short read or checksum mismatch) marks the end of usable data; replay
//! truncates the file there.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Result, StorageError};
use crate::log::LogEntry;
use crate::types::LogIndex;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Record header size: length + checksum.
pub const RECORD_HEADER: usize = 8;

/// Name of the segment file whose first entry is `first_index`.
pub fn segment_file_name(first_index: LogIndex) -> String {
    format!("{first_index:020}.seg")
}

/// Parse a segment file name back into its first index.
pub fn parse_segment_file_name(name: &str) -> Option<LogIndex> {
    name.strip_suffix(".seg")?.parse().ok()
}

/// An open journal segment.
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    file: File,
    /// Index of the first entry, fixed at creation.
    pub first_index: LogIndex,
    /// Index of the last entry written, 0 while empty.
    pub last_index: LogIndex,
    /// Current file size in bytes.
    pub size: u64,
}

impl Segment {
    /// Create a fresh segment whose first entry will be `first_index`.
    pub fn create(dir: &Path, first_index: LogIndex) -> Result<Self> {
        let path = dir.join(segment_file_name(first_index));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .read(true)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            first_index,
            last_index: 0,
            size: 0,
        })
    }

    /// Open an existing segment and replay its records.
    ///
    /// Returns the segment and its entries. A torn tail is truncated away; anything
    /// following a corrupt record is unreachable and discarded with it.
    pub fn open(path: PathBuf, first_index: LogIndex) -> Result<(Self, Vec<LogEntry>)> {
        let mut file = OpenOptions::new().read(true).append(true).open(&path)?;
        let file_len = file.metadata()?.len();

        let mut buf = Vec::with_capacity(file_len as usize);
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut buf)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset + RECORD_HEADER <= buf.len() {
            let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(buf[offset + 4..offset + 8].try_into().unwrap());
            let start = offset + RECORD_HEADER;
            if len == 0 || start + len > buf.len() {
                break;
            }
            let payload = &buf[start..start + len];
            if CASTAGNOLI.checksum(payload) != crc {
                break;
            }
            let entry: LogEntry = bincode::deserialize(payload).map_err(|e| StorageError::Corrupt {
                file: path.display().to_string(),
                reason: e.to_string(),
            })?;
            entries.push(entry);
            offset = start + len;
        }

        // Drop any torn tail so appends continue from a clean boundary.
        if offset as u64 != file_len {
            file.set_len(offset as u64)?;
        }

        let last_index = entries.last().map(|e| e.index).unwrap_or(0);
        Ok((
            Self {
                path,
                file,
                first_index,
                last_index,
                size: offset as u64,
            },
            entries,
        ))
    }

    /// Append one entry and flush it to the OS.
    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let payload = bincode::serialize(entry)?;
        let mut record = Vec::with_capacity(RECORD_HEADER + payload.len());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&CASTAGNOLI.checksum(&payload).to_le_bytes());
        record.extend_from_slice(&payload);

        self.file.write_all(&record)?;
        self.file.sync_data()?;
        self.size += record.len() as u64;
        self.last_index = entry.index;
        Ok(())
    }

    /// Serialized size of one entry record, for roll decisions.
    pub fn record_size(entry: &LogEntry) -> Result<u64> {
        Ok(bincode::serialized_size(entry).map(|s| s + RECORD_HEADER as u64)?)
    }

    /// Rewrite this segment keeping only entries below `index`.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        let (_, existing) = Self::open(self.path.clone(), self.first_index)?;
        let tmp = self.path.with_extension("seg.tmp");
        {
            let mut out = File::create(&tmp)?;
            for entry in existing.iter().filter(|e| e.index < index) {
                let payload = bincode::serialize(entry)?;
                out.write_all(&(payload.len() as u32).to_le_bytes())?;
                out.write_all(&CASTAGNOLI.checksum(&payload).to_le_bytes())?;
                out.write_all(&payload)?;
            }
            out.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        let (reopened, _) = Self::open(self.path.clone(), self.first_index)?;
        *self = reopened;
        Ok(())
    }

    /// Delete the backing file.
    pub fn delete(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(index: u64) -> LogEntry {
        LogEntry::data(index, 1, Bytes::from(vec![index as u8; 16]))
    }

    #[test]
    fn test_segment_name_roundtrip() {
        let name = segment_file_name(42);
        assert_eq!(parse_segment_file_name(&name), Some(42));
        assert_eq!(parse_segment_file_name("garbage"), None);
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 1).unwrap();
        for i in 1..=5 {
            segment.append(&entry(i)).unwrap();
        }
        let path = segment.path().to_path_buf();
        drop(segment);

        let (reopened, entries) = Segment::open(path, 1).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(reopened.last_index, 5);
        assert_eq!(entries[4].index, 5);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 1).unwrap();
        segment.append(&entry(1)).unwrap();
        segment.append(&entry(2)).unwrap();
        let good_size = segment.size;
        let path = segment.path().to_path_buf();
        drop(segment);

        // Simulate a torn write: a half-finished third record.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        }

        let (reopened, entries) = Segment::open(path, 1).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(reopened.size, good_size);
    }

    #[test]
    fn test_truncate_from() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 1).unwrap();
        for e in (1..=5).map(entry) {
            segment.append(&e).unwrap();
        }

        segment.truncate_from(4).unwrap();
        assert_eq!(segment.last_index, 3);

        let path = segment.path().to_path_buf();
        drop(segment);
        let (_, replayed) = Segment::open(path, 1).unwrap();
        assert_eq!(replayed.len(), 3);
    }
}

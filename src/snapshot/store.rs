//! On-disk snapshot persistence.
//!
//! Snapshot files are LZ4-compressed bincode, prefixed with a magic word and a CRC-32 of
//! the compressed payload. Files are written to a temp path and atomically renamed, and
//! only the newest `retained` files are kept.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISCSI};
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};
use crate::snapshot::Snapshot;
use crate::types::LogIndex;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const MAGIC: u32 = 0x544c_5253; // "TLRS"

fn snapshot_file_name(index: LogIndex, term: u64) -> String {
    format!("snapshot-{index:020}-{term:020}.snap")
}

fn parse_snapshot_file_name(name: &str) -> Option<(LogIndex, u64)> {
    let rest = name.strip_prefix("snapshot-")?.strip_suffix(".snap")?;
    let (index, term) = rest.split_once('-')?;
    Some((index.parse().ok()?, term.parse().ok()?))
}

/// File-based snapshot store.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    retained: usize,
}

impl SnapshotStore {
    /// Create a store rooted in `dir`.
    pub fn new(dir: impl Into<PathBuf>, retained: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retained: retained.max(1),
        })
    }

    /// Persist a snapshot durably and prune old files.
    pub fn save(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let payload = bincode::serialize(snapshot)?;
        let compressed = lz4_flex::compress_prepend_size(&payload);

        let path = self.dir.join(snapshot_file_name(
            snapshot.last_applied_index,
            snapshot.last_applied_term,
        ));
        let tmp = path.with_extension("snap.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&MAGIC.to_le_bytes())?;
            file.write_all(&CASTAGNOLI.checksum(&compressed).to_le_bytes())?;
            file.write_all(&compressed)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        info!(
            path = %path.display(),
            index = snapshot.last_applied_index,
            "snapshot persisted"
        );

        self.prune()?;
        Ok(path)
    }

    /// Load the newest readable snapshot, if any. Corrupt files are skipped.
    pub fn load_latest(&self) -> Result<Option<Snapshot>> {
        for (_, path) in self.list()?.into_iter().rev() {
            match Self::load_file(&path) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
                }
            }
        }
        Ok(None)
    }

    fn load_file(path: &Path) -> Result<Snapshot> {
        let corrupt = |reason: String| StorageError::Corrupt {
            file: path.display().to_string(),
            reason,
        };

        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;
        if buf.len() < 8 {
            return Err(corrupt("short snapshot file".into()).into());
        }
        if u32::from_le_bytes(buf[..4].try_into().unwrap()) != MAGIC {
            return Err(corrupt("bad magic".into()).into());
        }
        let crc = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let compressed = &buf[8..];
        if CASTAGNOLI.checksum(compressed) != crc {
            return Err(corrupt("checksum mismatch".into()).into());
        }
        let payload = lz4_flex::decompress_size_prepended(compressed)
            .map_err(|e| corrupt(e.to_string()))?;
        let snapshot =
            bincode::deserialize(&payload).map_err(|e| corrupt(e.to_string()))?;
        Ok(snapshot)
    }

    fn list(&self) -> Result<Vec<((LogIndex, u64), PathBuf)>> {
        let mut files: Vec<((LogIndex, u64), PathBuf)> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                let key = parse_snapshot_file_name(path.file_name()?.to_str()?)?;
                Some((key, path))
            })
            .collect();
        files.sort_by_key(|(key, _)| *key);
        Ok(files)
    }

    fn prune(&self) -> Result<()> {
        let files = self.list()?;
        if files.len() <= self.retained {
            return Ok(());
        }
        let excess = files.len() - self.retained;
        for (_, path) in files.into_iter().take(excess) {
            debug!(path = %path.display(), "pruning old snapshot");
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::TermInfo;
    use bytes::Bytes;

    fn snapshot(index: u64, term: u64) -> Snapshot {
        Snapshot {
            last_applied_index: index,
            last_applied_term: term,
            state: Bytes::from(vec![3u8; 256]),
            unapplied_entries: Vec::new(),
            term_info: TermInfo::new(term),
            server_config: None,
        }
    }

    #[test]
    fn test_save_and_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 2).unwrap();
        assert!(store.load_latest().unwrap().is_none());

        store.save(&snapshot(10, 1)).unwrap();
        store.save(&snapshot(25, 2)).unwrap();

        let latest = store.load_latest().unwrap().unwrap();
        assert_eq!(latest.last_applied_index, 25);
    }

    #[test]
    fn test_retention_prunes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 2).unwrap();
        store.save(&snapshot(10, 1)).unwrap();
        store.save(&snapshot(20, 1)).unwrap();
        store.save(&snapshot(30, 1)).unwrap();

        let count = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 2);
        assert_eq!(
            store.load_latest().unwrap().unwrap().last_applied_index,
            30
        );
    }

    #[test]
    fn test_corrupt_file_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 3).unwrap();
        store.save(&snapshot(10, 1)).unwrap();
        let good = store.save(&snapshot(20, 1)).unwrap();

        // Corrupt the newest file; load falls back to the older one.
        let mut bytes = fs::read(&good).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&good, bytes).unwrap();

        let latest = store.load_latest().unwrap().unwrap();
        assert_eq!(latest.last_applied_index, 10);
    }
}

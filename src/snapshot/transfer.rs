//! Chunked snapshot transfer state, leader and follower side.
//!
//! The leader slices the serialized snapshot into chunks of at most the configured
//! slice size and sends them one at a time; each chunk carries the CRC of the previous
//! chunk so the follower can verify it is seeing the same transfer in the same order.
//! A failed or out-of-sequence chunk resets the transfer to the first chunk.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};
use thiserror::Error;
use tracing::{debug, warn};

use crate::messages::FIRST_CHUNK_INDEX;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

fn chunk_hash(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}

/// One chunk ready to be sent.
#[derive(Debug, Clone)]
pub struct OutboundChunk {
    /// Chunk bytes.
    pub data: Bytes,

    /// 1-based chunk number.
    pub chunk_index: u32,

    /// Total chunks in the transfer.
    pub total_chunks: u32,

    /// CRC of the previously sent chunk, absent on the first.
    pub last_chunk_hash: Option<u32>,
}

/// Leader-side cursor over one snapshot transfer to one follower.
#[derive(Debug)]
pub struct LeaderInstallSnapshotState {
    snapshot: Bytes,
    chunk_size: usize,
    total_chunks: u32,
    /// Chunk most recently handed out, 0 before the first send.
    chunk_index: u32,
    offset: usize,
    /// CRC of the last chunk handed out.
    last_chunk_hash: Option<u32>,
    /// Whether the chunk handed out last has been acknowledged.
    awaiting_reply: bool,
    chunk_timer: Option<Instant>,
}

impl LeaderInstallSnapshotState {
    /// Start a transfer over `snapshot` bytes.
    pub fn new(snapshot: Bytes, chunk_size: usize) -> Self {
        let total_chunks = snapshot.len().div_ceil(chunk_size).max(1) as u32;
        Self {
            snapshot,
            chunk_size,
            total_chunks,
            chunk_index: 0,
            offset: 0,
            last_chunk_hash: None,
            awaiting_reply: false,
            chunk_timer: None,
        }
    }

    /// Total chunks in this transfer.
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// The chunk currently in flight, 0 before the first send.
    pub fn chunk_index(&self) -> u32 {
        self.chunk_index
    }

    /// Whether the next chunk may be sent.
    pub fn can_send_next_chunk(&self) -> bool {
        !self.awaiting_reply && self.chunk_index < self.total_chunks
    }

    /// Whether `chunk_index` is the final chunk.
    pub fn is_last_chunk(&self, chunk_index: u32) -> bool {
        chunk_index == self.total_chunks
    }

    /// Hand out the next chunk and start its acknowledgement timer.
    pub fn next_chunk(&mut self) -> Option<OutboundChunk> {
        if !self.can_send_next_chunk() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.snapshot.len());
        let data = self.snapshot.slice(self.offset..end);
        let previous_hash = self.last_chunk_hash;

        self.chunk_index += 1;
        self.offset = end;
        self.last_chunk_hash = Some(chunk_hash(&data));
        self.awaiting_reply = true;
        self.chunk_timer = Some(Instant::now());

        Some(OutboundChunk {
            data,
            chunk_index: self.chunk_index,
            total_chunks: self.total_chunks,
            last_chunk_hash: previous_hash,
        })
    }

    /// Record the reply for the in-flight chunk. On failure the cursor steps back so
    /// the same chunk is handed out again.
    pub fn mark_send_status(&mut self, success: bool) {
        if !self.awaiting_reply {
            return;
        }
        self.awaiting_reply = false;
        self.chunk_timer = None;
        if !success {
            debug!(chunk = self.chunk_index, "stepping back to resend failed chunk");
            self.chunk_index -= 1;
            let start = self.chunk_index as usize * self.chunk_size;
            self.offset = start;
            self.last_chunk_hash = if self.chunk_index == 0 {
                None
            } else {
                let prev_start = start - self.chunk_size;
                Some(chunk_hash(&self.snapshot[prev_start..start]))
            };
        }
    }

    /// Whether the in-flight chunk has gone unacknowledged past `timeout`.
    pub fn is_chunk_timed_out(&self, timeout: Duration) -> bool {
        self.chunk_timer
            .map(|started| started.elapsed() > timeout)
            .unwrap_or(false)
    }

    /// Restart the transfer from the first chunk.
    pub fn reset(&mut self) {
        warn!("resetting snapshot transfer to first chunk");
        self.chunk_index = 0;
        self.offset = 0;
        self.last_chunk_hash = None;
        self.awaiting_reply = false;
        self.chunk_timer = None;
    }
}

/// Why a follower rejected a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    /// Chunk arrived out of sequence.
    #[error("unexpected chunk {received}, expected {expected}")]
    OutOfSequence { received: u32, expected: u32 },

    /// The echoed hash of the previous chunk does not match what was received.
    #[error("previous-chunk hash mismatch on chunk {chunk}")]
    HashMismatch { chunk: u32 },

    /// The total chunk count changed mid-transfer.
    #[error("total chunk count changed from {was} to {now}")]
    TotalChanged { was: u32, now: u32 },
}

/// Follower-side reassembly of one snapshot transfer.
#[derive(Debug)]
pub struct FollowerInstallSnapshotState {
    total_chunks: u32,
    last_chunk_index: u32,
    last_chunk_hash: Option<u32>,
    collected: BytesMut,
}

impl FollowerInstallSnapshotState {
    /// Start tracking a transfer announced with `total_chunks`.
    pub fn new(total_chunks: u32) -> Self {
        Self {
            total_chunks,
            last_chunk_index: 0,
            last_chunk_hash: None,
            collected: BytesMut::new(),
        }
    }

    /// Add one chunk. Returns `true` when the transfer is complete.
    pub fn add_chunk(
        &mut self,
        chunk_index: u32,
        total_chunks: u32,
        last_chunk_hash: Option<u32>,
        data: &[u8],
    ) -> Result<bool, ChunkError> {
        if total_chunks != self.total_chunks {
            return Err(ChunkError::TotalChanged {
                was: self.total_chunks,
                now: total_chunks,
            });
        }
        let expected = self.last_chunk_index + 1;
        if chunk_index != expected {
            return Err(ChunkError::OutOfSequence {
                received: chunk_index,
                expected,
            });
        }
        if chunk_index > FIRST_CHUNK_INDEX && last_chunk_hash != self.last_chunk_hash {
            return Err(ChunkError::HashMismatch { chunk: chunk_index });
        }

        self.collected.extend_from_slice(data);
        self.last_chunk_index = chunk_index;
        self.last_chunk_hash = Some(chunk_hash(data));
        Ok(chunk_index == self.total_chunks)
    }

    /// The collected snapshot bytes; call once `add_chunk` returned `true`.
    pub fn into_bytes(self) -> Bytes {
        self.collected.freeze()
    }

    /// The last chunk successfully added.
    pub fn last_chunk_index(&self) -> u32 {
        self.last_chunk_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer_roundtrip(payload_len: usize, chunk_size: usize) -> Bytes {
        let payload = Bytes::from((0..payload_len).map(|i| i as u8).collect::<Vec<_>>());
        let mut leader = LeaderInstallSnapshotState::new(payload.clone(), chunk_size);
        let mut follower = FollowerInstallSnapshotState::new(leader.total_chunks());

        loop {
            let chunk = leader.next_chunk().expect("chunk available");
            let done = follower
                .add_chunk(
                    chunk.chunk_index,
                    chunk.total_chunks,
                    chunk.last_chunk_hash,
                    &chunk.data,
                )
                .unwrap();
            leader.mark_send_status(true);
            if done {
                assert!(leader.is_last_chunk(chunk.chunk_index));
                break;
            }
        }
        follower.into_bytes()
    }

    #[test]
    fn test_chunked_roundtrip() {
        let original: Vec<u8> = (0..1000).map(|i| i as u8).collect();
        let reassembled = transfer_roundtrip(1000, 64);
        assert_eq!(&reassembled[..], &original[..]);
    }

    #[test]
    fn test_single_chunk_transfer() {
        let reassembled = transfer_roundtrip(10, 64);
        assert_eq!(reassembled.len(), 10);
    }

    #[test]
    fn test_empty_snapshot_still_one_chunk() {
        let leader = LeaderInstallSnapshotState::new(Bytes::new(), 64);
        assert_eq!(leader.total_chunks(), 1);
    }

    #[test]
    fn test_failed_chunk_resent() {
        let payload = Bytes::from(vec![1u8; 200]);
        let mut leader = LeaderInstallSnapshotState::new(payload, 64);

        let first = leader.next_chunk().unwrap();
        assert_eq!(first.chunk_index, 1);
        leader.mark_send_status(false);

        let retry = leader.next_chunk().unwrap();
        assert_eq!(retry.chunk_index, 1);
        assert_eq!(retry.data, first.data);
        assert_eq!(retry.last_chunk_hash, None);
    }

    #[test]
    fn test_follower_rejects_out_of_sequence() {
        let mut follower = FollowerInstallSnapshotState::new(3);
        follower.add_chunk(1, 3, None, b"aaa").unwrap();
        let err = follower.add_chunk(3, 3, Some(0), b"ccc").unwrap_err();
        assert_eq!(
            err,
            ChunkError::OutOfSequence {
                received: 3,
                expected: 2
            }
        );
    }

    #[test]
    fn test_follower_rejects_hash_mismatch() {
        let mut follower = FollowerInstallSnapshotState::new(3);
        follower.add_chunk(1, 3, None, b"aaa").unwrap();
        let err = follower
            .add_chunk(2, 3, Some(0xbad), b"bbb")
            .unwrap_err();
        assert_eq!(err, ChunkError::HashMismatch { chunk: 2 });
    }

    #[test]
    fn test_leader_reset_restarts_transfer() {
        let payload = Bytes::from(vec![1u8; 200]);
        let mut leader = LeaderInstallSnapshotState::new(payload, 64);
        leader.next_chunk().unwrap();
        leader.mark_send_status(true);
        leader.next_chunk().unwrap();

        leader.reset();
        let chunk = leader.next_chunk().unwrap();
        assert_eq!(chunk.chunk_index, 1);
        assert_eq!(chunk.last_chunk_hash, None);
    }

    #[test]
    fn test_chunk_timeout() {
        let payload = Bytes::from(vec![1u8; 10]);
        let mut leader = LeaderInstallSnapshotState::new(payload, 64);
        assert!(!leader.is_chunk_timed_out(Duration::from_secs(1)));
        leader.next_chunk().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(leader.is_chunk_timed_out(Duration::from_millis(1)));
        assert!(!leader.is_chunk_timed_out(Duration::from_secs(60)));
    }
}

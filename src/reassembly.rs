//! Reassembly of chunked messages.
//!
//! Chunk parts for different message ids may interleave arbitrarily on one
//! connection; each id is tracked independently and reassembled in index
//! order regardless of arrival order.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ProtocolLimits;
use crate::error::FrameError;

/// A chunked message that has not received all of its parts yet.
#[derive(Debug)]
struct PendingChunkedMessage {
    total_chunks: u16,
    parts: BTreeMap<u16, Bytes>,
    received_bytes: usize,
    created_at: Instant,
}

impl PendingChunkedMessage {
    fn new(total_chunks: u16, now: Instant) -> Self {
        Self {
            total_chunks,
            parts: BTreeMap::new(),
            received_bytes: 0,
            created_at: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.parts.len() == self.total_chunks as usize
    }

    fn assemble(self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(self.received_bytes);
        for part in self.parts.into_values() {
            out.extend_from_slice(&part);
        }
        out.to_vec()
    }
}

/// Per-connection table of in-flight chunked messages.
///
/// All methods take `&self`; the table is guarded internally so the read
/// path and a sweep can share it through an `Arc`.
#[derive(Debug)]
pub struct ChunkAssembler {
    pending: Mutex<HashMap<String, PendingChunkedMessage>>,
    max_payload_size: usize,
    stale_after: Duration,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new(&ProtocolLimits::default())
    }
}

impl ChunkAssembler {
    pub fn new(limits: &ProtocolLimits) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            max_payload_size: limits.max_payload_size(),
            stale_after: limits.chunk_stale_after(),
        }
    }

    /// Add one chunk part. Returns the reassembled serialized message once
    /// every index has arrived.
    pub fn add_part(
        &self,
        message_id: &str,
        chunk_index: u16,
        total_chunks: u16,
        bytes: &[u8],
    ) -> Result<Option<Vec<u8>>, FrameError> {
        self.add_part_at(message_id, chunk_index, total_chunks, bytes, Instant::now())
    }

    pub fn add_part_at(
        &self,
        message_id: &str,
        chunk_index: u16,
        total_chunks: u16,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>, FrameError> {
        if chunk_index >= total_chunks {
            return Err(FrameError::InvalidChunkIndex {
                message_id: message_id.to_string(),
                index: chunk_index,
                total: total_chunks,
            });
        }

        let mut pending = self.pending.lock();
        let entry = pending
            .entry(message_id.to_string())
            .or_insert_with(|| PendingChunkedMessage::new(total_chunks, now));

        if entry.total_chunks != total_chunks {
            let expected = entry.total_chunks;
            pending.remove(message_id);
            return Err(FrameError::ChunkCountMismatch {
                message_id: message_id.to_string(),
                expected,
                actual: total_chunks,
            });
        }

        // Last write wins on a duplicate index.
        if let Some(previous) = entry.parts.insert(chunk_index, Bytes::copy_from_slice(bytes)) {
            debug!(
                "Duplicate chunk {} for {}, replacing previous part",
                chunk_index, message_id
            );
            entry.received_bytes -= previous.len();
        }
        entry.received_bytes += bytes.len();

        if entry.received_bytes > self.max_payload_size {
            let size = entry.received_bytes;
            pending.remove(message_id);
            return Err(FrameError::PayloadTooLarge {
                size,
                max: self.max_payload_size,
            });
        }

        if !entry.is_complete() {
            return Ok(None);
        }

        let Some(complete) = pending.remove(message_id) else {
            return Ok(None);
        };
        debug!(
            "Reassembled {} from {} chunks ({} bytes)",
            message_id, complete.total_chunks, complete.received_bytes
        );
        Ok(Some(complete.assemble()))
    }

    /// Drop transfers older than the staleness window.
    pub fn evict_stale(&self) -> Vec<FrameError> {
        self.evict_stale_at(Instant::now())
    }

    pub fn evict_stale_at(&self, now: Instant) -> Vec<FrameError> {
        let mut pending = self.pending.lock();
        let stale: Vec<String> = pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.created_at) >= self.stale_after)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| {
                let entry = pending.remove(&id)?;
                warn!(
                    "Evicting stale chunked transfer {} ({}/{} chunks)",
                    id,
                    entry.parts.len(),
                    entry.total_chunks
                );
                Some(FrameError::ChunkTimeout {
                    message_id: id,
                    received: entry.parts.len(),
                    total: entry.total_chunks,
                })
            })
            .collect()
    }

    /// Discard every pending transfer. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut pending = self.pending.lock();
        let dropped = pending.len();
        pending.clear();
        dropped
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_reassembly() {
        let assembler = ChunkAssembler::default();

        assert_eq!(assembler.add_part("X", 0, 3, b"ab").unwrap(), None);
        assert_eq!(assembler.add_part("X", 1, 3, b"cd").unwrap(), None);
        assert_eq!(
            assembler.add_part("X", 2, 3, b"e").unwrap(),
            Some(b"abcde".to_vec())
        );
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let assembler = ChunkAssembler::default();

        assert_eq!(assembler.add_part("X", 2, 3, b"e").unwrap(), None);
        assert_eq!(assembler.add_part("X", 0, 3, b"ab").unwrap(), None);
        assert_eq!(
            assembler.add_part("X", 1, 3, b"cd").unwrap(),
            Some(b"abcde".to_vec())
        );
    }

    #[test]
    fn test_interleaved_messages() {
        let assembler = ChunkAssembler::default();

        assert_eq!(assembler.add_part("A", 0, 2, b"a0").unwrap(), None);
        assert_eq!(assembler.add_part("B", 1, 2, b"b1").unwrap(), None);
        assert_eq!(assembler.pending_count(), 2);
        assert_eq!(assembler.add_part("B", 0, 2, b"b0").unwrap(), Some(b"b0b1".to_vec()));
        assert_eq!(assembler.add_part("A", 1, 2, b"a1").unwrap(), Some(b"a0a1".to_vec()));
    }

    #[test]
    fn test_duplicate_index_last_write_wins() {
        let assembler = ChunkAssembler::default();

        assembler.add_part("X", 0, 2, b"old").unwrap();
        assembler.add_part("X", 0, 2, b"new").unwrap();
        assert_eq!(assembler.add_part("X", 1, 2, b"!").unwrap(), Some(b"new!".to_vec()));
    }

    #[test]
    fn test_invalid_index_keeps_entry() {
        let assembler = ChunkAssembler::default();

        assembler.add_part("X", 0, 2, b"a").unwrap();
        assert_eq!(
            assembler.add_part("X", 2, 2, b"z"),
            Err(FrameError::InvalidChunkIndex {
                message_id: "X".to_string(),
                index: 2,
                total: 2
            })
        );
        assert!(matches!(
            assembler.add_part("Y", 0, 0, b"z"),
            Err(FrameError::InvalidChunkIndex { .. })
        ));
        assert_eq!(assembler.pending_count(), 1);
        assert_eq!(assembler.add_part("X", 1, 2, b"b").unwrap(), Some(b"ab".to_vec()));
    }

    #[test]
    fn test_count_mismatch_abandons_entry() {
        let assembler = ChunkAssembler::default();

        assembler.add_part("X", 0, 3, b"a").unwrap();
        assert_eq!(
            assembler.add_part("X", 1, 4, b"b"),
            Err(FrameError::ChunkCountMismatch {
                message_id: "X".to_string(),
                expected: 3,
                actual: 4
            })
        );
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_accumulated_size_is_bounded() {
        let limits = ProtocolLimits::new(8, 4).unwrap();
        let assembler = ChunkAssembler::new(&limits);

        assembler.add_part("X", 0, 3, b"1234").unwrap();
        assembler.add_part("X", 1, 3, b"5678").unwrap();
        assert_eq!(
            assembler.add_part("X", 2, 3, b"9"),
            Err(FrameError::PayloadTooLarge { size: 9, max: 8 })
        );
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_evict_stale() {
        let assembler = ChunkAssembler::default();
        let start = Instant::now();

        assembler.add_part_at("old", 0, 2, b"a", start).unwrap();
        assembler
            .add_part_at("fresh", 0, 2, b"a", start + Duration::from_secs(50))
            .unwrap();

        let evicted = assembler.evict_stale_at(start + Duration::from_secs(61));
        assert_eq!(
            evicted,
            vec![FrameError::ChunkTimeout {
                message_id: "old".to_string(),
                received: 1,
                total: 2
            }]
        );
        assert_eq!(assembler.pending_count(), 1);
    }

    #[test]
    fn test_clear_discards_pending() {
        let assembler = ChunkAssembler::default();
        assembler.add_part("A", 0, 2, b"a").unwrap();
        assembler.add_part("B", 0, 2, b"b").unwrap();

        assert_eq!(assembler.clear(), 2);
        assert_eq!(assembler.pending_count(), 0);
    }
}

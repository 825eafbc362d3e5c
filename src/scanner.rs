//! Turns the bytes accumulated in a [`ConnectionBuffer`] into messages.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::ConnectionBuffer;
use crate::config::ProtocolLimits;
use crate::error::FrameError;
use crate::frame::{locate_frame, FrameCodec, FrameSlice};
use crate::reassembly::ChunkAssembler;
use crate::types::Message;

/// Result of consuming one frame.
#[derive(Debug)]
pub(crate) enum Parsed {
    Message(Message),
    /// A chunk part that did not complete its message yet, or discarded
    /// bytes of an oversized frame.
    Pending,
    /// The frame was consumed and dropped.
    Rejected(FrameError),
}

/// Frame-at-a-time reader shared by [`FrameScanner`] and
/// [`MessageCodec`](crate::codec::MessageCodec).
#[derive(Debug)]
pub(crate) struct FrameReader {
    codec: FrameCodec,
    assembler: Arc<ChunkAssembler>,
    /// Body bytes of an oversized frame still to be thrown away.
    discard_remaining: usize,
}

impl FrameReader {
    pub(crate) fn new(codec: FrameCodec, assembler: Arc<ChunkAssembler>) -> Self {
        Self {
            codec,
            assembler,
            discard_remaining: 0,
        }
    }

    pub(crate) fn assembler(&self) -> &Arc<ChunkAssembler> {
        &self.assembler
    }

    pub(crate) fn limits(&self) -> &ProtocolLimits {
        self.codec.limits()
    }

    /// Consume at most one frame from the front of `buf`.
    ///
    /// `Ok(None)` means more data is needed and nothing was consumed. An
    /// error means the stream can no longer be delimited.
    pub(crate) fn step(&mut self, buf: &[u8]) -> Result<Option<(usize, Parsed)>, FrameError> {
        if self.discard_remaining > 0 {
            let n = self.discard_remaining.min(buf.len());
            if n == 0 {
                return Ok(None);
            }
            self.discard_remaining -= n;
            return Ok(Some((n, Parsed::Pending)));
        }

        let slice = locate_frame(buf, self.codec.limits())?;
        let step = match slice {
            FrameSlice::Incomplete => return Ok(None),
            FrameSlice::Oversized {
                header_len,
                body_len,
            } => {
                self.discard_remaining = body_len;
                (
                    header_len,
                    Parsed::Rejected(FrameError::PayloadTooLarge {
                        size: body_len,
                        max: self.codec.limits().max_payload_size(),
                    }),
                )
            }
            FrameSlice::Simple { span, payload } => {
                let parsed = match self.codec.decode_payload(payload) {
                    Ok(message) => Parsed::Message(message),
                    Err(e) => Parsed::Rejected(e),
                };
                (span, parsed)
            }
            FrameSlice::Chunk {
                span,
                message_id,
                index,
                total,
                data,
            } => (span, self.accept_chunk(message_id, index, total, data)),
        };
        Ok(Some(step))
    }

    fn accept_chunk(&self, message_id: &[u8], index: u16, total: u16, data: &[u8]) -> Parsed {
        let Ok(message_id) = std::str::from_utf8(message_id) else {
            return Parsed::Rejected(FrameError::Malformed(
                "chunk message id is not UTF-8".to_string(),
            ));
        };

        match self.assembler.add_part(message_id, index, total, data) {
            Ok(Some(payload)) => match self.codec.decode_payload(&payload) {
                Ok(message) => Parsed::Message(message),
                Err(e) => Parsed::Rejected(e),
            },
            Ok(None) => Parsed::Pending,
            Err(e) => Parsed::Rejected(e),
        }
    }
}

/// What one scan produced.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Complete messages in wire order.
    pub messages: Vec<Message>,
    /// Bytes dropped from the buffer during this scan.
    pub consumed: usize,
    /// Frames dropped and chunked transfers evicted during this scan.
    pub rejected: Vec<FrameError>,
}

/// Drives frame decoding and chunk reassembly for one connection.
#[derive(Debug)]
pub struct FrameScanner {
    reader: FrameReader,
}

impl FrameScanner {
    pub fn new(codec: FrameCodec) -> Self {
        let assembler = Arc::new(ChunkAssembler::new(codec.limits()));
        Self::with_assembler(codec, assembler)
    }

    pub fn with_assembler(codec: FrameCodec, assembler: Arc<ChunkAssembler>) -> Self {
        Self {
            reader: FrameReader::new(codec, assembler),
        }
    }

    pub fn assembler(&self) -> &Arc<ChunkAssembler> {
        self.reader.assembler()
    }

    /// Drain every complete frame currently in `buffer`.
    ///
    /// Each consumed frame is committed with `drop_prefix` right away, so
    /// progress survives an early return. Incomplete trailing bytes are left
    /// in place for the next read. An error means the connection's stream is
    /// desynchronized and should be closed.
    pub fn scan(&mut self, buffer: &ConnectionBuffer) -> Result<ScanOutcome, FrameError> {
        let mut outcome = ScanOutcome {
            rejected: self.reader.assembler().evict_stale(),
            ..ScanOutcome::default()
        };

        let snapshot = buffer.snapshot();
        let mut offset = 0;

        while let Some((span, parsed)) = self.reader.step(&snapshot[offset..])? {
            buffer.drop_prefix(span);
            offset += span;
            outcome.consumed += span;

            match parsed {
                Parsed::Message(message) => {
                    debug!("Decoded message {} ({:?})", message.id, message.msg_type);
                    outcome.messages.push(message);
                }
                Parsed::Pending => {}
                Parsed::Rejected(e) => {
                    warn!("Dropping frame: {}", e);
                    outcome.rejected.push(e);
                }
            }
        }

        Ok(outcome)
    }

    /// Forget partial state when the connection closes.
    pub fn reset(&mut self) {
        self.reader.discard_remaining = 0;
        let dropped = self.reader.assembler().clear();
        if dropped > 0 {
            debug!(
                "Discarded {} pending chunked transfers (max payload {})",
                dropped,
                self.reader.limits().max_payload_size()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CHUNK_FLAG;

    fn msg(text: &str) -> Message {
        Message::clipboard(serde_json::json!({ "text": text }))
    }

    #[test]
    fn test_scan_multiple_frames() {
        let codec = FrameCodec::default();
        let mut scanner = FrameScanner::new(codec.clone());
        let buffer = ConnectionBuffer::new();

        let (a, b) = (msg("a"), msg("b"));
        buffer.append(&codec.encode(&a).unwrap());
        buffer.append(&codec.encode(&b).unwrap());

        let outcome = scanner.scan(&buffer).unwrap();
        assert_eq!(outcome.messages, vec![a, b]);
        assert!(buffer.is_empty());
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn test_scan_leaves_partial_frame() {
        let codec = FrameCodec::default();
        let mut scanner = FrameScanner::new(codec.clone());
        let buffer = ConnectionBuffer::new();

        let a = msg("complete");
        let b = codec.encode(&msg("partial")).unwrap();
        buffer.append(&codec.encode(&a).unwrap());
        buffer.append(&b[..b.len() - 3]);

        let outcome = scanner.scan(&buffer).unwrap();
        assert_eq!(outcome.messages, vec![a]);
        assert_eq!(&buffer.snapshot()[..], &b[..b.len() - 3]);

        buffer.append(&b[b.len() - 3..]);
        let outcome = scanner.scan(&buffer).unwrap();
        assert_eq!(outcome.messages.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_scan_malformed_frame_is_skipped() {
        let codec = FrameCodec::default();
        let mut scanner = FrameScanner::new(codec.clone());
        let buffer = ConnectionBuffer::new();

        let good = msg("after garbage");
        buffer.append(&codec.encode_payload(b"garbage").unwrap());
        buffer.append(&codec.encode(&good).unwrap());

        let outcome = scanner.scan(&buffer).unwrap();
        assert_eq!(outcome.messages, vec![good]);
        assert!(matches!(outcome.rejected[..], [FrameError::Malformed(_)]));
    }

    #[test]
    fn test_scan_discards_oversized_frame_and_resyncs() {
        let codec = FrameCodec::new(ProtocolLimits::new(512, 64).unwrap());
        let mut scanner = FrameScanner::new(codec.clone());
        let buffer = ConnectionBuffer::new();

        let mut oversized = 600u32.to_be_bytes().to_vec();
        oversized.extend_from_slice(&[0xAA; 600]);
        let good = codec.encode_payload(&msg("ok").to_bytes().unwrap()).unwrap();

        buffer.append(&oversized[..50]);
        let outcome = scanner.scan(&buffer).unwrap();
        assert!(outcome.messages.is_empty());
        assert!(matches!(
            outcome.rejected[..],
            [FrameError::PayloadTooLarge { size: 600, max: 512 }]
        ));

        buffer.append(&oversized[50..]);
        buffer.append(&good);
        let outcome = scanner.scan(&buffer).unwrap();
        assert_eq!(outcome.messages.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_scan_desync_is_an_error() {
        let mut scanner = FrameScanner::new(FrameCodec::default());
        let buffer = ConnectionBuffer::new();
        buffer.append(&[0x42, 0x42, 0x42, 0x42, 0x42]);

        assert!(matches!(scanner.scan(&buffer), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_partial_chunk_header_not_consumed() {
        let mut scanner = FrameScanner::new(FrameCodec::default());
        let buffer = ConnectionBuffer::new();
        buffer.append(&[CHUNK_FLAG, 0, 0, 0, 36, b'a', b'b']);

        let outcome = scanner.scan(&buffer).unwrap();
        assert_eq!(outcome.consumed, 0);
        assert_eq!(buffer.len(), 7);
    }

    #[test]
    fn test_reset_discards_pending_chunks() {
        let codec = FrameCodec::new(ProtocolLimits::new(4096, 32).unwrap());
        let mut scanner = FrameScanner::new(codec.clone());
        let buffer = ConnectionBuffer::new();

        let big = msg(&"x".repeat(200));
        let frames = codec.encode_chunked(&big, 32).unwrap();
        buffer.append(&frames[0]);
        scanner.scan(&buffer).unwrap();
        assert_eq!(scanner.assembler().pending_count(), 1);

        scanner.reset();
        assert_eq!(scanner.assembler().pending_count(), 0);
    }

    #[test]
    fn test_scan_reports_stale_transfers() {
        let limits = ProtocolLimits::default();
        let assembler = Arc::new(ChunkAssembler::new(&limits));
        let codec = FrameCodec::new(limits.clone());
        let mut scanner = FrameScanner::with_assembler(codec.clone(), assembler.clone());
        let buffer = ConnectionBuffer::new();

        let long_ago = std::time::Instant::now()
            .checked_sub(limits.chunk_stale_after() * 2)
            .unwrap();
        assembler.add_part_at("stalled", 1, 3, b"middle", long_ago).unwrap();

        let fresh = msg("still flowing");
        buffer.append(&codec.encode(&fresh).unwrap());
        let outcome = scanner.scan(&buffer).unwrap();

        assert_eq!(outcome.messages, vec![fresh]);
        assert!(matches!(
            &outcome.rejected[..],
            [FrameError::ChunkTimeout { message_id, received: 1, total: 3 }] if message_id == "stalled"
        ));
        assert_eq!(scanner.assembler().pending_count(), 0);
    }
}

//! `tokio_util` codec over the same framing, for streams owned by a single
//! task (no shared [`ConnectionBuffer`](crate::ConnectionBuffer) needed).

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::config::ProtocolLimits;
use crate::error::TransportError;
use crate::frame::FrameCodec;
use crate::reassembly::ChunkAssembler;
use crate::scanner::{FrameReader, Parsed};
use crate::types::Message;

/// Message codec for `Framed`, `FramedRead` and `FramedWrite`.
///
/// Encoding chunks messages larger than the configured chunk size.
/// Decoding reassembles chunks and skips frames that fail to decode.
#[derive(Debug)]
pub struct MessageCodec {
    frames: FrameCodec,
    reader: FrameReader,
}

impl MessageCodec {
    pub fn new(limits: ProtocolLimits) -> Self {
        let assembler = Arc::new(ChunkAssembler::new(&limits));
        Self::with_assembler(limits, assembler)
    }

    /// Decode into an existing assembler.
    pub fn with_assembler(limits: ProtocolLimits, assembler: Arc<ChunkAssembler>) -> Self {
        let frames = FrameCodec::new(limits);
        Self {
            reader: FrameReader::new(frames.clone(), assembler),
            frames,
        }
    }

    /// Number of chunked messages waiting for more parts.
    pub fn pending_chunked(&self) -> usize {
        self.reader.assembler().pending_count()
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(ProtocolLimits::default())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TransportError> {
        // evicted transfers are logged by the assembler
        self.reader.assembler().evict_stale();

        while let Some((span, parsed)) = self.reader.step(&src[..])? {
            src.advance(span);
            match parsed {
                Parsed::Message(message) => return Ok(Some(message)),
                Parsed::Pending => {}
                Parsed::Rejected(e) => warn!("Dropping frame: {}", e),
            }
        }
        Ok(None)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), TransportError> {
        let chunk_size = self.frames.limits().chunk_size();
        for frame in self.frames.encode_chunked(&item, chunk_size)? {
            dst.extend_from_slice(&frame);
        }
        Ok(())
    }
}

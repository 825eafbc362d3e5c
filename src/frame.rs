//! Frame encoding and decoding.
//!
//! Two frame variants share the wire:
//!
//! ```text
//! simple: [len: u32 BE][payload: len bytes]
//! chunk:  [0x01][id_len: u32 BE][id][index: u16 BE][total: u16 BE][chunk_len: u32 BE][chunk]
//! ```
//!
//! `max_payload_size` is validated below 2^24, so a simple frame always
//! starts with `0x00` and the first byte alone tells the variants apart.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::config::ProtocolLimits;
use crate::error::FrameError;
use crate::types::Message;

/// Size of the simple frame length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Leading byte of a chunk frame.
pub const CHUNK_FLAG: u8 = 0x01;

/// Chunk frame header size without the message id.
pub const CHUNK_HEADER_LEN: usize = 1 + 4 + 2 + 2 + 4;

/// Longest message id accepted in a chunk frame.
pub const MAX_MESSAGE_ID_LEN: usize = 256;

/// Stateless frame codec. Cheap to clone and safe to share.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    limits: ProtocolLimits,
}

impl FrameCodec {
    pub fn new(limits: ProtocolLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ProtocolLimits {
        &self.limits
    }

    /// Encode a message as one simple frame.
    pub fn encode(&self, message: &Message) -> Result<Bytes, FrameError> {
        let payload = message.to_bytes()?;
        self.encode_payload(&payload)
    }

    /// Frame an already-serialized payload.
    pub fn encode_payload(&self, payload: &[u8]) -> Result<Bytes, FrameError> {
        self.check_size(payload.len())?;

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Encode a message, splitting it into chunk frames of at most
    /// `chunk_size` bytes when it does not fit in one chunk.
    pub fn encode_chunked(&self, message: &Message, chunk_size: usize) -> Result<Vec<Bytes>, FrameError> {
        let payload = message.to_bytes()?;
        self.chunk_payload(&message.id.to_string(), &payload, chunk_size)
    }

    /// Chunk an already-serialized payload under `message_id`.
    ///
    /// Payloads that fit in one chunk come back as a single simple frame.
    pub fn chunk_payload(
        &self,
        message_id: &str,
        payload: &[u8],
        chunk_size: usize,
    ) -> Result<Vec<Bytes>, FrameError> {
        if chunk_size == 0 {
            return Err(FrameError::InvalidChunkSize);
        }
        if payload.len() <= chunk_size {
            return Ok(vec![self.encode_payload(payload)?]);
        }
        self.check_size(payload.len())?;
        if message_id.is_empty() || message_id.len() > MAX_MESSAGE_ID_LEN {
            return Err(FrameError::Malformed(format!(
                "message id length {} outside 1..={}",
                message_id.len(),
                MAX_MESSAGE_ID_LEN
            )));
        }

        let chunks = payload.len().div_ceil(chunk_size);
        if chunks > u16::MAX as usize {
            return Err(FrameError::TooManyChunks { chunks });
        }
        let total = chunks as u16;
        let id = message_id.as_bytes();

        let frames: Vec<Bytes> = payload
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + id.len() + chunk.len());
                buf.put_u8(CHUNK_FLAG);
                buf.put_u32(id.len() as u32);
                buf.put_slice(id);
                buf.put_u16(index as u16);
                buf.put_u16(total);
                buf.put_u32(chunk.len() as u32);
                buf.put_slice(chunk);
                buf.freeze()
            })
            .collect();

        debug!(
            "Chunked message {} ({} bytes) into {} frames",
            message_id,
            payload.len(),
            frames.len()
        );
        Ok(frames)
    }

    /// Decode one complete simple frame.
    pub fn decode(&self, frame: &[u8]) -> Result<Message, FrameError> {
        if frame.len() < LENGTH_PREFIX_LEN {
            return Err(FrameError::Truncated {
                needed: LENGTH_PREFIX_LEN,
                available: frame.len(),
            });
        }
        let len = BigEndian::read_u32(&frame[..LENGTH_PREFIX_LEN]) as usize;
        self.check_size(len)?;

        let end = LENGTH_PREFIX_LEN + len;
        if frame.len() < end {
            return Err(FrameError::Truncated {
                needed: end,
                available: frame.len(),
            });
        }
        self.decode_payload(&frame[LENGTH_PREFIX_LEN..end])
    }

    /// Deserialize an unframed payload, e.g. one produced by reassembly.
    pub fn decode_payload(&self, payload: &[u8]) -> Result<Message, FrameError> {
        self.check_size(payload.len())?;
        Message::from_bytes(payload)
    }

    fn check_size(&self, size: usize) -> Result<(), FrameError> {
        if size > self.limits.max_payload_size() {
            return Err(FrameError::PayloadTooLarge {
                size,
                max: self.limits.max_payload_size(),
            });
        }
        Ok(())
    }
}

/// One frame located at the start of a byte slice.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FrameSlice<'a> {
    /// Not enough bytes to delimit the next frame.
    Incomplete,
    Simple {
        span: usize,
        payload: &'a [u8],
    },
    Chunk {
        span: usize,
        message_id: &'a [u8],
        index: u16,
        total: u16,
        data: &'a [u8],
    },
    /// A delimitable frame whose body exceeds the ceiling. The header is
    /// `header_len` bytes, followed by `body_len` bytes to discard.
    Oversized {
        header_len: usize,
        body_len: usize,
    },
}

/// Locate the frame at the start of `buf` without copying.
///
/// An error means the stream cannot be delimited any more.
pub(crate) fn locate_frame<'a>(buf: &'a [u8], limits: &ProtocolLimits) -> Result<FrameSlice<'a>, FrameError> {
    if buf.len() < LENGTH_PREFIX_LEN {
        return Ok(FrameSlice::Incomplete);
    }

    match buf[0] {
        CHUNK_FLAG => locate_chunk(buf, limits),
        0x00 => {
            let len = BigEndian::read_u32(&buf[..LENGTH_PREFIX_LEN]) as usize;
            if len > limits.max_payload_size() {
                return Ok(FrameSlice::Oversized {
                    header_len: LENGTH_PREFIX_LEN,
                    body_len: len,
                });
            }
            let span = LENGTH_PREFIX_LEN + len;
            if buf.len() < span {
                return Ok(FrameSlice::Incomplete);
            }
            Ok(FrameSlice::Simple {
                span,
                payload: &buf[LENGTH_PREFIX_LEN..span],
            })
        }
        other => Err(FrameError::Malformed(format!(
            "unexpected leading byte 0x{:02x}",
            other
        ))),
    }
}

fn locate_chunk<'a>(buf: &'a [u8], limits: &ProtocolLimits) -> Result<FrameSlice<'a>, FrameError> {
    if buf.len() < 5 {
        return Ok(FrameSlice::Incomplete);
    }
    let id_len = BigEndian::read_u32(&buf[1..5]) as usize;
    if id_len == 0 || id_len > MAX_MESSAGE_ID_LEN {
        return Err(FrameError::Malformed(format!(
            "chunk message id length {} outside 1..={}",
            id_len, MAX_MESSAGE_ID_LEN
        )));
    }

    let header_len = CHUNK_HEADER_LEN + id_len;
    if buf.len() < header_len {
        return Ok(FrameSlice::Incomplete);
    }
    let id_end = 5 + id_len;
    let index = BigEndian::read_u16(&buf[id_end..id_end + 2]);
    let total = BigEndian::read_u16(&buf[id_end + 2..id_end + 4]);
    let chunk_len = BigEndian::read_u32(&buf[id_end + 4..header_len]) as usize;

    if chunk_len > limits.max_payload_size() {
        return Ok(FrameSlice::Oversized {
            header_len,
            body_len: chunk_len,
        });
    }
    let span = header_len + chunk_len;
    if buf.len() < span {
        return Ok(FrameSlice::Incomplete);
    }
    Ok(FrameSlice::Chunk {
        span,
        message_id: &buf[5..id_end],
        index,
        total,
        data: &buf[header_len..span],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_codec(max: usize, chunk: usize) -> FrameCodec {
        FrameCodec::new(ProtocolLimits::new(max, chunk).unwrap())
    }

    #[test]
    fn test_encode_ten_byte_payload() {
        let codec = FrameCodec::default();
        let frame = codec.encode_payload(b"0123456789").unwrap();

        assert_eq!(frame.len(), 14);
        assert_eq!(&frame[..4], &[0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(&frame[4..], b"0123456789");
    }

    #[test]
    fn test_size_ceiling() {
        let codec = small_codec(64, 16);

        assert!(codec.encode_payload(&[7u8; 64]).is_ok());
        assert_eq!(
            codec.encode_payload(&[7u8; 65]),
            Err(FrameError::PayloadTooLarge { size: 65, max: 64 })
        );
    }

    #[test]
    fn test_message_roundtrip() {
        let codec = FrameCodec::default();
        let msg = Message::clipboard(serde_json::json!({"text": "hello"}));

        let frame = codec.encode(&msg).unwrap();
        assert_eq!(codec.decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_decode_truncated() {
        let codec = FrameCodec::default();
        let msg = Message::clipboard(serde_json::json!({"text": "hello"}));
        let frame = codec.encode(&msg).unwrap();

        assert!(matches!(codec.decode(&frame[..3]), Err(FrameError::Truncated { .. })));
        assert_eq!(
            codec.decode(&frame[..frame.len() - 1]),
            Err(FrameError::Truncated {
                needed: frame.len(),
                available: frame.len() - 1
            })
        );
    }

    #[test]
    fn test_decode_declared_too_large() {
        let codec = small_codec(64, 16);
        let mut frame = vec![0x00, 0x00, 0x00, 65];
        frame.extend_from_slice(&[0u8; 65]);

        assert_eq!(
            codec.decode(&frame),
            Err(FrameError::PayloadTooLarge { size: 65, max: 64 })
        );
    }

    #[test]
    fn test_decode_malformed() {
        let codec = FrameCodec::default();
        let frame = codec.encode_payload(b"{not json").unwrap();
        assert!(matches!(codec.decode(&frame), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_chunk_layout() {
        let codec = small_codec(1024, 4);
        let frames = codec.chunk_payload("X", b"abcdefghij", 4).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(
            &frames[0][..],
            &[0x01, 0, 0, 0, 1, b'X', 0, 0, 0, 3, 0, 0, 0, 4, b'a', b'b', b'c', b'd']
        );
        // last chunk is short
        assert_eq!(&frames[2][CHUNK_HEADER_LEN + 1 - 4..CHUNK_HEADER_LEN + 1], &[0, 0, 0, 2]);
        assert_eq!(&frames[2][CHUNK_HEADER_LEN + 1..], b"ij");
    }

    #[test]
    fn test_chunked_fits_one_chunk_is_simple_frame() {
        let codec = FrameCodec::default();
        let msg = Message::clipboard(serde_json::json!({"text": "small"}));

        let frames = codec.encode_chunked(&msg, 51_200).unwrap();
        assert_eq!(frames, vec![codec.encode(&msg).unwrap()]);
    }

    #[test]
    fn test_chunked_rejects_zero_chunk_size() {
        let codec = FrameCodec::default();
        assert_eq!(
            codec.chunk_payload("id", b"abc", 0),
            Err(FrameError::InvalidChunkSize)
        );
    }

    #[test]
    fn test_too_many_chunks() {
        let codec = small_codec(100_000, 1);
        let payload = vec![1u8; 70_000];
        assert_eq!(
            codec.chunk_payload("id", &payload, 1),
            Err(FrameError::TooManyChunks { chunks: 70_000 })
        );
    }

    #[test]
    fn test_locate_incomplete_and_complete() {
        let limits = ProtocolLimits::default();
        let codec = FrameCodec::default();
        let frame = codec.encode_payload(b"abc").unwrap();

        for cut in 0..frame.len() {
            assert_eq!(locate_frame(&frame[..cut], &limits), Ok(FrameSlice::Incomplete));
        }
        assert_eq!(
            locate_frame(&frame, &limits),
            Ok(FrameSlice::Simple { span: 7, payload: b"abc" })
        );
    }

    #[test]
    fn test_locate_rejects_undelimitable_input() {
        let limits = ProtocolLimits::default();
        assert!(locate_frame(&[0x7f, 0, 0, 0], &limits).is_err());
        // chunk frame with an empty message id
        assert!(locate_frame(&[CHUNK_FLAG, 0, 0, 0, 0], &limits).is_err());
    }
}

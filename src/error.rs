//! Error types for the framing protocol and the transports built on it.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while encoding, decoding or reassembling frames.
///
/// These are local to one frame or one message: the read loop logs them and
/// keeps going, they never tear down a connection on their own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Not enough bytes yet. A "need more data" signal, never surfaced to
    /// message listeners.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("chunk count mismatch for {message_id}: expected {expected}, got {actual}")]
    ChunkCountMismatch {
        message_id: String,
        expected: u16,
        actual: u16,
    },

    #[error("invalid chunk index {index} for {message_id} ({total} chunks)")]
    InvalidChunkIndex {
        message_id: String,
        index: u16,
        total: u16,
    },

    #[error("message needs {chunks} chunks (max: {})", u16::MAX)]
    TooManyChunks { chunks: usize },

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("chunked transfer {message_id} timed out with {received}/{total} chunks")]
    ChunkTimeout {
        message_id: String,
        received: usize,
        total: u16,
    },
}

/// Errors surfaced by transports, configuration and storage.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport is already connected")]
    AlreadyConnected,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using [`TransportError`].
pub type Result<T> = std::result::Result<T, TransportError>;

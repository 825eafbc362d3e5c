//! # hypo-transport
//!
//! Framing, chunked transfer and connection handling for clipboard sync
//! between devices, over the local network or through a cloud relay.
//!
//! ## Quick Start
//!
//! ```rust
//! use hypo_transport::{FrameCodec, Message};
//!
//! let codec = FrameCodec::default();
//! let message = Message::clipboard(serde_json::json!({ "text": "Hello" }));
//!
//! // Encode to a length-prefixed frame
//! let frame = codec.encode(&message)?;
//! assert_eq!(frame[0], 0x00);
//!
//! // Decode it back
//! let decoded = codec.decode(&frame)?;
//! assert_eq!(decoded, message);
//! # Ok::<(), hypo_transport::FrameError>(())
//! ```
//!
//! ## Wire Format
//!
//! Messages travel as JSON payloads inside one of two frame variants:
//!
//! - **Simple frame**: `LEN (4B BE)` followed by `LEN` payload bytes
//! - **Chunk frame**: `0x01`, `ID_LEN (4B BE)`, `ID`, `INDEX (2B BE)`,
//!   `TOTAL (2B BE)`, `CHUNK_LEN (4B BE)`, `CHUNK`
//!
//! Where:
//! - **LEN** is at most `max_payload_size`, which is always below 2^24, so
//!   a simple frame starts with `0x00`
//! - **ID** is the message id in UTF-8, at most 256 bytes
//! - **INDEX** / **TOTAL** number the chunks of one message; chunks may
//!   arrive in any order and interleave with other messages
//!
//! A message whose serialized form exceeds `chunk_size` is sent as chunk
//! frames; anything else as a single simple frame.
//!
//! ## Transports
//!
//! - [`ClientTransport`]: one connection to a LAN peer or the cloud relay
//! - [`LanServer`]: accepts LAN peers and broadcasts to all of them
//! - [`TransportManager`]: resolves the stored preference to a transport
//!
//! Every transport keeps one [`ConnectionBuffer`], [`FrameScanner`] and
//! [`ChunkAssembler`] per connection and hands decoded messages to the
//! listeners registered with [`Transport::on_message`].

pub mod auth;
pub mod buffer;
pub mod capabilities;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod reassembly;
pub mod scanner;
pub mod status;
pub mod storage;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use buffer::ConnectionBuffer;
pub use codec::MessageCodec;
pub use config::{ProtocolLimits, TransportConfiguration};
pub use error::{FrameError, Result, TransportError};
pub use frame::FrameCodec;
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use reassembly::ChunkAssembler;
pub use scanner::{FrameScanner, ScanOutcome};
pub use storage::Storage;
pub use transport::{
    ClientRole, ClientTransport, Dialer, LanServer, ListenerHandle, MessageCallback, Transport,
    TransportManager, TransportPreference,
};
pub use types::{ConnectedPeer, ConnectionId, Message, MessageType, Origin};

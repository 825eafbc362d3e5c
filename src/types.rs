//! Core types: the application message, connection identities and peers.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::FrameError;

/// Version string stamped on every message this crate creates.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Header carrying the sender's device identifier.
pub const DEVICE_ID_HEADER: &str = "X-Device-Id";

const HANDSHAKE_ACTION: &str = "handshake";

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Clipboard,
    Control,
}

/// An application message.
///
/// The transport layer only cares about `id` (chunk frames are keyed by it)
/// and the serialized size. `payload` is carried as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub payload: Value,
}

impl Message {
    /// Create a message with a fresh id and the current time.
    pub fn new(msg_type: MessageType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: PROTOCOL_VERSION.to_string(),
            msg_type,
            payload,
        }
    }

    pub fn clipboard(payload: Value) -> Self {
        Self::new(MessageType::Clipboard, payload)
    }

    pub fn control(payload: Value) -> Self {
        Self::new(MessageType::Control, payload)
    }

    /// Serialize to the wire payload representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        serde_json::to_vec(self).map_err(|e| FrameError::Malformed(e.to_string()))
    }

    /// Parse a wire payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        serde_json::from_slice(bytes).map_err(|e| FrameError::Malformed(e.to_string()))
    }

    /// Build the handshake control message a client sends right after
    /// connecting.
    pub fn handshake(headers: &HashMap<String, String>) -> Self {
        Self::control(serde_json::json!({
            "action": HANDSHAKE_ACTION,
            "headers": headers,
        }))
    }

    /// Returns the handshake headers if this is a handshake message.
    pub fn handshake_headers(&self) -> Option<HashMap<String, String>> {
        if self.msg_type != MessageType::Control {
            return None;
        }
        if self.payload.get("action").and_then(Value::as_str) != Some(HANDSHAKE_ACTION) {
            return None;
        }
        let headers = self.payload.get("headers")?.as_object()?;
        Some(
            headers
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect(),
        )
    }
}

/// Identifier of one live connection.
pub type ConnectionId = u64;

/// The logical connection a message arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The peer this device dialed on the local network.
    LanClient,
    /// An inbound connection accepted by this device's LAN server.
    LanServer(ConnectionId),
    /// The cloud relay.
    CloudRelay,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::LanClient => write!(f, "lan-client"),
            Origin::LanServer(id) => write!(f, "lan-server#{}", id),
            Origin::CloudRelay => write!(f, "cloud-relay"),
        }
    }
}

/// A peer connected to the LAN server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectedPeer {
    pub device_id: String,
    pub name: Option<String>,
}

/// Look up a header case-insensitively.
pub(crate) fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

//! Platform capabilities the transports rely on, as injectable traits.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::Result;
use crate::transport::{ListenerHandle, Transport};
use crate::types::{Message, MessageType, Origin};

/// A service advertised or found on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub device_id: String,
    pub name: Option<String>,
    /// `host:port` to dial.
    pub endpoint: String,
}

/// LAN service discovery (mDNS or similar).
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn publish(&self, record: ServiceRecord) -> Result<()>;
    async fn resolve(&self, device_id: &str) -> Result<Option<ServiceRecord>>;
}

/// The local clipboard.
pub trait Clipboard: Send + Sync {
    fn read(&self) -> Option<String>;
    fn write(&self, text: &str);
}

/// Moves clipboard text between a [`Clipboard`] and a [`Transport`].
pub struct ClipboardBridge {
    clipboard: Arc<dyn Clipboard>,
    transport: Arc<dyn Transport>,
}

impl ClipboardBridge {
    pub fn new(clipboard: Arc<dyn Clipboard>, transport: Arc<dyn Transport>) -> Self {
        Self {
            clipboard,
            transport,
        }
    }

    /// Send the current clipboard text. Returns `false` if it was empty.
    pub async fn push_local(&self) -> Result<bool> {
        let Some(text) = self.clipboard.read() else {
            return Ok(false);
        };
        let message = Message::clipboard(json!({ "content_type": "text", "text": text }));
        debug!("Pushing clipboard as message {}", message.id);
        self.transport.send(&message).await?;
        Ok(true)
    }

    /// Write incoming clipboard text to the local clipboard.
    pub fn attach(&self) -> ListenerHandle {
        let clipboard = self.clipboard.clone();
        self.transport
            .on_message(Arc::new(move |message: &Message, origin: Origin| {
                if message.msg_type != MessageType::Clipboard {
                    return;
                }
                match message.payload.get("text").and_then(|t| t.as_str()) {
                    Some(text) => clipboard.write(text),
                    None => warn!("Clipboard message {} from {} has no text", message.id, origin),
                }
            }))
    }

    pub fn detach(&self, handle: ListenerHandle) -> bool {
        self.transport.remove_listener(handle)
    }
}

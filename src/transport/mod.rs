//! Transports: the capability trait, listener registry and socket seam.
//!
//! - [`ClientTransport`] dials one endpoint, either a LAN peer or the cloud
//!   relay.
//! - [`LanServer`] accepts many LAN peers and broadcasts to them.
//! - [`TransportManager`] picks which one the application uses.

pub mod client;
pub mod manager;
pub mod server;

pub use client::{ClientRole, ClientTransport, TcpDialer};
pub use manager::{
    MemoryPreferenceStore, PreferenceStore, StoragePreferenceStore, TransportManager,
    TransportPreference, TransportProvider,
};
pub use server::LanServer;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::debug;

use crate::buffer::ConnectionBuffer;
use crate::config::TransportConfiguration;
use crate::error::{Result, TransportError};
use crate::scanner::{FrameScanner, ScanOutcome};
use crate::types::{Message, Origin};

/// Pause between disconnect and connect in [`Transport::reconnect`], so the
/// old socket is released before a new one is bound.
pub const RECONNECT_GRACE: Duration = Duration::from_millis(250);

/// Size of one socket read.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Callback receiving every inbound message.
pub type MessageCallback = Arc<dyn Fn(&Message, Origin) + Send + Sync>;

/// Opaque handle returned by listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// Registered message listeners, invoked in registration order.
#[derive(Default)]
pub struct Listeners {
    next_handle: AtomicU64,
    entries: RwLock<Vec<(ListenerHandle, MessageCallback)>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: MessageCallback) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((handle, callback));
        handle
    }

    /// Remove a listener. Returns whether the handle was registered.
    pub fn unregister(&self, handle: ListenerHandle) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(h, _)| *h != handle);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every listener synchronously.
    ///
    /// The list is copied first, so a callback may register or unregister
    /// without deadlocking.
    pub fn dispatch(&self, message: &Message, origin: Origin) {
        let callbacks: Vec<MessageCallback> =
            self.entries.read().iter().map(|(_, cb)| cb.clone()).collect();
        debug!(
            "Dispatching message {} from {} to {} listeners",
            message.id,
            origin,
            callbacks.len()
        );
        for callback in callbacks {
            callback(message, origin);
        }
    }
}

/// A connection-oriented message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection (client) or start listening (server).
    /// Fails with `AlreadyConnected` if already up.
    async fn connect(&self) -> Result<()>;

    /// Frame and write a message. Fails with `NotConnected` if down.
    async fn send(&self, message: &Message) -> Result<()>;

    /// Tear everything down. Safe to call when already disconnected.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn listeners(&self) -> &Listeners;

    fn on_message(&self, callback: MessageCallback) -> ListenerHandle {
        self.listeners().register(callback)
    }

    fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners().unregister(handle)
    }

    /// Disconnect, wait [`RECONNECT_GRACE`], connect again. No retries.
    async fn reconnect(&self) -> Result<()> {
        self.disconnect().await?;
        tokio::time::sleep(RECONNECT_GRACE).await;
        self.connect().await
    }
}

/// Byte stream produced by a [`Dialer`].
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedSocket = Box<dyn Socket>;

/// Opens the underlying socket for a client transport.
///
/// TLS, WebSocket upgrades and certificate pinning belong to the dialer;
/// the transport only sees a byte stream.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, config: &TransportConfiguration) -> io::Result<BoxedSocket>;
}

/// Read from `reader` until EOF, feeding the connection buffer and handing
/// the outcome of each scan to `handle`.
///
/// Frame-level errors are dropped inside the scanner and show up in
/// [`ScanOutcome::rejected`]. A desynchronized stream or a socket error ends
/// the loop with an error.
pub(crate) async fn pump_inbound<R, F>(
    mut reader: R,
    buffer: &ConnectionBuffer,
    scanner: &mut FrameScanner,
    mut handle: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(ScanOutcome),
{
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.append(&chunk[..n]);

        let outcome = scanner.scan(buffer).map_err(TransportError::Frame)?;
        handle(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn msg() -> Message {
        Message::clipboard(serde_json::json!({"text": "x"}))
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let listeners = Listeners::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let calls = calls.clone();
            listeners.register(Arc::new(move |_, _| calls.lock().push(tag)));
        }
        listeners.dispatch(&msg(), Origin::CloudRelay);

        assert_eq!(*calls.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unregister_by_handle() {
        let listeners = Listeners::new();
        let calls = Arc::new(Mutex::new(0));

        let counter = calls.clone();
        let handle = listeners.register(Arc::new(move |_, _| *counter.lock() += 1));
        // an identical closure registered twice still gets its own handle
        let counter = calls.clone();
        let other = listeners.register(Arc::new(move |_, _| *counter.lock() += 1));
        assert_ne!(handle, other);

        assert!(listeners.unregister(handle));
        assert!(!listeners.unregister(handle));
        listeners.dispatch(&msg(), Origin::LanClient);

        assert_eq!(*calls.lock(), 1);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_callback_may_unregister_itself() {
        let listeners = Arc::new(Listeners::new());
        let slot = Arc::new(Mutex::new(None));

        let (inner, inner_slot) = (listeners.clone(), slot.clone());
        let handle = listeners.register(Arc::new(move |_, _| {
            if let Some(h) = inner_slot.lock().take() {
                inner.unregister(h);
            }
        }));
        *slot.lock() = Some(handle);

        listeners.dispatch(&msg(), Origin::LanServer(1));
        assert!(listeners.is_empty());
    }
}

//! Client role: one connection to a LAN peer or to the cloud relay.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use parking_lot::Mutex;
use tokio::io::{split, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{BytesCodec, FramedWrite};
use tracing::{debug, info, warn};
use url::Url;

use super::{pump_inbound, BoxedSocket, Dialer, Listeners, Transport};
use crate::buffer::ConnectionBuffer;
use crate::config::{ProtocolLimits, TransportConfiguration};
use crate::error::{Result, TransportError};
use crate::frame::FrameCodec;
use crate::reassembly::ChunkAssembler;
use crate::scanner::FrameScanner;
use crate::types::{ConnectionId, Message, Origin};

/// Which logical path a client transport serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    /// Dialing a peer discovered on the local network.
    Lan,
    /// Dialing the cloud relay.
    Relay,
}

impl ClientRole {
    pub fn origin(self) -> Origin {
        match self {
            ClientRole::Lan => Origin::LanClient,
            ClientRole::Relay => Origin::CloudRelay,
        }
    }
}

/// Plain TCP dialer for LAN peers.
///
/// Accepts `host:port` or a URL such as `tcp://host:port`. Certificate
/// pinning is left to TLS-capable dialers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, config: &TransportConfiguration) -> io::Result<BoxedSocket> {
        let addr = socket_address(config.endpoint())?;
        if config.pinned_fingerprint().is_some() {
            debug!("TcpDialer does not use TLS; ignoring pinned fingerprint for {}", addr);
        }
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Resolve an endpoint string to a `host:port` pair.
pub(crate) fn socket_address(endpoint: &str) -> io::Result<String> {
    if !endpoint.contains("://") {
        return Ok(endpoint.to_string());
    }
    let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidInput, msg);
    let url = Url::parse(endpoint).map_err(|e| invalid(format!("{}: {}", endpoint, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| invalid(format!("{}: missing host", endpoint)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid(format!("{}: missing port", endpoint)))?;
    Ok(format!("{}:{}", host, port))
}

struct ActiveConnection {
    id: ConnectionId,
    writer: FramedWrite<WriteHalf<BoxedSocket>, BytesCodec>,
    alive: Arc<AtomicBool>,
    buffer: Arc<ConnectionBuffer>,
    assembler: Arc<ChunkAssembler>,
    reader: JoinHandle<()>,
}

impl ActiveConnection {
    /// Stop reading and drop inbound state. The writer is left for
    /// `disconnect` or the next `connect` to discard.
    fn mark_broken(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.buffer.close();
        self.assembler.clear();
    }
}

/// Client side of a LAN or relay connection.
pub struct ClientTransport {
    role: ClientRole,
    config: TransportConfiguration,
    codec: FrameCodec,
    dialer: Arc<dyn Dialer>,
    listeners: Arc<Listeners>,
    active: tokio::sync::Mutex<Option<ActiveConnection>>,
    alive: Mutex<Option<Arc<AtomicBool>>>,
    next_connection_id: AtomicU64,
}

impl ClientTransport {
    pub fn new(
        role: ClientRole,
        config: TransportConfiguration,
        limits: ProtocolLimits,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            role,
            config,
            codec: FrameCodec::new(limits),
            dialer,
            listeners: Arc::new(Listeners::new()),
            active: tokio::sync::Mutex::new(None),
            alive: Mutex::new(None),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// LAN client over plain TCP with default limits.
    pub fn lan(config: TransportConfiguration) -> Self {
        Self::new(ClientRole::Lan, config, ProtocolLimits::default(), Arc::new(TcpDialer))
    }

    /// Relay client over a caller-supplied dialer (WebSocket, TLS, ...).
    pub fn relay(config: TransportConfiguration, dialer: Arc<dyn Dialer>) -> Self {
        Self::new(ClientRole::Relay, config, ProtocolLimits::default(), dialer)
    }

    pub fn role(&self) -> ClientRole {
        self.role
    }

    pub fn config(&self) -> &TransportConfiguration {
        &self.config
    }

    /// Id of the live connection, if any.
    pub async fn connection_id(&self) -> Option<ConnectionId> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|c| c.alive.load(Ordering::SeqCst))
            .map(|c| c.id)
    }

    /// Write and flush `frames`. A failed or timed-out write may leave part
    /// of a chunked transfer on the wire, so the connection is closed and
    /// the caller has to reconnect.
    async fn write_frames(&self, conn: &mut ActiveConnection, frames: Vec<Bytes>) -> Result<()> {
        let timeout = self.config.idle_timeout();
        let write = async {
            for frame in frames {
                conn.writer.feed(frame).await?;
            }
            SinkExt::<Bytes>::flush(&mut conn.writer).await
        };
        let error = match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => TransportError::Io(e),
            Err(_) => TransportError::Timeout(timeout),
        };
        warn!("Write on connection {} failed, closing it: {}", conn.id, error);
        conn.mark_broken();
        Err(error)
    }
}

#[async_trait]
impl Transport for ClientTransport {
    async fn connect(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(conn) = active.as_ref() {
            if conn.alive.load(Ordering::SeqCst) {
                return Err(TransportError::AlreadyConnected);
            }
        }
        if let Some(stale) = active.take() {
            stale.reader.abort();
        }

        let timeout = self.config.idle_timeout();
        let socket = tokio::time::timeout(timeout, self.dialer.dial(&self.config))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("{}: {}", self.config.endpoint(), e))
            })?;

        let (read_half, write_half) = split(socket);
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(AtomicBool::new(true));
        let buffer = Arc::new(ConnectionBuffer::new());
        let assembler = Arc::new(ChunkAssembler::new(self.codec.limits()));

        let reader = {
            let origin = self.role.origin();
            let listeners = self.listeners.clone();
            let alive = alive.clone();
            let buffer = buffer.clone();
            let mut scanner = FrameScanner::with_assembler(self.codec.clone(), assembler.clone());
            tokio::spawn(async move {
                let result = pump_inbound(read_half, &buffer, &mut scanner, |outcome| {
                    for message in &outcome.messages {
                        listeners.dispatch(message, origin);
                    }
                })
                .await;
                match result {
                    Ok(()) => info!("{} connection {} closed by peer", origin, id),
                    Err(e) => warn!("{} connection {} read error: {}", origin, id, e),
                }
                alive.store(false, Ordering::SeqCst);
                buffer.close();
                scanner.reset();
            })
        };

        let mut conn = ActiveConnection {
            id,
            writer: FramedWrite::new(write_half, BytesCodec::new()),
            alive: alive.clone(),
            buffer,
            assembler,
            reader,
        };

        let handshake = self.codec.encode(&Message::handshake(self.config.headers()))?;
        if let Err(e) = self.write_frames(&mut conn, vec![handshake]).await {
            conn.reader.abort();
            return Err(e);
        }

        info!(
            "{} connected to {} (connection {})",
            self.role.origin(),
            self.config.endpoint(),
            id
        );
        *active = Some(conn);
        *self.alive.lock() = Some(alive);
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let mut active = self.active.lock().await;
        let conn = match active.as_mut() {
            Some(conn) if conn.alive.load(Ordering::SeqCst) => conn,
            _ => return Err(TransportError::NotConnected),
        };

        let frames = self
            .codec
            .encode_chunked(message, self.codec.limits().chunk_size())?;
        debug!(
            "Sending message {} as {} frame(s) on connection {}",
            message.id,
            frames.len(),
            conn.id
        );
        self.write_frames(conn, frames).await
    }

    async fn disconnect(&self) -> Result<()> {
        let conn = self.active.lock().await.take();
        *self.alive.lock() = None;

        let Some(mut conn) = conn else {
            return Ok(());
        };
        conn.mark_broken();
        if let Err(e) = SinkExt::<Bytes>::close(&mut conn.writer).await {
            debug!("Error closing connection {}: {}", conn.id, e);
        }
        info!("{} disconnected (connection {})", self.role.origin(), conn.id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.alive
            .lock()
            .as_ref()
            .is_some_and(|alive| alive.load(Ordering::SeqCst))
    }

    fn listeners(&self) -> &Listeners {
        &self.listeners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_address() {
        assert_eq!(socket_address("192.168.1.4:7010").unwrap(), "192.168.1.4:7010");
        assert_eq!(socket_address("tcp://10.0.0.2:7010").unwrap(), "10.0.0.2:7010");
        assert_eq!(
            socket_address("wss://relay.example.com/ws").unwrap(),
            "relay.example.com:443"
        );
        assert!(socket_address("tcp://peer.local").is_err());
    }

    #[test]
    fn test_role_origin() {
        assert_eq!(ClientRole::Lan.origin(), Origin::LanClient);
        assert_eq!(ClientRole::Relay.origin(), Origin::CloudRelay);
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let client = ClientTransport::lan(TransportConfiguration::new("127.0.0.1:1"));
        let msg = Message::clipboard(serde_json::json!({"text": "x"}));

        assert!(matches!(
            client.send(&msg).await,
            Err(TransportError::NotConnected)
        ));
        assert!(!client.is_connected());
        // disconnecting an idle transport is fine
        client.disconnect().await.unwrap();
    }
}

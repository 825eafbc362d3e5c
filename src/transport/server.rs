//! LAN server side: accepts peer sockets, tracks handshaken devices and
//! broadcasts outbound messages to every open session.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{BytesCodec, FramedWrite};
use tracing::{debug, error, info, warn};

use super::client::socket_address;
use super::{pump_inbound, Listeners, Transport};
use crate::buffer::ConnectionBuffer;
use crate::config::{ProtocolLimits, TransportConfiguration};
use crate::error::{Result, TransportError};
use crate::frame::FrameCodec;
use crate::metrics::ServerMetrics;
use crate::reassembly::ChunkAssembler;
use crate::scanner::{FrameScanner, ScanOutcome};
use crate::types::{header_value, ConnectedPeer, ConnectionId, Message, Origin, DEVICE_ID_HEADER};

/// Back-off after a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One accepted peer.
struct PeerConnection {
    peer_addr: SocketAddr,
    device_id: Option<String>,
    outbound: mpsc::UnboundedSender<Bytes>,
    buffer: Arc<ConnectionBuffer>,
    assembler: Arc<ChunkAssembler>,
    /// Dropping this ends the connection's read task.
    _close: oneshot::Sender<()>,
}

type PeerTable = Arc<RwLock<HashMap<ConnectionId, PeerConnection>>>;

/// State shared between the server handle and its tasks.
#[derive(Clone)]
struct Shared {
    codec: FrameCodec,
    listeners: Arc<Listeners>,
    peers: PeerTable,
    next_session_id: Arc<AtomicU64>,
    /// Bumped on every start and stop. Sessions accepted under an older
    /// value are refused.
    epoch: Arc<AtomicU64>,
    metrics: Arc<ServerMetrics>,
}

/// LAN server accepting many peer connections.
pub struct LanServer {
    config: TransportConfiguration,
    shared: Shared,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    started_at: Mutex<Option<Instant>>,
}

impl LanServer {
    /// `config.endpoint()` is the address to bind, e.g. `0.0.0.0:7010`.
    pub fn new(config: TransportConfiguration, limits: ProtocolLimits) -> Self {
        Self {
            config,
            shared: Shared {
                codec: FrameCodec::new(limits),
                listeners: Arc::new(Listeners::new()),
                peers: Arc::new(RwLock::new(HashMap::new())),
                next_session_id: Arc::new(AtomicU64::new(1)),
                epoch: Arc::new(AtomicU64::new(0)),
                metrics: Arc::new(ServerMetrics::new()),
            },
            accept_task: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            started_at: Mutex::new(None),
        }
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.shared.metrics
    }

    /// Time since the last successful `connect`, zero while stopped.
    pub fn uptime(&self) -> Duration {
        (*self.started_at.lock()).map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.peers.read().len()
    }

    /// Device ids of the open connections that completed the handshake,
    /// with display names from `resolve_name` when it knows them.
    pub fn connected_peers(&self, resolve_name: Option<&dyn Fn(&str) -> Option<String>>) -> Vec<ConnectedPeer> {
        let device_ids: BTreeSet<String> = self
            .shared
            .peers
            .read()
            .values()
            .filter_map(|p| p.device_id.clone())
            .collect();

        device_ids
            .into_iter()
            .map(|device_id| ConnectedPeer {
                name: resolve_name.and_then(|resolve| resolve(&device_id)),
                device_id,
            })
            .collect()
    }

    async fn accept_loop(listener: TcpListener, shared: Shared, epoch: u64) {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    info!("New connection from {}", addr);
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }
                    let shared = shared.clone();
                    tokio::spawn(async move { Self::handle_connection(socket, addr, shared, epoch).await });
                }
                Err(e) => {
                    shared.metrics.connection_error();
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Handle a single peer connection
    async fn handle_connection(socket: TcpStream, peer_addr: SocketAddr, shared: Shared, epoch: u64) {
        let session_id = shared.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = socket.into_split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let (close, close_rx) = oneshot::channel::<()>();
        let buffer = Arc::new(ConnectionBuffer::new());
        let assembler = Arc::new(ChunkAssembler::new(shared.codec.limits()));

        {
            // Checked under the table lock so a concurrent disconnect either
            // drains this session or makes us refuse it.
            let mut peers = shared.peers.write();
            if shared.epoch.load(Ordering::SeqCst) != epoch {
                debug!("Server stopped, dropping connection from {}", peer_addr);
                return;
            }
            peers.insert(
                session_id,
                PeerConnection {
                    peer_addr,
                    device_id: None,
                    outbound,
                    buffer: buffer.clone(),
                    assembler: assembler.clone(),
                    _close: close,
                },
            );
        }
        shared.metrics.connection_accepted();
        info!("Starting session {} for {}", session_id, peer_addr);

        tokio::spawn(async move {
            let mut framed = FramedWrite::new(write_half, BytesCodec::new());
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = framed.send(frame).await {
                    warn!("Session {} write failed: {}", session_id, e);
                    break;
                }
            }
            debug!("Session {} writer finished", session_id);
        });

        let mut scanner = FrameScanner::with_assembler(shared.codec.clone(), assembler);
        let peers = shared.peers.clone();
        let listeners = shared.listeners.clone();
        let metrics = shared.metrics.clone();
        let deliver = |outcome: ScanOutcome| {
            metrics.record_scan(&outcome);
            for message in outcome.messages {
                if let Some(headers) = message.handshake_headers() {
                    let device_id = header_value(&headers, DEVICE_ID_HEADER).map(str::to_string);
                    debug!("Session {} handshake from device {:?}", session_id, device_id);
                    if let Some(peer) = peers.write().get_mut(&session_id) {
                        peer.device_id = device_id;
                    }
                    continue;
                }
                listeners.dispatch(&message, Origin::LanServer(session_id));
            }
        };

        tokio::select! {
            result = pump_inbound(read_half, &buffer, &mut scanner, deliver) => match result {
                Ok(()) => info!("Session {} connection closed", session_id),
                Err(e) => {
                    shared.metrics.connection_error();
                    error!("Session {} error: {}", session_id, e);
                }
            },
            _ = close_rx => debug!("Session {} closed by server", session_id),
        }

        buffer.close();
        scanner.reset();
        if let Some(peer) = shared.peers.write().remove(&session_id) {
            debug!("Session {} ({}) removed", session_id, peer.peer_addr);
        }
        info!("Session {} ended", session_id);
    }
}

#[async_trait]
impl Transport for LanServer {
    async fn connect(&self) -> Result<()> {
        let mut accept_task = self.accept_task.lock().await;
        if accept_task.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let addr = socket_address(self.config.endpoint())?;
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!("LAN server bound to {}", local_addr);

        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *accept_task = Some(tokio::spawn(Self::accept_loop(listener, self.shared.clone(), epoch)));
        *self.local_addr.lock() = Some(local_addr);
        *self.started_at.lock() = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Broadcast to every connected peer.
    async fn send(&self, message: &Message) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let frames = self
            .shared
            .codec
            .encode_chunked(message, self.shared.codec.limits().chunk_size())?;

        let peers = self.shared.peers.read();
        debug!(
            "Broadcasting message {} ({} frames) to {} peers",
            message.id,
            frames.len(),
            peers.len()
        );
        for (id, peer) in peers.iter() {
            for frame in &frames {
                if peer.outbound.send(frame.clone()).is_err() {
                    debug!("Session {} writer is gone, skipping", id);
                    break;
                }
            }
        }
        self.shared.metrics.message_broadcast();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let task = self.accept_task.lock().await.take();
        self.running.store(false, Ordering::SeqCst);
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        *self.local_addr.lock() = None;
        *self.started_at.lock() = None;

        if let Some(task) = task {
            task.abort();
        }
        let closed: Vec<PeerConnection> = self.shared.peers.write().drain().map(|(_, p)| p).collect();
        for peer in &closed {
            peer.buffer.close();
            peer.assembler.clear();
        }
        if !closed.is_empty() {
            info!("LAN server closed {} connections", closed.len());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn listeners(&self) -> &Listeners {
        &self.shared.listeners
    }
}

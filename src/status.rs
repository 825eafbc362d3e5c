//! Local HTTP status endpoint for a running [`LanServer`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::metrics::MetricsSnapshot;
use crate::transport::{LanServer, Transport};
use crate::types::ConnectedPeer;

/// Maps a device id to a display name.
pub type NameResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// State for the status routes
#[derive(Clone)]
pub struct StatusState {
    pub server: Arc<LanServer>,
    pub resolve_name: Option<NameResolver>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Health {
    pub status: &'static str,
    pub connections: usize,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PeerList {
    pub connected_devices: Vec<ConnectedPeer>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ConnectionStats {
    pub active: usize,
    pub devices: usize,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct MessageStats {
    pub received: u64,
    pub broadcast: u64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ErrorStats {
    pub connections: u64,
    pub rejected_frames: u64,
    pub chunk_timeouts: u64,
}

/// Body of `GET /status`.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ServerStatus {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub connections: ConnectionStats,
    pub messages: MessageStats,
    pub errors: ErrorStats,
}

impl ServerStatus {
    fn new(server: &LanServer, timestamp: DateTime<Utc>) -> Self {
        let MetricsSnapshot {
            connection_errors,
            messages_received,
            messages_broadcast,
            frames_rejected,
            chunk_timeouts,
            ..
        } = server.metrics().snapshot();

        Self {
            status: if server.is_connected() { "ok" } else { "stopped" },
            timestamp,
            uptime_seconds: server.uptime().as_secs(),
            connections: ConnectionStats {
                active: server.connection_count(),
                devices: server.connected_peers(None).len(),
            },
            messages: MessageStats {
                received: messages_received,
                broadcast: messages_broadcast,
            },
            errors: ErrorStats {
                connections: connection_errors,
                rejected_frames: frames_rejected,
                chunk_timeouts,
            },
        }
    }
}

/// `GET /health`, `GET /peers` and `GET /status`.
pub fn status_router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/peers", get(peers))
        .route("/status", get(status))
        .with_state(state)
}

/// Serve the status router until the task is dropped.
pub async fn run_status_server(state: StatusState, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status endpoint running at http://{}", listener.local_addr()?);
    axum::serve(listener, status_router(state)).await?;
    Ok(())
}

pub async fn health(State(state): State<StatusState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        connections: state.server.connection_count(),
    })
}

pub async fn peers(State(state): State<StatusState>) -> Json<PeerList> {
    let resolve = state.resolve_name.as_deref().map(|f| f as &dyn Fn(&str) -> Option<String>);
    Json(PeerList {
        connected_devices: state.server.connected_peers(resolve),
    })
}

pub async fn status(State(state): State<StatusState>) -> Json<ServerStatus> {
    Json(ServerStatus::new(&state.server, Utc::now()))
}

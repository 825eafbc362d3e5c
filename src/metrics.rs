//! Counters kept by the LAN server and served on `/status`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::FrameError;
use crate::scanner::ScanOutcome;

/// Monotonic server counters. Cheap to update from every connection task.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    connections_accepted: AtomicU64,
    connection_errors: AtomicU64,
    messages_received: AtomicU64,
    messages_broadcast: AtomicU64,
    frames_rejected: AtomicU64,
    chunk_timeouts: AtomicU64,
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connection_errors: u64,
    pub messages_received: u64,
    pub messages_broadcast: u64,
    /// Frames dropped for any reason other than a chunk timeout.
    pub frames_rejected: u64,
    pub chunk_timeouts: u64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_broadcast(&self) {
        self.messages_broadcast.fetch_add(1, Ordering::Relaxed);
    }

    /// Count what one scan of a connection buffer produced.
    pub fn record_scan(&self, outcome: &ScanOutcome) {
        self.messages_received
            .fetch_add(outcome.messages.len() as u64, Ordering::Relaxed);

        let timeouts = outcome
            .rejected
            .iter()
            .filter(|e| matches!(e, FrameError::ChunkTimeout { .. }))
            .count() as u64;
        self.chunk_timeouts.fetch_add(timeouts, Ordering::Relaxed);
        self.frames_rejected
            .fetch_add(outcome.rejected.len() as u64 - timeouts, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_broadcast: self.messages_broadcast.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            chunk_timeouts: self.chunk_timeouts.load(Ordering::Relaxed),
        }
    }
}

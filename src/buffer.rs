//! Per-connection inbound byte buffer.
//!
//! The network read path appends, the frame scanner snapshots and drops
//! consumed prefixes. Every operation takes the same lock, so a reader
//! never sees the buffer half-extended or half-shrunk, and the backing
//! storage is never handed out.

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Inner {
    bytes: BytesMut,
    closed: bool,
}

/// Exclusive-access accumulator of raw bytes for one connection.
#[derive(Debug, Default)]
pub struct ConnectionBuffer {
    inner: Mutex<Inner>,
}

impl ConnectionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                bytes: BytesMut::with_capacity(capacity),
                closed: false,
            }),
        }
    }

    /// Append bytes read from the network. Ignored once closed.
    pub fn append(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.bytes.extend_from_slice(data);
    }

    /// An independent copy of the unread bytes.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock().bytes)
    }

    /// Commit `n` consumed bytes. Clamped to the current length.
    pub fn drop_prefix(&self, n: usize) {
        let mut inner = self.inner.lock();
        let n = n.min(inner.bytes.len());
        inner.bytes.advance(n);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invalidate the buffer when its connection closes.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.bytes = BytesMut::new();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_append_snapshot_drop() {
        let buffer = ConnectionBuffer::new();
        buffer.append(b"hello ");
        buffer.append(b"world");

        let snap = buffer.snapshot();
        assert_eq!(&snap[..], b"hello world");

        buffer.drop_prefix(6);
        assert_eq!(&buffer.snapshot()[..], b"world");
        // the earlier snapshot is unaffected
        assert_eq!(&snap[..], b"hello world");
    }

    #[test]
    fn test_drop_prefix_clamps() {
        let buffer = ConnectionBuffer::new();
        buffer.append(b"abc");
        buffer.drop_prefix(10);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_close_invalidates() {
        let buffer = ConnectionBuffer::new();
        buffer.append(b"abc");
        buffer.close();

        assert!(buffer.is_closed());
        assert!(buffer.is_empty());
        buffer.append(b"late");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_concurrent_appends_lose_nothing() {
        let buffer = Arc::new(ConnectionBuffer::new());
        buffer.append(b"seed");
        let before = buffer.len();

        let producers: Vec<_> = (0..8u8)
            .map(|p| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        buffer.append(&[p; 7]);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let snap = buffer.snapshot();
        assert_eq!(snap.len(), before + 8 * 500 * 7);
        // every append landed whole
        for p in 0..8u8 {
            assert_eq!(snap.iter().filter(|&&b| b == p).count(), 500 * 7);
        }
        for run in snap[before..].chunks(7) {
            assert!(run.iter().all(|&b| b == run[0]));
        }
    }

    #[test]
    fn test_concurrent_append_and_drain() {
        let buffer = Arc::new(ConnectionBuffer::new());
        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for i in 0..2_000u32 {
                    buffer.append(&i.to_be_bytes());
                }
            })
        };

        let mut drained = Vec::new();
        while drained.len() < 2_000 * 4 {
            let snap = buffer.snapshot();
            let whole = snap.len() / 4 * 4;
            drained.extend_from_slice(&snap[..whole]);
            buffer.drop_prefix(whole);
        }
        producer.join().unwrap();

        let values: Vec<u32> = drained
            .chunks(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, (0..2_000).collect::<Vec<_>>());
    }

    #[test]
    fn test_buffers_are_independent() {
        let a = ConnectionBuffer::new();
        let b = ConnectionBuffer::new();
        a.append(b"only a");

        assert_eq!(a.len(), 6);
        assert!(b.is_empty());
    }
}

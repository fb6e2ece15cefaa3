//! In-process loopback transport.
//!
//! Every `connect` creates a [`MemoryPeer`] (the remote end of the
//! connection) and queues it on [`MemoryTransport::accept`]. Tests use the
//! peer to observe subscription frames and to emit channel events, playing
//! the part of the workspace server without a socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::frame;
use crate::transport::{Connection, FRAME_BUFFER, TransportError};

// ── MemoryTransport ───────────────────────────────────────────────────────────

/// Loopback transport. Clone freely; clones share the same peers.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    connects: AtomicUsize,
    refuse: AtomicBool,
    accepted_tx: mpsc::UnboundedSender<MemoryPeer>,
    accepted_rx: Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MemoryInner {
                connects: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
                accepted_tx,
                accepted_rx: Mutex::new(accepted_rx),
            }),
        }
    }

    /// Make subsequent connects fail (or succeed again with `false`).
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connect attempts that produced a connection.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Wait for the next connection and return its remote end.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.inner.accepted_rx.lock().await.recv().await
    }

    pub(crate) async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        // A real handshake suspends; give concurrent callers the chance to overlap.
        tokio::task::yield_now().await;

        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "connection refused".into(),
            });
        }

        let (to_client, inbound) = mpsc::channel(FRAME_BUFFER);
        let (outbound, from_client) = mpsc::channel(FRAME_BUFFER);
        let shutdown = CancellationToken::new();

        let peer = MemoryPeer {
            url: url.to_string(),
            to_client,
            from_client: Arc::new(Mutex::new(from_client)),
            shutdown: shutdown.clone(),
        };
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        // The receiver lives as long as `inner`, so this cannot fail.
        let _ = self.inner.accepted_tx.send(peer);
        debug!(%url, "memory connection opened");

        Ok(Connection { outbound, inbound, shutdown })
    }
}

// ── MemoryPeer ────────────────────────────────────────────────────────────────

/// Remote end of one memory connection.
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    url: String,
    to_client: mpsc::Sender<String>,
    from_client: Arc<Mutex<mpsc::Receiver<String>>>,
    shutdown: CancellationToken,
}

impl MemoryPeer {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver a raw text frame to the client.
    pub async fn push_raw(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.to_client
            .send(frame.into())
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Deliver `body` as a channel message on `topic`.
    pub async fn emit(&self, topic: &str, body: Value) -> Result<(), TransportError> {
        self.push_raw(frame::channel_message(topic, &body)).await
    }

    /// Next frame the client sent, or `None` once the connection is closed
    /// and nothing is left to read.
    pub async fn next_sent(&self) -> Option<String> {
        let mut rx = self.from_client.lock().await;
        tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = self.shutdown.cancelled() => rx.try_recv().ok(),
        }
    }

    /// Read sent frames until a `subscribe-channel` for `topic` shows up.
    /// Returns `false` if the connection closes first.
    pub async fn expect_subscribed(&self, topic: &str) -> bool {
        while let Some(sent) = self.next_sent().await {
            if frame::subscribed_channel(&sent).as_deref() == Some(topic) {
                return true;
            }
        }
        false
    }

    /// Drop the connection from the remote side.
    pub fn hang_up(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once either side has closed the connection.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn connect_is_counted_and_accepted() {
        let transport = MemoryTransport::new();
        let conn = transport.connect("memory://w1").await.unwrap();
        assert_eq!(transport.connect_count(), 1);

        let peer = transport.accept().await.unwrap();
        assert_eq!(peer.url(), "memory://w1");
        assert!(!peer.is_closed());

        let (_, _, shutdown) = conn.into_parts();
        shutdown.cancel();
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn refused_connect_errors() {
        let transport = MemoryTransport::new();
        transport.refuse_connections(true);
        let err = transport.connect("memory://w1").await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let transport = MemoryTransport::new();
        let conn = transport.connect("memory://w1").await.unwrap();
        let peer = transport.accept().await.unwrap();

        let (outbound, mut inbound, _shutdown) = conn.into_parts();
        outbound.send("hello".into()).await.unwrap();
        assert_eq!(peer.next_sent().await.as_deref(), Some("hello"));

        peer.emit("workspace:w1", json!({"eventType": "RUNNING"})).await.unwrap();
        let raw = inbound.recv().await.unwrap();
        assert!(raw.contains("workspace:w1"));
    }

    #[tokio::test]
    async fn push_after_hang_up_fails() {
        let transport = MemoryTransport::new();
        let _conn = transport.connect("memory://w1").await.unwrap();
        let peer = transport.accept().await.unwrap();
        peer.hang_up();
        assert!(peer.push_raw("late").await.is_err());
        assert!(peer.next_sent().await.is_none());
    }
}

//! Transport abstraction: one duplex text connection per remote session.
//!
//! [`Transport`] is an enum over concrete backends. Enum dispatch keeps the
//! async `connect` free of trait-object machinery; adding a backend means a
//! new module, a new variant and a new `connect` arm.
//!
//! Every backend hands back the same [`Connection`]: an outbound sender, an
//! inbound receiver fed in arrival order, and a shutdown token. Cancelling the
//! token closes the connection; it is idempotent and, once cancelled, no more
//! inbound frames are produced.

pub mod memory;
#[cfg(feature = "transport-websocket")]
pub mod websocket;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Frames buffered per direction before the sender waits.
pub(crate) const FRAME_BUFFER: usize = 64;

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("connection closed")]
    Closed,
}

impl From<TransportError> for AppError {
    fn from(e: TransportError) -> Self {
        AppError::Transport(e.to_string())
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

/// The caller's end of an open connection.
#[derive(Debug)]
pub struct Connection {
    pub(crate) outbound: mpsc::Sender<String>,
    pub(crate) inbound: mpsc::Receiver<String>,
    pub(crate) shutdown: CancellationToken,
}

impl Connection {
    /// Split into the parts the message bus drives independently.
    pub(crate) fn into_parts(
        self,
    ) -> (mpsc::Sender<String>, mpsc::Receiver<String>, CancellationToken) {
        (self.outbound, self.inbound, self.shutdown)
    }
}

// ── Transport enum ────────────────────────────────────────────────────────────

/// All available transport backends.
#[derive(Debug, Clone)]
pub enum Transport {
    #[cfg(feature = "transport-websocket")]
    WebSocket(websocket::WebSocketTransport),
    Memory(memory::MemoryTransport),
}

impl Transport {
    /// Open a connection to `url`. Resolves once the connection is usable.
    pub async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        match self {
            #[cfg(feature = "transport-websocket")]
            Transport::WebSocket(t) => t.connect(url).await,
            Transport::Memory(t) => t.connect(url).await,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            #[cfg(feature = "transport-websocket")]
            Transport::WebSocket(_) => "websocket",
            Transport::Memory(_) => "memory",
        }
    }
}

impl From<memory::MemoryTransport> for Transport {
    fn from(t: memory::MemoryTransport) -> Self {
        Transport::Memory(t)
    }
}

#[cfg(feature = "transport-websocket")]
impl From<websocket::WebSocketTransport> for Transport {
    fn from(t: websocket::WebSocketTransport) -> Self {
        Transport::WebSocket(t)
    }
}

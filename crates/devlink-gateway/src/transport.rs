//! Message-framed transport seam.
//!
//! The gateway only needs a bidirectional channel that preserves message
//! boundaries and can be closed with a short reason. The WebSocket binding
//! lives in [`crate::ws`]; tests use the in-memory pair below.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Transport failures. Any of these ends the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Peer is gone or the channel was closed locally.
    Closed,
    /// Underlying I/O failure.
    Io(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(msg) => write!(f, "transport i/o error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// One record per message, in order, both directions.
#[async_trait]
pub trait MessageTransport: Send {
    async fn send(&mut self, record: &[u8]) -> Result<(), TransportError>;

    /// Next inbound message; `Ok(None)` means the peer closed.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Close with a reason. Idempotent, best effort.
    async fn close(&mut self, reason: &str);
}

/// In-memory duplex transport.
pub struct MemTransport {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
    closed: bool,
}

/// Connected pair of in-memory transports.
pub fn mem_pair(capacity: usize) -> (MemTransport, MemTransport) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        MemTransport { tx: a_tx, rx: b_rx, closed: false },
        MemTransport { tx: b_tx, rx: a_rx, closed: false },
    )
}

#[async_trait]
impl MessageTransport for MemTransport {
    async fn send(&mut self, record: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(record.to_vec())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self, _reason: &str) {
        self.closed = true;
        self.rx.close();
    }
}

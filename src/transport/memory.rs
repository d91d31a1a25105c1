//! In-process duplex transport

use super::Transport;
use crate::error::{Result, RuntimeError};
use crate::types::Envelope;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// One end of an in-process transport pair
///
/// Closing either end closes both. Envelopes already queued are still
/// delivered before `recv` reports the close.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    closed: CancellationToken,
}

impl MemoryTransport {
    /// Create two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(b_rx),
                closed: closed.clone(),
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(a_rx),
                closed,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(RuntimeError::TransportClosed);
        }
        self.tx
            .send(envelope)
            .map_err(|_| RuntimeError::TransportClosed)
    }

    async fn recv(&self) -> Result<Option<Envelope>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            envelope = rx.recv() => Ok(envelope),
            _ = self.closed.cancelled() => Ok(rx.try_recv().ok()),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

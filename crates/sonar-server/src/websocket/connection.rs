//! Per-connection send handle and registry record.

use std::collections::BTreeSet;
use std::sync::Arc;

use sonar_core::{ConnectionId, DeviceName, ServerFrame};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a frame could not be handed to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFailed {
    /// The outbound queue is full; the peer is not draining fast enough.
    #[error("send queue full")]
    Full,
    /// The writer side has shut down.
    #[error("connection closed")]
    Closed,
    /// The connection is no longer in the registry.
    #[error("connection gone")]
    Gone,
}

/// Send half of a connection: a bounded outbox drained by the socket writer
/// task, plus two tokens observed by the connection task.
///
/// `close` drops the socket right away and discards whatever is still queued.
/// `drain` asks the writer to flush the outbox first, then close.
///
/// Sending never blocks: a full or closed outbox is reported as
/// [`DeliveryFailed`] and left to the caller to act on.
#[derive(Clone, Debug)]
pub struct ConnectionChannel {
    tx: mpsc::Sender<Arc<String>>,
    close: CancellationToken,
    drain: CancellationToken,
}

impl ConnectionChannel {
    pub fn new(tx: mpsc::Sender<Arc<String>>, close: CancellationToken) -> Self {
        Self {
            tx,
            close,
            drain: CancellationToken::new(),
        }
    }

    /// Create a channel together with its outbox receiver.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx, CancellationToken::new()), rx)
    }

    pub fn send(&self, message: Arc<String>) -> Result<(), DeliveryFailed> {
        if self.close.is_cancelled() {
            return Err(DeliveryFailed::Closed);
        }
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryFailed::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryFailed::Closed,
        })
    }

    pub fn send_frame(&self, frame: &ServerFrame) -> Result<(), DeliveryFailed> {
        match frame.to_json() {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize frame");
                Err(DeliveryFailed::Closed)
            }
        }
    }

    /// Ask the connection task to close the socket. Idempotent.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Ask the connection task to write out everything already queued, then
    /// close the socket. Idempotent.
    pub fn close_gracefully(&self) {
        self.drain.cancel();
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.tx.is_closed()
    }

    /// Token observed by the connection task.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }
}

/// Registry-side state for one live connection.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub channel: ConnectionChannel,
    pub devices: BTreeSet<DeviceName>,
    /// Refreshed on every inbound frame, not only on `ping`.
    pub last_seen: Instant,
}

impl ConnectionRecord {
    pub fn new(id: ConnectionId, channel: ConnectionChannel) -> Self {
        Self {
            id,
            channel,
            devices: BTreeSet::new(),
            last_seen: Instant::now(),
        }
    }

    pub fn is_idle(&self, now: Instant, threshold: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > threshold
    }
}

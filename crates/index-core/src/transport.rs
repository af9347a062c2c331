//! PeerConnection trait for sending indexes to a connected device.
//!
//! Implementations:
//! - `WsConnection` (in index-daemon) - WebSocket with JSON frames
//! - `RecordingConnection` - For testing

use crate::DeviceId;
use crate::protocol::IndexMessage;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// An active, authenticated connection to a peer device.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// The connected device
    fn device_id(&self) -> DeviceId;

    /// Send an index message. An error means the peer is gone.
    async fn send_index(&self, message: &IndexMessage) -> Result<()>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Connection double that records every sent message.
///
/// Messages are delivered to the receiver returned by
/// [`RecordingConnection::new`]; [`RecordingConnection::fail_sends`]
/// simulates a peer that went away.
pub struct RecordingConnection {
    device: DeviceId,
    sent: mpsc::UnboundedSender<IndexMessage>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl RecordingConnection {
    pub fn new(device: DeviceId) -> (Arc<Self>, mpsc::UnboundedReceiver<IndexMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            device,
            sent: tx,
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        (conn, rx)
    }

    /// Make every subsequent send fail.
    pub fn fail_sends(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for RecordingConnection {
    fn device_id(&self) -> DeviceId {
        self.device
    }

    async fn send_index(&self, message: &IndexMessage) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("simulated failure".into()));
        }
        self.sent
            .send(message.clone())
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_connection() {
        let (conn, mut rx) = RecordingConnection::new(DeviceId::from(9));
        let msg = IndexMessage::full("default", Vec::new());
        conn.send_index(&msg).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), msg);

        conn.fail_sends();
        assert!(matches!(
            conn.send_index(&msg).await,
            Err(TransportError::SendFailed(_))
        ));

        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert!(matches!(conn.send_index(&msg).await, Err(TransportError::Closed)));
    }
}

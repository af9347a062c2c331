//! WebSocket peer connections.
//!
//! A connection is established in two steps: `handshake` exchanges hello
//! messages on the raw stream, then `WsConnection::spawn` splits it into a
//! shared write half and a read task that forwards index messages to the
//! daemon's event channel.

use crate::message::{HelloMessage, MAX_MESSAGE_SIZE, Role};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use index_core::transport::{self, PeerConnection, TransportError};
use index_core::{DeviceId, IndexMessage};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

/// WebSocket stream type shared by accepted and dialed connections.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long the remote side has to send its hello.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Event emitted by a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Handshake completed
    Connected(Arc<WsConnection>),
    /// Received an index message from the peer
    Index {
        conn_id: u64,
        device: DeviceId,
        message: IndexMessage,
    },
    /// Connection was closed
    Closed { conn_id: u64, device: DeviceId },
}

/// Exchange hello messages and return the remote device id.
pub async fn handshake(ws: &mut WsStream, local: DeviceId, role: Role) -> Result<DeviceId> {
    let hello = HelloMessage::new(local, role);
    ws.send(Message::Binary(hello.to_binary().into()))
        .await
        .context("Failed to send hello")?;

    let remote = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_hello(ws))
        .await
        .context("Handshake timed out")??;

    debug!(
        "Received hello from {} (role: {:?})",
        remote.device_id.short(),
        remote.role
    );
    if remote.device_id == local {
        bail!("Connected to ourselves");
    }
    Ok(remote.device_id)
}

async fn read_hello(ws: &mut WsStream) -> Result<HelloMessage> {
    while let Some(msg) = ws.next().await {
        let data = match msg? {
            Message::Binary(data) => data.to_vec(),
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Close(_) => break,
            _ => continue,
        };
        return HelloMessage::from_binary(&data)
            .ok_or_else(|| anyhow!("Expected hello, got {} bytes", data.len()));
    }
    bail!("Connection closed during handshake")
}

/// A handshaken WebSocket connection to a peer device.
pub struct WsConnection {
    id: u64,
    device: DeviceId,
    write: Mutex<SplitSink<WsStream, Message>>,
    read_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
    /// Flips to true (or loses its sender) once the read loop ends
    closed: watch::Receiver<bool>,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.id)
            .field("device", &self.device)
            .finish()
    }
}

impl WsConnection {
    /// Take over a handshaken stream and start its read task.
    pub fn spawn(
        id: u64,
        device: DeviceId,
        ws: WsStream,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let (write, read) = ws.split();
        let (closed_tx, closed) = watch::channel(false);

        let read_task = tokio::spawn(async move {
            Self::read_loop(id, device, read, &event_tx).await;
            let _ = closed_tx.send(true);
            let _ = event_tx.send(ConnectionEvent::Closed { conn_id: id, device });
        });

        Arc::new(Self {
            id,
            device,
            write: Mutex::new(write),
            read_task: std::sync::Mutex::new(Some(read_task)),
            closing: AtomicBool::new(false),
            closed,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until the read side of the connection has ended.
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        // A dropped sender also means the read task is gone
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn read_loop(
        id: u64,
        device: DeviceId,
        mut read: SplitStream<WsStream>,
        event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        let peer = device.short();
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data.to_vec(),
                        Message::Text(text) => text.as_bytes().to_vec(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", peer);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message from {} exceeds max size ({} > {}), dropping",
                            peer,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    match IndexMessage::from_json(&data) {
                        Some(message) => {
                            if event_tx
                                .send(ConnectionEvent::Index {
                                    conn_id: id,
                                    device,
                                    message,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                        None => debug!("Ignoring unknown message from {} ({} bytes)", peer, data.len()),
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection to {} closed", peer);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", peer, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection to {} stream ended", peer);
                    break;
                }
            }
        }
    }

    fn abort_read_task(&self) {
        if let Some(task) = self
            .read_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

#[async_trait]
impl PeerConnection for WsConnection {
    fn device_id(&self) -> DeviceId {
        self.device
    }

    async fn send_index(&self, message: &IndexMessage) -> transport::Result<()> {
        if self.closing.load(Ordering::SeqCst) || *self.closed.borrow() {
            return Err(TransportError::Closed);
        }
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(message.to_json().into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) -> transport::Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = {
            let mut write = self.write.lock().await;
            write.send(Message::Close(None)).await
        };
        self.abort_read_task();
        result.map_err(|e| TransportError::Other(e.to_string()))
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.abort_read_task();
    }
}

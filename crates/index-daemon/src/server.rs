//! WebSocket server for accepting peer connections.
//!
//! Each accepted socket is upgraded and handshaken on its own task, so a
//! slow or silent client never stalls the daemon loop. Callers only see
//! `ConnectionEvent::Connected` once the remote device is known.

use crate::connection::{ConnectionEvent, WsConnection, handshake};
use crate::message::Role;
use anyhow::Result;
use index_core::DeviceId;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, accept_async};
use tracing::{debug, error, info, warn};

/// Source of connection ids, shared by the server and the dialers.
#[derive(Debug, Default)]
pub struct ConnectionIds(AtomicU64);

impl ConnectionIds {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// WebSocket server handing handshaken connections to the daemon.
pub struct WebSocketServer {
    device_id: DeviceId,
    ids: Arc<ConnectionIds>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl WebSocketServer {
    pub fn new(
        device_id: DeviceId,
        ids: Arc<ConnectionIds>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            device_id,
            ids,
            event_tx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Handle a new incoming TCP connection.
    pub fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let local = self.device_id;
        let conn_id = self.ids.next();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut ws = match accept_async(MaybeTlsStream::Plain(stream)).await {
                Ok(ws) => ws,
                Err(e) => {
                    // Health checks (like `nc -z`) connect and immediately close without
                    // completing the WebSocket handshake. Log these as debug, not error.
                    let err_str = e.to_string();
                    if err_str.contains("Handshake not finished")
                        || err_str.contains("Connection reset")
                        || err_str.contains("unexpected EOF")
                    {
                        debug!("Connection closed before handshake from {}", addr);
                    } else {
                        error!("WebSocket upgrade failed for {}: {}", addr, e);
                    }
                    return;
                }
            };

            let device = match handshake(&mut ws, local, Role::Server).await {
                Ok(device) => device,
                Err(e) => {
                    warn!("Handshake with {} failed: {:#}", addr, e);
                    let _ = ws.close(None).await;
                    return;
                }
            };

            info!(
                "New connection from {} (device: {}, conn_id: {})",
                addr,
                device.short(),
                conn_id
            );
            let conn = WsConnection::spawn(conn_id, device, ws, event_tx.clone());
            let _ = event_tx.send(ConnectionEvent::Connected(conn));
        });
    }
}

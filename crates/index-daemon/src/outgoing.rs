//! Outgoing peer connections.
//!
//! Manages connections we initiate to remote peers, including:
//! - Connection establishment with handshake
//! - Automatic reconnection with exponential backoff

use crate::connection::{ConnectionEvent, WsConnection, handshake};
use crate::message::Role;
use crate::server::ConnectionIds;
use anyhow::{Context, Result};
use index_core::{DeviceId, PeerConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{info, warn};

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Reconnection state for a peer.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Consecutive failed or dropped connections
    pub attempts: u32,
}

impl ReconnectState {
    /// Count one more attempt and return how long to wait before it.
    pub fn next_delay(&mut self, config: &ReconnectConfig) -> Duration {
        self.attempts += 1;
        calculate_backoff(self.attempts, config)
    }

    /// Reset state after successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Check if max attempts exceeded.
    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
    }
}

/// Keeps one outgoing connection to `address` alive.
pub struct Dialer {
    address: String,
    local: DeviceId,
    ids: Arc<ConnectionIds>,
    config: ReconnectConfig,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Dialer {
    pub fn new(
        address: String,
        local: DeviceId,
        ids: Arc<ConnectionIds>,
        config: ReconnectConfig,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            address,
            local,
            ids,
            config,
            event_tx,
        }
    }

    /// Run the connect/reconnect loop on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut state = ReconnectState::default();
        loop {
            match self.connect().await {
                Ok(conn) => {
                    state.reset();
                    let device = conn.device_id().short();
                    if self.event_tx.send(ConnectionEvent::Connected(conn.clone())).is_err() {
                        return;
                    }
                    conn.closed().await;
                    info!("Connection to {} ({}) lost", self.address, device);
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {:#}", self.address, e);
                }
            }

            if state.exceeded_max_attempts(&self.config) {
                warn!(
                    "Giving up on {} after {} attempts",
                    self.address, state.attempts
                );
                return;
            }
            let delay = state.next_delay(&self.config);
            info!(
                "Scheduled reconnect to {} in {:?} (attempt {})",
                self.address, delay, state.attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Connect and handshake once.
    async fn connect(&self) -> Result<Arc<WsConnection>> {
        let (mut ws, _) = connect_async(self.address.as_str())
            .await
            .with_context(|| format!("Failed to open {}", self.address))?;
        let device = handshake(&mut ws, self.local, Role::Client).await?;
        info!("Connected to {} (device: {})", self.address, device.short());
        Ok(WsConnection::spawn(
            self.ids.next(),
            device,
            ws,
            self.event_tx.clone(),
        ))
    }
}

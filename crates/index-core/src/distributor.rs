//! IndexDistributor: streams one folder's index to one peer.
//!
//! The task subscribes to the folder's [`IndexStore`], sends the snapshot
//! it subscribed at as a baseline, then forwards changes in coalesced
//! `Update` messages. A subscription that falls too far behind is replaced
//! by a fresh one and the peer receives a new baseline.

use crate::events::{now_millis, EventBus, FolderEvent};
use crate::protocol::{IndexMessage, DEFAULT_MAX_BATCH_FILES};
use crate::store::{IndexStore, StoreSnapshot};
use crate::transport::{PeerConnection, TransportError};
use crate::{DeviceId, FileRecord};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Default window in which changes are merged into one message.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum DistributorError {
    #[error("Peer gone: {0}")]
    PeerGone(#[source] TransportError),

    #[error("Distributor task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, DistributorError>;

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub coalesce_window: Duration,
    /// Upper bound on records per message
    pub max_batch_files: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            coalesce_window: DEFAULT_COALESCE_WINDOW,
            max_batch_files: DEFAULT_MAX_BATCH_FILES,
        }
    }
}

/// Handle to a running distributor. Dropping it stops the task.
pub struct IndexDistributor {
    folder: String,
    device: DeviceId,
    handle: JoinHandle<Result<()>>,
}

impl IndexDistributor {
    pub fn spawn(
        store: Arc<IndexStore>,
        conn: Arc<dyn PeerConnection>,
        config: DistributorConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let folder = store.folder().to_string();
        let device = conn.device_id();
        let task = DistributorTask {
            folder: folder.clone(),
            device,
            store,
            conn,
            config,
            events,
        };
        Self {
            folder,
            device,
            handle: tokio::spawn(task.run()),
        }
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to end. `Ok` means the folder stopped.
    pub async fn join(&mut self) -> Result<()> {
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(e) => Err(DistributorError::Task(e.to_string())),
        }
    }
}

impl Drop for IndexDistributor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct DistributorTask {
    folder: String,
    device: DeviceId,
    store: Arc<IndexStore>,
    conn: Arc<dyn PeerConnection>,
    config: DistributorConfig,
    events: Arc<EventBus>,
}

impl DistributorTask {
    async fn run(self) -> Result<()> {
        let result = self.distribute().await;
        match &result {
            Ok(()) => debug!(
                "Distributor for folder {} to {} finished",
                self.folder,
                self.device.short()
            ),
            Err(e) => info!(
                "Distributor for folder {} to {} stopped: {}",
                self.folder,
                self.device.short(),
                e
            ),
        }
        result
    }

    async fn distribute(&self) -> Result<()> {
        let Ok((mut changes, snapshot)) = self.store.subscribe() else {
            // Folder already stopped
            return Ok(());
        };
        self.send_baseline(snapshot).await?;

        let mut pending: Vec<FileRecord> = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                received = changes.recv() => match received {
                    Ok(change) => {
                        // Later record wins, at the later position
                        pending.retain(|r| r.name != change.record.name);
                        pending.push(change.record);
                        if pending.len() >= self.config.max_batch_files {
                            self.flush(&mut pending).await?;
                            deadline = None;
                        } else if deadline.is_none() {
                            deadline = Some(Instant::now() + self.config.coalesce_window);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "Distributor for folder {} to {} lagged by {} changes, resending index",
                            self.folder,
                            self.device.short(),
                            skipped
                        );
                        self.events.emit(FolderEvent::DistributorResync {
                            folder: self.folder.clone(),
                            device: self.device,
                            skipped,
                            timestamp: now_millis(),
                        });
                        pending.clear();
                        deadline = None;

                        let Ok((fresh, snapshot)) = self.store.subscribe() else {
                            return Ok(());
                        };
                        changes = fresh;
                        self.send_baseline(snapshot).await?;
                    }
                    Err(RecvError::Closed) => {
                        self.flush(&mut pending).await?;
                        return Ok(());
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush(&mut pending).await?;
                    deadline = None;
                }
            }
        }
    }

    async fn send_baseline(&self, snapshot: StoreSnapshot) -> Result<()> {
        debug!(
            "Sending baseline of {} records (seq {}) for folder {} to {}",
            snapshot.records.len(),
            snapshot.sequence,
            self.folder,
            self.device.short()
        );
        let messages =
            IndexMessage::baseline(&self.folder, snapshot.records, self.config.max_batch_files);
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    async fn flush(&self, pending: &mut Vec<FileRecord>) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let files = std::mem::take(pending);
        self.send(IndexMessage::update(&self.folder, files)).await
    }

    async fn send(&self, message: IndexMessage) -> Result<()> {
        self.conn
            .send_index(&message)
            .await
            .map_err(DistributorError::PeerGone)?;
        self.events.emit(FolderEvent::IndexSent {
            folder: self.folder.clone(),
            device: self.device,
            kind: message.kind,
            files: message.files.len(),
            timestamp: now_millis(),
        });
        Ok(())
    }
}

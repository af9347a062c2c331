//! Model: top-level coordinator for folders and peer connections.
//!
//! Owns one IndexStore and one reconciler task per folder, and one
//! IndexDistributor per (folder, device) pair where the folder is shared
//! with the device and the device is connected.

use crate::db::IndexDatabase;
use crate::distributor::{DistributorConfig, IndexDistributor};
use crate::events::{now_millis, EventBus, FolderEvent};
use crate::fs::FileSystem;
use crate::ignore::{IgnoreError, IgnoreMatcher};
use crate::reconciler::{FolderCommand, ReconcileError, ReconcileReport, Reconciler};
use crate::store::{IndexStore, StoreError, DEFAULT_CHANGE_CAPACITY};
use crate::transport::PeerConnection;
use crate::{DeviceId, FileRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Unknown folder: {0}")]
    UnknownFolder(String),

    #[error("Folder already running: {0}")]
    FolderExists(String),

    #[error("Folder stopped: {0}")]
    FolderStopped(String),

    #[error("Ignore error: {0}")]
    Ignore(#[from] IgnoreError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[source] ReconcileError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<ReconcileError> for ModelError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Ignore(e) => ModelError::Ignore(e),
            other => ModelError::Reconcile(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// This device
    pub device_id: DeviceId,
    pub distributor: DistributorConfig,
    /// Per-folder change notification buffer; a slower distributor resyncs
    pub change_queue_capacity: usize,
    /// Per-folder reconciler command queue
    pub command_queue_capacity: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            device_id: DeviceId::generate(),
            distributor: DistributorConfig::default(),
            change_queue_capacity: DEFAULT_CHANGE_CAPACITY,
            command_queue_capacity: 64,
        }
    }
}

/// A folder and the devices it is shared with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FolderConfig {
    pub id: String,
    pub devices: Vec<DeviceId>,
    /// Initial ignore rules, one pattern per entry
    pub ignore_patterns: Vec<String>,
}

impl FolderConfig {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    pub fn shared_with(mut self, device: DeviceId) -> Self {
        self.devices.push(device);
        self
    }

    pub fn with_ignores<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }
}

struct FolderState {
    config: FolderConfig,
    store: Arc<IndexStore>,
    ignores: Arc<IgnoreMatcher>,
    commands: mpsc::Sender<FolderCommand>,
    task: JoinHandle<()>,
}

pub struct Model {
    config: ModelConfig,
    db: Arc<dyn IndexDatabase>,
    events: Arc<EventBus>,
    folders: RwLock<HashMap<String, FolderState>>,
    connections: RwLock<HashMap<DeviceId, Arc<dyn PeerConnection>>>,
    distributors: Mutex<HashMap<(String, DeviceId), IndexDistributor>>,
}

impl Model {
    pub fn new(config: ModelConfig, db: Arc<dyn IndexDatabase>, events: Arc<EventBus>) -> Self {
        Self {
            config,
            db,
            events,
            folders: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            distributors: Mutex::new(HashMap::new()),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.config.device_id
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Load the folder index, install its initial ignore rules, start its
    /// reconciler and begin distributing to connected devices.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start_folder(&self, config: FolderConfig, fs: Arc<dyn FileSystem>) -> Result<()> {
        if self.read_folders().contains_key(&config.id) {
            return Err(ModelError::FolderExists(config.id));
        }

        let store = Arc::new(IndexStore::open(
            &config.id,
            Arc::clone(&self.db),
            self.config.change_queue_capacity,
        )?);
        let ignores = Arc::new(IgnoreMatcher::new());
        if !config.ignore_patterns.is_empty() {
            ignores.reload(config.ignore_patterns.iter().cloned())?;
        }
        let reconciler = Reconciler::new(
            self.config.device_id,
            Arc::clone(&store),
            Arc::clone(&ignores),
            fs,
            Arc::clone(&self.events),
        );

        {
            let mut folders = self.folders.write().unwrap_or_else(|e| e.into_inner());
            if folders.contains_key(&config.id) {
                return Err(ModelError::FolderExists(config.id));
            }
            let (commands, task) = reconciler.spawn(self.config.command_queue_capacity);
            folders.insert(
                config.id.clone(),
                FolderState {
                    config: config.clone(),
                    store: Arc::clone(&store),
                    ignores,
                    commands,
                    task,
                },
            );
        }

        info!(
            "Started folder {} ({} records, shared with {} devices)",
            config.id,
            store.len(),
            config.devices.len()
        );
        self.events.emit(FolderEvent::FolderStarted {
            folder: config.id.clone(),
            records: store.len(),
            timestamp: now_millis(),
        });

        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        for device in &config.devices {
            if let Some(conn) = connections.get(device) {
                self.start_distributor(&store, Arc::clone(conn));
            }
        }
        Ok(())
    }

    /// Close the folder's index, stop its reconciler and its distributors.
    pub fn stop_folder(&self, folder: &str) -> Result<()> {
        let state = self
            .folders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(folder)
            .ok_or_else(|| ModelError::UnknownFolder(folder.to_string()))?;

        state.store.close();
        state.task.abort();
        self.lock_distributors().retain(|(f, _), _| f != folder);

        info!("Stopped folder {}", folder);
        self.events.emit(FolderEvent::FolderStopped {
            folder: folder.to_string(),
            timestamp: now_millis(),
        });
        Ok(())
    }

    pub async fn scan_folder(&self, folder: &str) -> Result<ReconcileReport> {
        self.command(folder, |reply| FolderCommand::Scan { reply })
            .await
    }

    /// Scan every running folder concurrently.
    pub async fn scan_folders(&self) -> BTreeMap<String, Result<ReconcileReport>> {
        let scans = self.folders().into_iter().map(|folder| async move {
            let result = self.scan_folder(&folder).await;
            (folder, result)
        });
        futures::future::join_all(scans).await.into_iter().collect()
    }

    /// Scan the given folder-relative paths; a directory covers its subtree.
    pub async fn scan_paths(&self, folder: &str, paths: Vec<String>) -> Result<ReconcileReport> {
        self.command(folder, |reply| FolderCommand::ScanPaths { paths, reply })
            .await
    }

    /// Replace the folder's ignore rules and re-evaluate its index.
    ///
    /// Malformed rules are rejected with `ModelError::Ignore` and the
    /// previous rules stay in effect.
    pub async fn set_ignores(&self, folder: &str, patterns: Vec<String>) -> Result<()> {
        let report = self
            .command(folder, |reply| FolderCommand::SetIgnores { patterns, reply })
            .await?;
        debug!(
            "Ignore update in folder {}: {} ignored, {} unignored",
            folder,
            report.ignored.len(),
            report.unignored.len()
        );
        Ok(())
    }

    pub fn get_ignores(&self, folder: &str) -> Result<Vec<String>> {
        self.with_folder(folder, |state| state.ignores.snapshot().patterns().to_vec())
    }

    /// Current index of the folder, ordered by name.
    pub fn get_folder_index(&self, folder: &str) -> Result<Vec<FileRecord>> {
        self.with_folder(folder, |state| state.store.snapshot().records)
    }

    pub fn get_file(&self, folder: &str, name: &str) -> Result<Option<FileRecord>> {
        self.with_folder(folder, |state| state.store.get(name))
    }

    /// Register a connected device and start distributing every folder
    /// shared with it. A previous connection for the same device is replaced.
    pub fn add_connection(&self, conn: Arc<dyn PeerConnection>) {
        let device = conn.device_id();
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device, Arc::clone(&conn));
        self.lock_distributors().retain(|(_, d), _| *d != device);

        let shared: Vec<Arc<IndexStore>> = self
            .read_folders()
            .values()
            .filter(|state| state.config.devices.contains(&device))
            .map(|state| Arc::clone(&state.store))
            .collect();
        info!(
            "Device {} connected ({} shared folders)",
            device.short(),
            shared.len()
        );
        self.events.emit(FolderEvent::DeviceConnected {
            device,
            timestamp: now_millis(),
        });
        for store in shared {
            self.start_distributor(&store, Arc::clone(&conn));
        }
    }

    /// Forget a device and stop its distributors.
    pub fn connection_closed(&self, device: DeviceId) {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&device);
        self.lock_distributors().retain(|(_, d), _| *d != device);

        if removed.is_some() {
            info!("Device {} disconnected", device.short());
            self.events.emit(FolderEvent::DeviceDisconnected {
                device,
                timestamp: now_millis(),
            });
        }
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<_> = self
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        devices.sort();
        devices
    }

    /// Folders currently being distributed to `device`.
    pub fn shared_folders(&self, device: DeviceId) -> Vec<String> {
        let mut folders: Vec<_> = self
            .lock_distributors()
            .keys()
            .filter(|(_, d)| *d == device)
            .map(|(f, _)| f.clone())
            .collect();
        folders.sort();
        folders
    }

    pub fn folders(&self) -> Vec<String> {
        let mut folders: Vec<_> = self.read_folders().keys().cloned().collect();
        folders.sort();
        folders
    }

    /// Stop every folder and close every connection.
    pub async fn shutdown(&self) {
        for folder in self.folders() {
            // Only fails if stopped concurrently
            let _ = self.stop_folder(&folder);
        }
        let connections: Vec<_> = self
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        self.lock_distributors().clear();
        for conn in connections {
            if let Err(e) = conn.close().await {
                debug!("Error closing connection to {}: {}", conn.device_id().short(), e);
            }
        }
        info!("Model shut down");
    }

    fn start_distributor(&self, store: &Arc<IndexStore>, conn: Arc<dyn PeerConnection>) {
        let key = (store.folder().to_string(), conn.device_id());
        debug!(
            "Starting distributor for folder {} to {}",
            key.0,
            key.1.short()
        );
        let distributor = IndexDistributor::spawn(
            Arc::clone(store),
            conn,
            self.config.distributor.clone(),
            Arc::clone(&self.events),
        );
        self.lock_distributors().insert(key, distributor);
    }

    async fn command<F>(&self, folder: &str, make: F) -> Result<ReconcileReport>
    where
        F: FnOnce(oneshot::Sender<std::result::Result<ReconcileReport, ReconcileError>>) -> FolderCommand,
    {
        let commands = self.with_folder(folder, |state| state.commands.clone())?;
        let (reply, response) = oneshot::channel();
        commands
            .send(make(reply))
            .await
            .map_err(|_| ModelError::FolderStopped(folder.to_string()))?;
        let report = response
            .await
            .map_err(|_| ModelError::FolderStopped(folder.to_string()))??;
        Ok(report)
    }

    fn with_folder<T>(&self, folder: &str, f: impl FnOnce(&FolderState) -> T) -> Result<T> {
        self.read_folders()
            .get(folder)
            .map(f)
            .ok_or_else(|| ModelError::UnknownFolder(folder.to_string()))
    }

    fn read_folders(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, FolderState>> {
        self.folders.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_distributors(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(String, DeviceId), IndexDistributor>> {
        self.distributors.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//! Daemon state and event loop.
//!
//! Owns the `Model` and wires it to the native collaborators: folders on
//! disk, the JSON index database, the file watcher and WebSocket peers.

use crate::config::DaemonConfig;
use crate::connection::{ConnectionEvent, WsConnection};
use crate::ignore_file::load_patterns;
use crate::native_fs::NativeFs;
use crate::outgoing::{Dialer, ReconnectConfig};
use crate::persistence::JsonIndexDatabase;
use crate::rescan::{Rescanner, WatchedFolder, log_report};
use crate::server::{ConnectionIds, WebSocketServer};
use crate::watcher::FileWatcher;
use anyhow::{Context, Result, bail};
use index_core::{
    DeviceId, EventBus, FileSystem, FolderConfig, IndexMessage, Model, ModelConfig, ModelError,
    PeerConnection, Subscription,
};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

struct FolderRoot {
    config: FolderConfig,
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
}

pub struct Daemon {
    config: DaemonConfig,
    model: Arc<Model>,
    folders: HashMap<String, FolderRoot>,
    ids: Arc<ConnectionIds>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    /// Current connection per device; older ones are closed on replacement
    active: HashMap<DeviceId, Arc<WsConnection>>,
    _event_log: Subscription,
}

impl Daemon {
    /// Open the index database, start every configured folder and run the
    /// initial scan.
    pub async fn start(config: DaemonConfig) -> Result<Self> {
        config.validate()?;

        let device_id = config.device_id.unwrap_or_else(|| {
            let id = DeviceId::generate();
            info!("Generated device ID: {}", id);
            id
        });

        let db = JsonIndexDatabase::open(&config.data_dir).with_context(|| {
            format!("Failed to open index database at {}", config.data_dir.display())
        })?;
        let events = Arc::new(EventBus::new());
        let event_log = events.subscribe(|event| {
            if let Ok(json) = serde_json::to_string(&event) {
                trace!("Event: {}", json);
            }
        });
        let model = Arc::new(Model::new(
            ModelConfig {
                device_id,
                distributor: config.distributor(),
                ..ModelConfig::default()
            },
            Arc::new(db),
            events,
        ));

        let mut folders = HashMap::new();
        for entry in &config.folders {
            if !entry.path.is_dir() {
                bail!(
                    "Folder {} path is not a directory: {}",
                    entry.folder.id,
                    entry.path.display()
                );
            }
            let fs: Arc<dyn FileSystem> = Arc::new(NativeFs::new(entry.path.clone()));
            let root = FolderRoot {
                config: entry.folder.clone(),
                path: entry.path.clone(),
                fs,
            };
            start_folder(&model, &root).await?;
            folders.insert(entry.folder.id.clone(), root);
        }

        for (folder, result) in model.scan_folders().await {
            match result {
                Ok(report) => log_report(&folder, &report),
                Err(e) => warn!("Initial scan of {} failed: {}", folder, e),
            }
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        info!(
            "Daemon started as {} with {} folder(s)",
            device_id,
            folders.len()
        );

        Ok(Self {
            config,
            model,
            folders,
            ids: Arc::new(ConnectionIds::default()),
            event_tx,
            event_rx,
            active: HashMap::new(),
            _event_log: event_log,
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn device_id(&self) -> DeviceId {
        self.model.device_id()
    }

    /// Serve peers and watch folders until `shutdown` resolves.
    pub async fn run(
        mut self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let server = WebSocketServer::new(
            self.device_id(),
            Arc::clone(&self.ids),
            self.event_tx.clone(),
        );

        let roots = self
            .folders
            .values()
            .map(|root| (root.config.id.clone(), root.path.clone()))
            .collect();
        let mut watcher = FileWatcher::new(roots)?;
        info!("File watcher started");

        let watched = self
            .folders
            .iter()
            .map(|(id, root)| {
                let folder = WatchedFolder {
                    config: root.config.clone(),
                    fs: Arc::clone(&root.fs),
                };
                (id.clone(), folder)
            })
            .collect();
        let rescans = Rescanner::new(Arc::clone(&self.model), watched).spawn();

        let dialers: Vec<_> = self
            .config
            .peers
            .iter()
            .map(|address| {
                Dialer::new(
                    address.clone(),
                    self.device_id(),
                    Arc::clone(&self.ids),
                    ReconnectConfig::default(),
                    self.event_tx.clone(),
                )
                .spawn()
            })
            .collect();

        tokio::pin!(shutdown);
        info!("Daemon running");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => server.accept_connection(stream, addr),
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }

                Some(event) = watcher.event_rx().recv() => {
                    let mut batch = vec![event];
                    while let Ok(event) = watcher.event_rx().try_recv() {
                        batch.push(event);
                    }
                    rescans.submit(batch);
                }

                Some(event) = self.event_rx.recv() => {
                    self.on_connection_event(event).await;
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        for dialer in dialers {
            dialer.abort();
        }
        rescans.abort();
        self.model.shutdown().await;
        info!("Shutting down");
        Ok(())
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected(conn) => {
                let device = conn.device_id();
                if let Some(old) = self.active.insert(device, Arc::clone(&conn)) {
                    debug!("Replacing connection {} for {}", old.id(), device.short());
                    if let Err(e) = old.close().await {
                        debug!("Error closing old connection: {}", e);
                    }
                }
                self.model.add_connection(conn);
            }
            ConnectionEvent::Index {
                conn_id,
                device,
                message,
            } => {
                log_incoming(conn_id, device, &message);
            }
            ConnectionEvent::Closed { conn_id, device } => {
                // A replaced connection closing must not drop its successor
                if self.active.get(&device).map(|c| c.id()) == Some(conn_id) {
                    self.active.remove(&device);
                    self.model.connection_closed(device);
                } else {
                    debug!("Stale connection {} for {} closed", conn_id, device.short());
                }
            }
        }
    }
}

/// Start a folder with the rules from its ignore file, falling back to the
/// configured patterns when the file is unreadable or malformed.
async fn start_folder(model: &Model, root: &FolderRoot) -> Result<()> {
    let mut config = root.config.clone();
    match load_patterns(root.fs.as_ref()).await {
        Ok(Some(patterns)) => config.ignore_patterns = patterns,
        Ok(None) => {}
        Err(e) => warn!("Failed to read ignore file in {}: {}", config.id, e),
    }

    let fs = Arc::clone(&root.fs);
    match model.start_folder(config, Arc::clone(&fs)) {
        Ok(()) => {}
        Err(ModelError::Ignore(e)) => {
            warn!("Invalid ignore file in {}: {}", root.config.id, e);
            model
                .start_folder(root.config.clone(), fs)
                .with_context(|| format!("Failed to start folder {}", root.config.id))?;
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to start folder {}", root.config.id));
        }
    }
    debug!("Folder {} root: {}", root.config.id, root.path.display());
    Ok(())
}

fn log_incoming(conn_id: u64, device: DeviceId, message: &IndexMessage) {
    info!(
        "Received {:?} index for {} from {} ({} files, conn {})",
        message.kind,
        message.folder,
        device.short(),
        message.files.len(),
        conn_id
    );
    for file in &message.files {
        debug!("  {}", file);
    }
}

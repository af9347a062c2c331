//! Watcher-driven rescans.
//!
//! File events are handed to a worker task that applies them one batch at a
//! time, in arrival order. The daemon loop only queues batches, so it keeps
//! accepting connections while a folder is being rescanned.

use crate::ignore_file::{is_ignore_file, load_patterns};
use crate::watcher::FileEvent;
use index_core::{FileSystem, FolderConfig, Model, ModelError, ReconcileReport};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What the rescanner needs to know about a folder.
#[derive(Clone)]
pub struct WatchedFolder {
    /// Configured rules, used while the folder has no ignore file
    pub config: FolderConfig,
    pub fs: Arc<dyn FileSystem>,
}

pub struct Rescanner {
    model: Arc<Model>,
    folders: HashMap<String, WatchedFolder>,
}

/// Queue into a running [`Rescanner`].
pub struct RescanHandle {
    tx: mpsc::UnboundedSender<Vec<FileEvent>>,
    task: JoinHandle<()>,
}

impl RescanHandle {
    /// Queue a batch of events. Never waits for the scan.
    pub fn submit(&self, events: Vec<FileEvent>) {
        if let Err(e) = self.tx.send(events) {
            warn!("Rescan worker stopped, dropping {} file events", e.0.len());
        }
    }

    /// Apply everything already queued, then stop.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            error!("Rescan worker failed: {}", e);
        }
    }

    /// Stop without waiting for queued batches.
    pub fn abort(self) {
        self.task.abort();
    }
}

impl Rescanner {
    pub fn new(model: Arc<Model>, folders: HashMap<String, WatchedFolder>) -> Self {
        Self { model, folders }
    }

    pub fn spawn(self) -> RescanHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<FileEvent>>();
        let task = tokio::spawn(async move {
            while let Some(events) = rx.recv().await {
                self.apply(events).await;
            }
            debug!("Rescan worker stopped");
        });
        RescanHandle { tx, task }
    }

    /// Rescan the changed paths, reloading ignores first if the ignore file changed.
    pub async fn apply(&self, events: Vec<FileEvent>) {
        let mut by_folder: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for event in events {
            by_folder.entry(event.folder).or_default().insert(event.path);
        }

        for (folder, paths) in by_folder {
            if paths.iter().any(|p| is_ignore_file(p)) {
                self.reload_ignores(&folder).await;
            }
            match self
                .model
                .scan_paths(&folder, paths.into_iter().collect())
                .await
            {
                Ok(report) => log_report(&folder, &report),
                Err(e) => warn!("Failed to rescan changes in {}: {}", folder, e),
            }
        }
    }

    async fn reload_ignores(&self, folder: &str) {
        let Some(watched) = self.folders.get(folder) else {
            return;
        };
        let patterns = match load_patterns(watched.fs.as_ref()).await {
            Ok(Some(patterns)) => patterns,
            Ok(None) => watched.config.ignore_patterns.clone(),
            Err(e) => {
                warn!("Failed to read ignore file in {}: {}", folder, e);
                return;
            }
        };
        match self.model.set_ignores(folder, patterns).await {
            Ok(()) => debug!("Reloaded ignore rules for {}", folder),
            Err(ModelError::Ignore(e)) => {
                warn!("Keeping previous ignore rules for {}: {}", folder, e)
            }
            Err(e) => error!("Failed to apply ignore rules for {}: {}", folder, e),
        }
    }
}

pub(crate) fn log_report(folder: &str, report: &ReconcileReport) {
    if report.has_changes() {
        info!(
            "Scanned {}: {} updated, {} ignored, {} unignored, {} deleted, {} failed",
            folder,
            report.updated.len(),
            report.ignored.len(),
            report.unignored.len(),
            report.deleted.len(),
            report.failed.len()
        );
    } else {
        debug!("Scanned {}: no changes", folder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::FileEventKind;
    use async_trait::async_trait;
    use index_core::fs::{FileEntry, FileStat, Result as FsResult};
    use index_core::{DeviceId, EventBus, InMemoryFs, MemoryDatabase, ModelConfig};
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    const FOLDER: &str = "default";

    /// Filesystem whose `stat` waits until the gate is opened.
    struct GatedFs {
        inner: InMemoryFs,
        gate: Semaphore,
    }

    #[async_trait]
    impl FileSystem for GatedFs {
        async fn read(&self, path: &str) -> FsResult<Vec<u8>> {
            self.inner.read(path).await
        }

        async fn write(&self, path: &str, content: &[u8]) -> FsResult<()> {
            self.inner.write(path, content).await
        }

        async fn list(&self, path: &str) -> FsResult<Vec<FileEntry>> {
            self.inner.list(path).await
        }

        async fn delete(&self, path: &str) -> FsResult<()> {
            self.inner.delete(path).await
        }

        async fn exists(&self, path: &str) -> FsResult<bool> {
            self.inner.exists(path).await
        }

        async fn stat(&self, path: &str) -> FsResult<FileStat> {
            let _permit = self.gate.acquire().await;
            self.inner.stat(path).await
        }

        async fn mkdir(&self, path: &str) -> FsResult<()> {
            self.inner.mkdir(path).await
        }
    }

    fn model() -> Arc<Model> {
        Arc::new(Model::new(
            ModelConfig {
                device_id: DeviceId::from(0xd000),
                ..ModelConfig::default()
            },
            Arc::new(MemoryDatabase::new()),
            Arc::new(EventBus::new()),
        ))
    }

    fn rescanner(model: &Arc<Model>, config: FolderConfig, fs: Arc<dyn FileSystem>) -> Rescanner {
        model.start_folder(config.clone(), Arc::clone(&fs)).unwrap();
        let folders = HashMap::from([(FOLDER.to_string(), WatchedFolder { config, fs })]);
        Rescanner::new(Arc::clone(model), folders)
    }

    fn event(path: &str) -> FileEvent {
        FileEvent {
            folder: FOLDER.into(),
            path: path.into(),
            kind: FileEventKind::Modified,
        }
    }

    #[tokio::test]
    async fn test_ignore_file_change_reloads_before_scan() {
        let model = model();
        let fs = Arc::new(InMemoryFs::new());
        fs.write("secret.key", b"hunter2").await.unwrap();
        let worker = rescanner(&model, FolderConfig::new(FOLDER), fs.clone()).spawn();
        model.scan_folder(FOLDER).await.unwrap();

        fs.write(".syncignore", b"*.key\n").await.unwrap();
        worker.submit(vec![event(".syncignore")]);
        worker.close().await;

        assert_eq!(model.get_ignores(FOLDER).unwrap(), vec!["*.key"]);
        assert!(model.get_file(FOLDER, "secret.key").unwrap().unwrap().invalid);
        assert!(model.get_file(FOLDER, ".syncignore").unwrap().is_some());
        model.shutdown().await;
    }

    #[tokio::test]
    async fn test_removed_ignore_file_restores_configured_rules() {
        let model = model();
        let fs = Arc::new(InMemoryFs::new());
        fs.write(".syncignore", b"*.key\n").await.unwrap();
        let config = FolderConfig::new(FOLDER).with_ignores(["*.log"]);
        let rescanner = rescanner(&model, config, fs.clone());

        rescanner.apply(vec![event(".syncignore")]).await;
        assert_eq!(model.get_ignores(FOLDER).unwrap(), vec!["*.key"]);

        fs.delete(".syncignore").await.unwrap();
        rescanner.apply(vec![event(".syncignore")]).await;
        assert_eq!(model.get_ignores(FOLDER).unwrap(), vec!["*.log"]);
        model.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_does_not_wait_for_scan() {
        let model = model();
        let fs = Arc::new(GatedFs {
            inner: InMemoryFs::new(),
            gate: Semaphore::new(0),
        });
        fs.write("a.txt", b"one").await.unwrap();
        let worker = rescanner(&model, FolderConfig::new(FOLDER), fs.clone()).spawn();

        // Returns while the scan is stuck behind the closed gate
        worker.submit(vec![event("a.txt")]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(model.get_file(FOLDER, "a.txt").unwrap().is_none());

        fs.gate.add_permits(1);
        timeout(Duration::from_secs(5), worker.close())
            .await
            .expect("rescan did not finish");
        assert!(model.get_file(FOLDER, "a.txt").unwrap().is_some());
        model.shutdown().await;
    }
}

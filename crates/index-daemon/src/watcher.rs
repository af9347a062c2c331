//! File watcher with debouncing for folder changes.
//!
//! Uses notify-debouncer-mini for efficient file change detection. One
//! watcher covers every configured folder; events carry the folder id and
//! the folder-relative path.

use anyhow::Result;
use index_core::scanner::is_internal;
use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Debounce period for filesystem events.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// File event from the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Folder id the path belongs to
    pub folder: String,
    /// Path relative to the folder root, `/`-separated
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
}

/// Watched folder root.
#[derive(Debug, Clone)]
struct Root {
    folder: String,
    path: PathBuf,
}

/// Track last seen mtime to filter spurious events (Docker volume bug workaround)
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

/// File watcher that monitors the folder roots.
pub struct FileWatcher {
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

impl FileWatcher {
    /// Watch each `(folder id, root)` pair recursively.
    pub fn new(folders: Vec<(String, PathBuf)>) -> Result<Self> {
        // Canonicalize to resolve symlinks. On macOS, /var/folders/...
        // is actually /private/var/folders/..., and FSEvents needs the real path.
        let roots: Vec<Root> = folders
            .into_iter()
            .map(|(folder, path)| Root {
                folder,
                path: path.canonicalize().unwrap_or(path),
            })
            .collect();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));
        let callback_roots = roots.clone();

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(file_event) =
                            Self::process_event(&event.path, &callback_roots, &mtime_cache)
                        {
                            if event_tx.send(file_event).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        for root in &roots {
            debouncer
                .watcher()
                .watch(&root.path, RecursiveMode::Recursive)?;
        }

        Ok(Self {
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Map an absolute path to a folder event, if relevant.
    fn process_event(path: &Path, roots: &[Root], mtime_cache: &MtimeCache) -> Option<FileEvent> {
        let (root, relative) = roots
            .iter()
            .filter_map(|root| path.strip_prefix(&root.path).ok().map(|rel| (root, rel)))
            // Nested roots: the deepest one owns the path
            .max_by_key(|(root, _)| root.path.components().count())?;

        let relative_str = relative_name(relative)?;
        if relative_str.is_empty() || is_internal(&relative_str) {
            return None;
        }

        let kind = if path.exists() {
            FileEventKind::Modified
        } else {
            FileEventKind::Deleted
        };

        // For modifications, check mtime to filter spurious events (Docker volume workaround)
        let cache_key = root.path.join(relative);
        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        match kind {
            FileEventKind::Modified => {
                if let Ok(mtime) = std::fs::metadata(path).and_then(|m| m.modified()) {
                    if cache.get(&cache_key) == Some(&mtime) {
                        return None;
                    }
                    cache.insert(cache_key, mtime);
                }
            }
            FileEventKind::Deleted => {
                cache.remove(&cache_key);
            }
        }

        debug!("File event: {:?} - {}/{}", kind, root.folder, relative_str);

        Some(FileEvent {
            folder: root.folder.clone(),
            path: relative_str,
            kind,
        })
    }

    /// Get the receiver for file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }
}

/// `/`-joined UTF-8 components of a relative path.
fn relative_name(relative: &Path) -> Option<String> {
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn roots(dir: &Path) -> Vec<Root> {
        vec![Root {
            folder: "default".into(),
            path: dir.to_path_buf(),
        }]
    }

    #[test]
    fn test_process_event_maps_folder_and_path() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"x").unwrap();
        let cache = MtimeCache::default();

        let event =
            FileWatcher::process_event(&dir.path().join("sub/a.txt"), &roots(dir.path()), &cache)
                .unwrap();
        assert_eq!(event.folder, "default");
        assert_eq!(event.path, "sub/a.txt");
        assert_eq!(event.kind, FileEventKind::Modified);

        // Same mtime again is spurious
        assert!(
            FileWatcher::process_event(&dir.path().join("sub/a.txt"), &roots(dir.path()), &cache)
                .is_none()
        );

        let gone =
            FileWatcher::process_event(&dir.path().join("gone.txt"), &roots(dir.path()), &cache)
                .unwrap();
        assert_eq!(gone.kind, FileEventKind::Deleted);
    }

    #[test]
    fn test_process_event_skips_internal_and_foreign_paths() {
        let dir = TempDir::new().unwrap();
        let cache = MtimeCache::default();

        assert!(
            FileWatcher::process_event(&dir.path().join(".sync/state"), &roots(dir.path()), &cache)
                .is_none()
        );
        assert!(
            FileWatcher::process_event(Path::new("/somewhere/else"), &roots(dir.path()), &cache)
                .is_none()
        );
        assert!(FileWatcher::process_event(dir.path(), &roots(dir.path()), &cache).is_none());
    }

    #[tokio::test]
    async fn test_watcher_reports_new_file() {
        let dir = TempDir::new().unwrap();
        let mut watcher =
            FileWatcher::new(vec![("default".into(), dir.path().to_path_buf())]).unwrap();

        // Give the backend a moment to register the watch
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(dir.path().join("new.txt"), b"hello").unwrap();

        let event = loop {
            let event = timeout(Duration::from_secs(5), watcher.event_rx().recv())
                .await
                .expect("timed out waiting for file event")
                .expect("watcher channel closed");
            if event.path == "new.txt" {
                break event;
            }
        };
        assert_eq!(event.folder, "default");
        assert_eq!(event.kind, FileEventKind::Modified);
    }
}

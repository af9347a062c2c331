//! FileSystem trait abstraction for the folder being indexed.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in index-daemon) - Uses tokio::fs
//!
//! Paths are folder-relative and `/`-separated; the empty string is the root.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// In-memory filesystem for testing.
///
/// Reads and directory listings of paths registered with
/// [`InMemoryFs::fail_reads`] return `FsError::Io`, which is how tests
/// exercise per-file scan failures and unreadable directories.
pub struct InMemoryFs {
    files: RwLock<BTreeMap<String, MemFile>>,
    dirs: RwLock<BTreeSet<String>>,
    failing: RwLock<HashSet<String>>,
}

struct MemFile {
    content: Vec<u8>,
    mtime_millis: u64,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(String::new());
        Self {
            files: RwLock::new(BTreeMap::new()),
            dirs: RwLock::new(dirs),
            failing: RwLock::new(HashSet::new()),
        }
    }

    /// Set a specific mtime, e.g. to simulate a touch without content change.
    pub fn set_mtime(&self, path: &str, mtime: u64) {
        let path = normalize(path);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = files.get_mut(&path) {
            file.mtime_millis = mtime;
        }
    }

    /// Make every subsequent read or listing of `path` fail with an I/O error.
    pub fn fail_reads(&self, path: &str) {
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize(path));
    }

    /// Undo [`InMemoryFs::fail_reads`].
    pub fn heal(&self, path: &str) {
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&normalize(path));
    }

    fn now_millis() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn add_parents(&self, path: &str) {
        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        let mut current = path;
        while let Some(pos) = current.rfind('/') {
            current = &current[..pos];
            dirs.insert(current.to_string());
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize(path);
        if self
            .failing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&path)
        {
            return Err(FsError::Io(format!("simulated read failure: {}", path)));
        }
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        match files.get(&path) {
            Some(file) => Ok(file.content.clone()),
            None if self.dirs.read().unwrap_or_else(|e| e.into_inner()).contains(&path) => {
                Err(FsError::IsDirectory(path))
            }
            None => Err(FsError::NotFound(path)),
        }
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = normalize(path);
        self.add_parents(&path);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        // Bump mtime even for writes within the same millisecond
        let mtime_millis = match files.get(&path) {
            Some(old) => Self::now_millis().max(old.mtime_millis + 1),
            None => Self::now_millis(),
        };
        files.insert(
            path,
            MemFile {
                content: content.to_vec(),
                mtime_millis,
            },
        );
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = normalize(path);
        if self
            .failing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&path)
        {
            return Err(FsError::Io(format!("simulated list failure: {}", path)));
        }
        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        if !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let direct_child = |full: &str| -> Option<String> {
            let rest = full.strip_prefix(&prefix)?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };

        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<FileEntry> = files
            .keys()
            .filter_map(|k| direct_child(k.as_str()))
            .map(|name| FileEntry { name, is_dir: false })
            .collect();
        entries.extend(
            dirs.iter()
                .filter_map(|d| direct_child(d.as_str()))
                .map(|name| FileEntry { name, is_dir: true }),
        );
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        if self
            .files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path)
            .is_some()
        {
            return Ok(());
        }
        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        if !path.is_empty() && dirs.remove(&path) {
            return Ok(());
        }
        Err(FsError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = normalize(path);
        let in_files = self
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&path);
        Ok(in_files || self.dirs.read().unwrap_or_else(|e| e.into_inner()).contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = normalize(path);
        if let Some(file) = self
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&path)
        {
            return Ok(FileStat {
                mtime_millis: file.mtime_millis,
                size: file.content.len() as u64,
                is_dir: false,
            });
        }
        if self.dirs.read().unwrap_or_else(|e| e.into_inner()).contains(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            });
        }
        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        if path.is_empty() {
            return Ok(());
        }
        self.add_parents(&path);
        self.dirs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path);
        Ok(())
    }
}

// Lets a test keep a handle on the filesystem it gave to a folder
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}

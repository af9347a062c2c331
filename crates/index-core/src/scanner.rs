//! Scanner: turns a `FileSystem` into per-file scan results.
//!
//! Walking and hashing live here so the reconciler only ever sees
//! `ScanResult`s. The internal `.sync` directory is never walked.

use crate::fs::{FileSystem, FsError};
use futures::stream::{self, Stream, StreamExt};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Directory reserved for the engine's own state inside a folder.
pub const INTERNAL_DIR: &str = ".sync";

/// Observation of one file name on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub name: String,
    pub exists: bool,
    pub size: u64,
    pub mod_time_ms: u64,
    /// Lowercase hex SHA-256, `None` if the content was not read
    pub signature: Option<String>,
}

impl ScanResult {
    /// Result for a name that is no longer on disk.
    pub fn missing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            exists: false,
            size: 0,
            mod_time_ms: 0,
            signature: None,
        }
    }
}

/// Per-file scan failure. Never aborts a pass.
#[derive(Debug, Error)]
#[error("Failed to scan {name}: {source}")]
pub struct ScanError {
    pub name: String,
    #[source]
    pub source: FsError,
}

/// Outcome of walking a directory tree.
#[derive(Debug, Default)]
pub struct Listing {
    /// Files found, sorted
    pub files: Vec<String>,
    /// Directories that could not be listed; their contents are unknown
    pub failed: Vec<ScanError>,
}

impl Listing {
    /// Whether `name` lies in a subtree that could not be listed.
    pub fn is_unknown(&self, name: &str) -> bool {
        self.failed.iter().any(|err| is_within(name, &err.name))
    }
}

/// True if `name` is `dir` or lies beneath it.
pub fn is_within(name: &str, dir: &str) -> bool {
    dir.is_empty()
        || name
            .strip_prefix(dir)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Lowercase hex SHA-256 of `data`.
pub fn content_signature(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// True for the internal directory and anything beneath it.
pub fn is_internal(name: &str) -> bool {
    name == INTERNAL_DIR || name.starts_with(".sync/")
}

pub struct Scanner<F> {
    fs: F,
}

impl<F: FileSystem> Scanner<F> {
    pub fn new(fs: F) -> Self {
        Self { fs }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// Recursively list file names under `root` ("" for the whole folder).
    ///
    /// A `root` naming a file yields just that file; a missing `root`
    /// yields nothing. Only a failure to list `root` itself is an error.
    /// Subdirectories that cannot be listed are reported in
    /// [`Listing::failed`] and their subtree is skipped; a subdirectory
    /// that vanished mid-walk is treated as empty.
    pub async fn list_files(&self, root: &str) -> Result<Listing, FsError> {
        let root = root.trim_matches('/');
        let mut listing = Listing::default();
        if is_internal(root) {
            return Ok(listing);
        }
        if !root.is_empty() {
            match self.fs.stat(root).await {
                Ok(stat) if !stat.is_dir => {
                    listing.files.push(root.to_string());
                    return Ok(listing);
                }
                Ok(_) => {}
                Err(FsError::NotFound(_)) => return Ok(listing),
                Err(e) => return Err(e),
            }
        }

        let mut pending = vec![root.to_string()];
        while let Some(dir) = pending.pop() {
            let entries = match self.fs.list(&dir).await {
                Ok(entries) => entries,
                Err(e) if dir == root => return Err(e),
                Err(FsError::NotFound(_)) => continue,
                Err(source) => {
                    listing.failed.push(ScanError { name: dir, source });
                    continue;
                }
            };
            for entry in entries {
                let path = if dir.is_empty() {
                    entry.name
                } else {
                    format!("{}/{}", dir, entry.name)
                };
                if is_internal(&path) {
                    continue;
                }
                if entry.is_dir {
                    pending.push(path);
                } else {
                    listing.files.push(path);
                }
            }
        }
        listing.files.sort();
        listing.failed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    /// Observe a single name. Content is hashed only when `hash` is set;
    /// ignored files are recorded from metadata alone.
    pub async fn scan_file(&self, name: &str, hash: bool) -> Result<ScanResult, ScanError> {
        let fail = |source| ScanError {
            name: name.to_string(),
            source,
        };

        let stat = match self.fs.stat(name).await {
            Ok(stat) if stat.is_dir => return Ok(ScanResult::missing(name)),
            Ok(stat) => stat,
            Err(FsError::NotFound(_)) => return Ok(ScanResult::missing(name)),
            Err(e) => return Err(fail(e)),
        };

        let signature = if hash {
            match self.fs.read(name).await {
                Ok(content) => Some(content_signature(&content)),
                // Removed between stat and read
                Err(FsError::NotFound(_)) => return Ok(ScanResult::missing(name)),
                Err(e) => return Err(fail(e)),
            }
        } else {
            None
        };

        Ok(ScanResult {
            name: name.to_string(),
            exists: true,
            size: stat.size,
            mod_time_ms: stat.mtime_millis,
            signature,
        })
    }

    /// Lazily scan `names` in order; `should_hash` decides per name.
    pub fn scan_files<'a, H>(
        &'a self,
        names: Vec<String>,
        should_hash: H,
    ) -> impl Stream<Item = Result<ScanResult, ScanError>> + 'a
    where
        H: Fn(&str) -> bool + 'a,
    {
        stream::iter(names).then(move |name| {
            let hash = should_hash(&name);
            async move { self.scan_file(&name, hash).await }
        })
    }
}

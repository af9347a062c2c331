//! Reconciler: the single writer of a folder's IndexStore.
//!
//! Runs as one task per folder, draining a bounded queue of
//! [`FolderCommand`]s. Each pass pins one ignore snapshot, observes the
//! filesystem through the [`Scanner`] and applies the transition rules in
//! [`rules`] name by name.

pub mod rules;

use crate::events::{now_millis, EventBus, FolderEvent};
use crate::fs::{FileSystem, FsError};
use crate::ignore::{IgnoreError, IgnoreMatcher, IgnoreSnapshot};
use crate::scanner::{is_internal, is_within, ScanError, Scanner};
use crate::store::{IndexStore, StoreError};
use crate::{DeviceId, FileRecord};
use futures::StreamExt;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Ignore error: {0}")]
    Ignore(#[from] IgnoreError),

    #[error("Failed to walk folder: {0}")]
    Walk(#[source] FsError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Names touched by one reconciliation pass.
///
/// `updated` lists every upserted name; the other lists classify a subset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub updated: Vec<String>,
    /// Valid records that became invalid because they are now ignored
    pub ignored: Vec<String>,
    /// Invalid records that became valid again
    pub unignored: Vec<String>,
    /// New valid tombstones
    pub deleted: Vec<String>,
    /// Names that could not be read
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn has_changes(&self) -> bool {
        !self.updated.is_empty()
    }
}

/// Upserts are written to the store in batches of at most this many records.
pub const WRITE_BATCH: usize = 512;

/// Accumulated outcome of one pass. Records wait in `pending` until the
/// batch is full or the pass ends.
#[derive(Default)]
struct Pass {
    report: ReconcileReport,
    pending: Vec<FileRecord>,
}

/// Work item for a folder's reconciler task.
pub enum FolderCommand {
    /// Full scan of the folder
    Scan {
        reply: oneshot::Sender<Result<ReconcileReport>>,
    },
    /// Scan of the given paths; a directory covers its subtree
    ScanPaths {
        paths: Vec<String>,
        reply: oneshot::Sender<Result<ReconcileReport>>,
    },
    /// Install new ignore rules and re-evaluate every record
    SetIgnores {
        patterns: Vec<String>,
        reply: oneshot::Sender<Result<ReconcileReport>>,
    },
}

pub struct Reconciler {
    folder: String,
    local: DeviceId,
    store: Arc<IndexStore>,
    ignores: Arc<IgnoreMatcher>,
    scanner: Scanner<Arc<dyn FileSystem>>,
    events: Arc<EventBus>,
}

impl Reconciler {
    pub fn new(
        local: DeviceId,
        store: Arc<IndexStore>,
        ignores: Arc<IgnoreMatcher>,
        fs: Arc<dyn FileSystem>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            folder: store.folder().to_string(),
            local,
            store,
            ignores,
            scanner: Scanner::new(fs),
            events,
        }
    }

    /// Start the reconciler task. It ends when every command sender is gone.
    pub fn spawn(self, capacity: usize) -> (mpsc::Sender<FolderCommand>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    pub async fn run(self, mut commands: mpsc::Receiver<FolderCommand>) {
        debug!("Reconciler started for folder {}", self.folder);
        while let Some(command) = commands.recv().await {
            match command {
                FolderCommand::Scan { reply } => {
                    let result = self.scan().await;
                    self.log_failure("scan", &result);
                    let _ = reply.send(result);
                }
                FolderCommand::ScanPaths { paths, reply } => {
                    let result = self.scan_paths(&paths).await;
                    self.log_failure("path scan", &result);
                    let _ = reply.send(result);
                }
                FolderCommand::SetIgnores { patterns, reply } => {
                    let result = self.set_ignores(patterns).await;
                    self.log_failure("ignore reload", &result);
                    let _ = reply.send(result);
                }
            }
        }
        debug!("Reconciler stopped for folder {}", self.folder);
    }

    /// Reconcile the whole folder against the filesystem.
    ///
    /// Only a failure to list the folder root aborts the pass. Records
    /// under a subdirectory that cannot be listed are marked invalid
    /// instead of being taken for deleted.
    pub async fn scan(&self) -> Result<ReconcileReport> {
        let snapshot = self.ignores.snapshot();
        let listing = self
            .scanner
            .list_files("")
            .await
            .map_err(ReconcileError::Walk)?;

        // Stored names the walk did not find are observed as missing
        let missing: Vec<String> = {
            let seen: HashSet<&str> = listing.files.iter().map(String::as_str).collect();
            self.store
                .names()
                .into_iter()
                .filter(|name| !seen.contains(name.as_str()) && !is_internal(name))
                .filter(|name| !listing.is_unknown(name))
                .collect()
        };

        let mut names = listing.files;
        names.extend(missing);
        self.reconcile_names(names, listing.failed, &snapshot).await
    }

    /// Reconcile only `paths` (and, for directories, everything beneath).
    pub async fn scan_paths(&self, paths: &[String]) -> Result<ReconcileReport> {
        let snapshot = self.ignores.snapshot();
        let stored = self.store.names();

        let mut names = BTreeSet::new();
        let mut unreadable = Vec::new();
        for path in paths {
            let path = path.trim_matches('/');
            if is_internal(path) {
                continue;
            }
            match self.scanner.list_files(path).await {
                Ok(listing) => {
                    names.extend(listing.files);
                    unreadable.extend(listing.failed);
                }
                Err(e) if path.is_empty() => return Err(ReconcileError::Walk(e)),
                Err(source) => unreadable.push(ScanError {
                    name: path.to_string(),
                    source,
                }),
            }

            names.extend(
                stored
                    .iter()
                    .filter(|name| is_within(name, path) && !is_internal(name))
                    .cloned(),
            );
        }
        names.retain(|name| !unreadable.iter().any(|err| is_within(name, &err.name)));
        self.reconcile_names(names.into_iter().collect(), unreadable, &snapshot)
            .await
    }

    /// Install a new rule set and re-evaluate every stored record.
    ///
    /// Identical rules are a no-op. Malformed rules are rejected before any
    /// record is touched.
    pub async fn set_ignores(&self, patterns: Vec<String>) -> Result<ReconcileReport> {
        if self.ignores.snapshot().patterns() == patterns.as_slice() {
            debug!("Ignore patterns unchanged for folder {}", self.folder);
            return Ok(ReconcileReport::default());
        }

        let snapshot = self.ignores.reload(patterns)?;
        info!(
            "Ignore patterns for folder {} now at revision {} ({} lines)",
            self.folder,
            snapshot.revision(),
            snapshot.patterns().len()
        );
        self.events.emit(FolderEvent::IgnoresChanged {
            folder: self.folder.clone(),
            revision: snapshot.revision(),
            patterns: snapshot.patterns().len(),
            timestamp: now_millis(),
        });

        let mut pass = Pass::default();
        for record in self.store.snapshot().records {
            let ignored = snapshot.is_ignored(&record.name);
            if ignored && !record.invalid {
                if let Some(next) = rules::apply_ignored(&record) {
                    self.apply(Some(&record), next, true, &mut pass)?;
                }
            } else if !ignored && record.invalid {
                // Stale content: look at the disk again before trusting it
                match self.scanner.scan_file(&record.name, true).await {
                    Ok(scan) => {
                        if let Some(next) =
                            rules::apply_scan(Some(&record), &scan, false, self.local)
                        {
                            self.apply(Some(&record), next, false, &mut pass)?;
                        }
                    }
                    Err(err) => self.fail(Some(&record), err, &mut pass)?,
                }
            }
        }

        let report = self.complete(pass)?;
        self.finish(&report);
        Ok(report)
    }

    async fn reconcile_names(
        &self,
        names: Vec<String>,
        unreadable: Vec<ScanError>,
        snapshot: &IgnoreSnapshot,
    ) -> Result<ReconcileReport> {
        let scanned = names.len();
        let mut pass = Pass::default();

        let results = self
            .scanner
            .scan_files(names, |name| !snapshot.is_ignored(name));
        futures::pin_mut!(results);
        while let Some(result) = results.next().await {
            match result {
                Ok(scan) => {
                    let existing = self.store.get(&scan.name);
                    let ignored = snapshot.is_ignored(&scan.name);
                    if let Some(next) =
                        rules::apply_scan(existing.as_ref(), &scan, ignored, self.local)
                    {
                        self.apply(existing.as_ref(), next, ignored, &mut pass)?;
                    }
                }
                Err(err) => {
                    let existing = self.store.get(&err.name);
                    self.fail(existing.as_ref(), err, &mut pass)?;
                }
            }
        }
        for err in unreadable {
            self.fail_subtree(err, &mut pass)?;
        }
        let report = self.complete(pass)?;

        debug!(
            "Scanned {} names in folder {}: {} updated, {} failed",
            scanned,
            self.folder,
            report.updated.len(),
            report.failed.len()
        );
        self.events.emit(FolderEvent::ScanCompleted {
            folder: self.folder.clone(),
            scanned,
            updated: report.updated.len(),
            failed: report.failed.len(),
            timestamp: now_millis(),
        });
        self.finish(&report);
        Ok(report)
    }

    fn apply(
        &self,
        existing: Option<&FileRecord>,
        next: FileRecord,
        ignored: bool,
        pass: &mut Pass,
    ) -> Result<()> {
        let was_invalid = existing.is_some_and(|r| r.invalid);
        let was_tombstone = existing.is_some_and(|r| r.deleted && !r.invalid);
        let name = next.name.clone();

        let report = &mut pass.report;
        if next.invalid && !was_invalid && ignored {
            report.ignored.push(name.clone());
        }
        if !next.invalid && was_invalid {
            report.unignored.push(name.clone());
        }
        if next.deleted && !next.invalid && !was_tombstone {
            report.deleted.push(name.clone());
        }
        report.updated.push(name);

        pass.pending.push(next);
        if pass.pending.len() >= WRITE_BATCH {
            self.flush(pass)?;
        }
        Ok(())
    }

    fn flush(&self, pass: &mut Pass) -> Result<()> {
        if pass.pending.is_empty() {
            return Ok(());
        }
        let records = std::mem::take(&mut pass.pending);
        self.store.upsert_batch(records)?;
        Ok(())
    }

    /// Write what is still pending and hand back the report.
    fn complete(&self, mut pass: Pass) -> Result<ReconcileReport> {
        self.flush(&mut pass)?;
        Ok(pass.report)
    }

    fn fail(
        &self,
        existing: Option<&FileRecord>,
        err: ScanError,
        pass: &mut Pass,
    ) -> Result<()> {
        self.report_failure(&err);
        self.mark_failed(existing, err.name, pass)
    }

    /// A directory could not be listed: every stored record beneath it
    /// becomes invalid, none is taken for deleted.
    fn fail_subtree(&self, err: ScanError, pass: &mut Pass) -> Result<()> {
        self.report_failure(&err);
        let names: Vec<String> = self
            .store
            .names()
            .into_iter()
            .filter(|name| is_within(name, &err.name))
            .collect();
        for name in names {
            let existing = self.store.get(&name);
            self.mark_failed(existing.as_ref(), name, pass)?;
        }
        Ok(())
    }

    fn report_failure(&self, err: &ScanError) {
        warn!("Folder {}: {}", self.folder, err);
        self.events.emit(FolderEvent::ScanItemFailed {
            folder: self.folder.clone(),
            name: err.name.clone(),
            error: err.source.to_string(),
            timestamp: now_millis(),
        });
    }

    fn mark_failed(
        &self,
        existing: Option<&FileRecord>,
        name: String,
        pass: &mut Pass,
    ) -> Result<()> {
        pass.report.failed.push(name);
        if let Some(next) = rules::apply_scan_error(existing) {
            self.apply(existing, next, false, pass)?;
        }
        Ok(())
    }

    fn finish(&self, report: &ReconcileReport) {
        if !report.has_changes() {
            return;
        }
        self.events.emit(FolderEvent::LocalIndexUpdated {
            folder: self.folder.clone(),
            items: report.updated.len(),
            filenames: report.updated.clone(),
            timestamp: now_millis(),
        });
    }

    fn log_failure(&self, what: &str, result: &Result<ReconcileReport>) {
        if let Err(e) = result {
            warn!("Folder {} {} failed: {}", self.folder, what, e);
        }
    }
}

//! Per-name transition rules.
//!
//! Each function takes the stored record (if any) and an observation and
//! returns the record to store, or `None` when nothing must change. A result
//! equivalent to the stored record is also `None`, so an unchanged folder
//! produces no upserts.

use crate::scanner::ScanResult;
use crate::{DeviceId, FileRecord, VersionVector};

/// Apply a successful scan of one name.
///
/// `ignored` is the verdict of the pinned ignore snapshot for `scan.name`.
pub fn apply_scan(
    existing: Option<&FileRecord>,
    scan: &ScanResult,
    ignored: bool,
    local: DeviceId,
) -> Option<FileRecord> {
    let next = match (existing, ignored) {
        // New file, ignored: tracked as invalid, no history of our own yet
        (None, true) => scan
            .exists
            .then(|| FileRecord::ignored_from_scan(scan, VersionVector::new())),

        // Ignored records are left alone; their content is not tracked
        (Some(cur), true) if cur.invalid => None,

        // Tombstone came back while ignored: keep the prior history
        (Some(cur), true) if cur.deleted && scan.exists => {
            Some(FileRecord::ignored_from_scan(scan, cur.version.clone()))
        }

        (Some(cur), true) => Some(cur.clone().into_invalid()),

        (None, false) => scan
            .exists
            .then(|| FileRecord::from_scan(scan, VersionVector::new().update(local), local)),

        (Some(cur), false) if cur.invalid => Some(revalidate(cur, scan, local)),

        (Some(cur), false) if cur.deleted => scan
            .exists
            .then(|| FileRecord::from_scan(scan, cur.version.update(local), local)),

        (Some(cur), false) => {
            if !scan.exists {
                Some(FileRecord::tombstone(
                    &cur.name,
                    cur.version.update(local),
                    Some(local),
                ))
            } else if cur.has_same_content(scan) {
                None
            } else {
                Some(FileRecord::from_scan(scan, cur.version.update(local), local))
            }
        }
    };
    changed(existing, next)
}

/// A record that was invalid and is not ignored anymore.
///
/// The stale record is not trusted. A file still on disk is a fresh
/// discovery on top of the old history. A file that vanished while it was
/// invalid gets a tombstone with an EMPTY version, which never outranks a
/// peer's copy.
fn revalidate(cur: &FileRecord, scan: &ScanResult, local: DeviceId) -> FileRecord {
    if scan.exists {
        FileRecord::from_scan(scan, cur.version.update(local), local)
    } else {
        FileRecord::tombstone(&cur.name, VersionVector::new(), None)
    }
}

/// A valid record whose name became ignored.
pub fn apply_ignored(existing: &FileRecord) -> Option<FileRecord> {
    (!existing.invalid).then(|| existing.clone().into_invalid())
}

/// A per-file read failure. Unknown names get no record.
pub fn apply_scan_error(existing: Option<&FileRecord>) -> Option<FileRecord> {
    let next = existing.map(|cur| cur.clone().into_invalid());
    changed(existing, next)
}

fn changed(existing: Option<&FileRecord>, next: Option<FileRecord>) -> Option<FileRecord> {
    next.filter(|next| !existing.is_some_and(|cur| cur.is_equivalent(next)))
}

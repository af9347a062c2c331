//! FileRecord: one entry of a folder index.

use crate::scanner::ScanResult;
use crate::{DeviceId, VersionVector};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Index metadata for a single file name within a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Folder-relative path, `/`-separated
    pub name: String,
    pub version: VersionVector,
    pub deleted: bool,
    /// Content must not be trusted or fetched (ignored, or failed to read)
    pub invalid: bool,
    pub size: u64,
    /// Modification time in milliseconds since epoch
    pub mod_time_ms: u64,
    /// Lowercase hex SHA-256 of the content, when it was read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Device that produced the current version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<DeviceId>,
    /// Local change number, assigned by the index store
    #[serde(default)]
    pub sequence: u64,
}

impl FileRecord {
    /// A valid, present file described by a scan.
    pub fn from_scan(scan: &ScanResult, version: VersionVector, modified_by: DeviceId) -> Self {
        Self {
            name: scan.name.clone(),
            version,
            deleted: false,
            invalid: false,
            size: scan.size,
            mod_time_ms: scan.mod_time_ms,
            signature: scan.signature.clone(),
            modified_by: Some(modified_by),
            sequence: 0,
        }
    }

    /// A valid deletion marker.
    pub fn tombstone(name: &str, version: VersionVector, modified_by: Option<DeviceId>) -> Self {
        Self {
            name: name.to_string(),
            version,
            deleted: true,
            invalid: false,
            size: 0,
            mod_time_ms: 0,
            signature: None,
            modified_by,
            sequence: 0,
        }
    }

    /// A present file that is ignored; its content is not tracked.
    pub fn ignored_from_scan(scan: &ScanResult, version: VersionVector) -> Self {
        Self {
            name: scan.name.clone(),
            version,
            deleted: false,
            invalid: true,
            size: scan.size,
            mod_time_ms: scan.mod_time_ms,
            signature: None,
            modified_by: None,
            sequence: 0,
        }
    }

    /// Same record flagged invalid. Version and deletion state are kept:
    /// hiding a file from peers is not an edit.
    pub fn into_invalid(self) -> Self {
        Self {
            invalid: true,
            ..self
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    /// Whether a scan of a present file describes exactly this record's content.
    pub fn has_same_content(&self, scan: &ScanResult) -> bool {
        scan.exists
            && !self.deleted
            && self.size == scan.size
            && self.mod_time_ms == scan.mod_time_ms
            && self.signature == scan.signature
    }

    /// Equality on everything a peer would observe, ignoring the local
    /// sequence and attribution.
    pub fn is_equivalent(&self, other: &FileRecord) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.deleted == other.deleted
            && self.invalid == other.invalid
            && self.size == other.size
            && self.mod_time_ms == other.mod_time_ms
            && self.signature == other.signature
    }
}

impl Display for FileRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (v{}, deleted={}, invalid={}, size={}, seq={})",
            self.name, self.version, self.deleted, self.invalid, self.size, self.sequence
        )
    }
}

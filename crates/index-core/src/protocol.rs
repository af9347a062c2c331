//! Index messages sent to peers.
//!
//! Wire format: `{"type":"index","folder":"...","kind":"full"|"update","files":[...]}`
//!
//! A `full` message starts a baseline: the receiver should treat the files
//! of that message and any `update`s that follow as the complete index.

use crate::FileRecord;
use serde::{Deserialize, Serialize};

/// Default upper bound on records per message.
pub const DEFAULT_MAX_BATCH_FILES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexKind {
    /// First message of a baseline snapshot
    Full,
    /// Continuation of a baseline, or incremental changes
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMessage {
    #[serde(rename = "type")]
    msg_type: String,
    pub folder: String,
    pub kind: IndexKind,
    pub files: Vec<FileRecord>,
}

impl IndexMessage {
    pub fn new(folder: &str, kind: IndexKind, files: Vec<FileRecord>) -> Self {
        Self {
            msg_type: "index".to_string(),
            folder: folder.to_string(),
            kind,
            files,
        }
    }

    pub fn full(folder: &str, files: Vec<FileRecord>) -> Self {
        Self::new(folder, IndexKind::Full, files)
    }

    pub fn update(folder: &str, files: Vec<FileRecord>) -> Self {
        Self::new(folder, IndexKind::Update, files)
    }

    /// Split a snapshot into baseline messages of at most `max_files`
    /// records. Always yields at least one message, the first `Full`.
    pub fn baseline(folder: &str, records: Vec<FileRecord>, max_files: usize) -> Vec<Self> {
        let max_files = max_files.max(1);
        if records.is_empty() {
            return vec![Self::full(folder, Vec::new())];
        }

        let mut messages = Vec::with_capacity(records.len().div_ceil(max_files));
        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            let chunk: Vec<_> = records.by_ref().take(max_files).collect();
            let kind = if messages.is_empty() {
                IndexKind::Full
            } else {
                IndexKind::Update
            };
            messages.push(Self::new(folder, kind, chunk));
        }
        messages
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("IndexMessage serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    ///
    /// Returns `None` for non-JSON input or if the `type` field isn't `"index"`.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        let msg: Self = serde_json::from_slice(data).ok()?;
        if msg.msg_type == "index" {
            Some(msg)
        } else {
            None
        }
    }
}

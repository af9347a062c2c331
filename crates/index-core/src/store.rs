//! IndexStore: authoritative name → FileRecord map for one folder.
//!
//! The reconciler is the only writer. Upserts arrive in batches; each batch
//! is persisted in one database write before the in-memory map changes,
//! then broadcast to subscribers (the per-peer distributors). Subscribing and snapshotting happen under one lock so a
//! subscriber sees every change after its snapshot exactly once.

use crate::db::{DbError, IndexDatabase};
use crate::FileRecord;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

pub const DEFAULT_CHANGE_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Index store for folder {0} is closed")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Notification for one applied upsert.
#[derive(Debug, Clone)]
pub struct IndexChange {
    pub record: FileRecord,
    /// Whether a record with this name was already present
    pub existed: bool,
    pub sequence: u64,
}

/// Point-in-time copy of a folder index, ordered by name.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// Sequence of the last change included
    pub sequence: u64,
    pub records: Vec<FileRecord>,
}

struct StoreState {
    records: BTreeMap<String, FileRecord>,
    sequence: u64,
    notify: Option<broadcast::Sender<IndexChange>>,
}

pub struct IndexStore {
    folder: String,
    db: Arc<dyn IndexDatabase>,
    state: RwLock<StoreState>,
    /// Serializes writers across the database write
    writer: Mutex<()>,
}

impl IndexStore {
    /// Load the folder's persisted records and open the change channel.
    pub fn open(folder: &str, db: Arc<dyn IndexDatabase>, capacity: usize) -> Result<Self> {
        let mut records = BTreeMap::new();
        let mut sequence = 0;
        for record in db.load_folder(folder)? {
            sequence = sequence.max(record.sequence);
            records.insert(record.name.clone(), record);
        }
        let (tx, _) = broadcast::channel(capacity.max(1));

        Ok(Self {
            folder: folder.to_string(),
            db,
            state: RwLock::new(StoreState {
                records,
                sequence,
                notify: Some(tx),
            }),
            writer: Mutex::new(()),
        })
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Assign the next sequence, persist, replace, notify.
    #[cfg(test)]
    pub(crate) fn upsert(&self, record: FileRecord) -> Result<IndexChange> {
        let mut changes = self.upsert_batch(vec![record])?;
        Ok(changes.remove(0))
    }

    /// Assign consecutive sequences, persist all records in one database
    /// write, then replace and notify in order.
    ///
    /// If persisting fails nothing in memory changes. Readers are only
    /// blocked while the batch is applied in memory, not during the write.
    pub(crate) fn upsert_batch(&self, mut records: Vec<FileRecord>) -> Result<Vec<IndexChange>> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let base = self.state.read().unwrap_or_else(|e| e.into_inner()).sequence;
        for (offset, record) in (1..).zip(records.iter_mut()) {
            record.sequence = base + offset;
        }
        self.db.put_records(&self.folder, &records)?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut changes = Vec::with_capacity(records.len());
        for record in records {
            let sequence = record.sequence;
            state.sequence = sequence;
            let existed = state
                .records
                .insert(record.name.clone(), record.clone())
                .is_some();
            let change = IndexChange {
                record,
                existed,
                sequence,
            };
            trace!("Upsert in {}: {}", self.folder, change.record);
            if let Some(tx) = &state.notify {
                // No receivers is fine: no peer is connected
                let _ = tx.send(change.clone());
            }
            changes.push(change);
        }
        Ok(changes)
    }

    pub fn get(&self, name: &str) -> Option<FileRecord> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .get(name)
            .cloned()
    }

    /// Names of all stored records, in order.
    pub fn names(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .keys()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Self::snapshot_locked(&state)
    }

    /// Subscribe to changes, together with the snapshot they follow.
    pub fn subscribe(&self) -> Result<(broadcast::Receiver<IndexChange>, StoreSnapshot)> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let tx = state
            .notify
            .as_ref()
            .ok_or_else(|| StoreError::Closed(self.folder.clone()))?;
        Ok((tx.subscribe(), Self::snapshot_locked(&state)))
    }

    pub fn sequence(&self) -> u64 {
        self.state.read().unwrap_or_else(|e| e.into_inner()).sequence
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(|e| e.into_inner()).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the change sender; subscribers drain what is queued, then see
    /// the channel close.
    pub fn close(&self) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .notify = None;
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .notify
            .is_none()
    }

    fn snapshot_locked(state: &StoreState) -> StoreSnapshot {
        StoreSnapshot {
            sequence: state.sequence,
            records: state.records.values().cloned().collect(),
        }
    }
}

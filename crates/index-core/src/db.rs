//! IndexDatabase trait for durable index storage.
//!
//! Implementations:
//! - `MemoryDatabase` - For testing
//! - `JsonIndexDatabase` (in index-daemon) - One JSON file per folder
//!
//! Calls are synchronous: a batch upsert must not contain an await point,
//! so a cancelled reconciler can never leave memory and storage disagreeing.

use crate::FileRecord;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub trait IndexDatabase: Send + Sync {
    /// All stored records for `folder`, in any order. Unknown folders are empty.
    fn load_folder(&self, folder: &str) -> Result<Vec<FileRecord>>;

    /// Insert or replace the record with the same name.
    fn put_record(&self, folder: &str, record: &FileRecord) -> Result<()>;

    /// Insert or replace several records, later ones winning on equal names.
    ///
    /// The index store calls this once per batch. Implementations that
    /// rewrite a whole file should override it to write once.
    fn put_records(&self, folder: &str, records: &[FileRecord]) -> Result<()> {
        records
            .iter()
            .try_for_each(|record| self.put_record(folder, record))
    }
}

/// In-memory database for testing.
#[derive(Default)]
pub struct MemoryDatabase {
    folders: RwLock<HashMap<String, BTreeMap<String, FileRecord>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexDatabase for MemoryDatabase {
    fn load_folder(&self, folder: &str) -> Result<Vec<FileRecord>> {
        let folders = self.folders.read().unwrap_or_else(|e| e.into_inner());
        Ok(folders
            .get(folder)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    fn put_record(&self, folder: &str, record: &FileRecord) -> Result<()> {
        self.folders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(folder.to_string())
            .or_default()
            .insert(record.name.clone(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VersionVector;

    #[test]
    fn test_put_replaces_by_name() {
        let db = MemoryDatabase::new();
        let mut record = FileRecord::tombstone("a", VersionVector::new(), None);
        db.put_record("f", &record).unwrap();
        record.sequence = 2;
        db.put_record("f", &record).unwrap();

        let loaded = db.load_folder("f").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].sequence, 2);
        assert!(db.load_folder("other").unwrap().is_empty());
    }
}

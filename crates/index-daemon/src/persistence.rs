//! JSON index database.
//!
//! Each folder's index is stored as one pretty-printed JSON file under the
//! data directory (`<data_dir>/<folder>.index.json`). Writes go to a temporary
//! file that is renamed into place, so a crash never leaves a torn index.

use index_core::db::{DbError, IndexDatabase, Result};
use index_core::FileRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// On-disk layout of one folder's index.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedIndex {
    pub folder: String,
    #[serde(default)]
    pub records: Vec<FileRecord>,
}

/// Index database backed by JSON files.
pub struct JsonIndexDatabase {
    dir: PathBuf,
    /// Records already loaded or written, per folder
    cache: Mutex<HashMap<String, BTreeMap<String, FileRecord>>>,
}

impl JsonIndexDatabase {
    /// Open (and create if needed) the database directory.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the index file for `folder`.
    ///
    /// Bytes outside `[A-Za-z0-9_-]` are percent-encoded, so distinct folder
    /// ids always get distinct files inside the data directory.
    pub fn folder_path(&self, folder: &str) -> PathBuf {
        let mut safe = String::with_capacity(folder.len());
        for byte in folder.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                safe.push(byte as char);
            } else {
                safe.push_str(&format!("%{:02X}", byte));
            }
        }
        self.dir.join(format!("{}.index.json", safe))
    }

    fn read_file(&self, folder: &str) -> Result<BTreeMap<String, FileRecord>> {
        let path = self.folder_path(folder);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let contents = fs::read_to_string(&path)?;
        let persisted: PersistedIndex = serde_json::from_str(&contents)?;
        debug!(
            "Loaded {} records for {} from {}",
            persisted.records.len(),
            folder,
            path.display()
        );
        Ok(persisted
            .records
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect())
    }

    fn write_file(&self, folder: &str, records: &BTreeMap<String, FileRecord>) -> Result<()> {
        let persisted = PersistedIndex {
            folder: folder.to_string(),
            records: records.values().cloned().collect(),
        };
        let contents = serde_json::to_string_pretty(&persisted)?;

        let path = self.folder_path(folder);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path).map_err(DbError::from)
    }
}

impl IndexDatabase for JsonIndexDatabase {
    fn load_folder(&self, folder: &str) -> Result<Vec<FileRecord>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if !cache.contains_key(folder) {
            let records = self.read_file(folder)?;
            cache.insert(folder.to_string(), records);
        }
        Ok(cache
            .get(folder)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    fn put_record(&self, folder: &str, record: &FileRecord) -> Result<()> {
        self.put_records(folder, std::slice::from_ref(record))
    }

    /// Apply the whole batch to the cached index and rewrite the file once.
    fn put_records(&self, folder: &str, batch: &[FileRecord]) -> Result<()> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if !cache.contains_key(folder) {
            let records = self.read_file(folder)?;
            cache.insert(folder.to_string(), records);
        }
        let Some(records) = cache.get_mut(folder) else {
            return Ok(());
        };

        let before = records.clone();
        for record in batch {
            records.insert(record.name.clone(), record.clone());
        }
        if let Err(e) = self.write_file(folder, records) {
            // Keep the cache in step with the file
            *records = before;
            return Err(e);
        }
        debug!("Persisted {} records for {}", batch.len(), folder);
        Ok(())
    }
}

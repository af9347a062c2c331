//! Daemon configuration loading.
//!
//! The configuration is a camelCase JSON document; every field has a
//! default, so an empty object is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use index_core::{DeviceId, DistributorConfig, FolderConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Address to listen on for incoming connections
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Our device id (generated if not set)
    #[serde(default)]
    pub device_id: Option<DeviceId>,

    /// Directory holding the persisted indexes
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub folders: Vec<FolderEntry>,

    /// WebSocket URLs of peers to dial
    #[serde(default)]
    pub peers: Vec<String>,

    /// Coalescing window for index updates, in milliseconds
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: u64,

    /// Maximum files per index message
    #[serde(default = "default_max_batch_files")]
    pub max_batch_files: usize,
}

/// A folder on disk and who it is shared with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderEntry {
    /// Root directory of the folder
    pub path: PathBuf,

    #[serde(flatten)]
    pub folder: FolderConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            device_id: None,
            data_dir: default_data_dir(),
            folders: Vec::new(),
            peers: Vec::new(),
            coalesce_ms: default_coalesce_ms(),
            max_batch_files: default_max_batch_files(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".index-daemon")
}

fn default_coalesce_ms() -> u64 {
    index_core::distributor::DEFAULT_COALESCE_WINDOW.as_millis() as u64
}

fn default_max_batch_files() -> usize {
    index_core::protocol::DEFAULT_MAX_BATCH_FILES
}

impl DaemonConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.folders {
            if entry.folder.id.is_empty() {
                bail!("Folder at {} has no id", entry.path.display());
            }
            if !seen.insert(entry.folder.id.as_str()) {
                bail!("Duplicate folder id: {}", entry.folder.id);
            }
        }
        if self.max_batch_files == 0 {
            bail!("maxBatchFiles must be at least 1");
        }
        Ok(())
    }

    pub fn distributor(&self) -> DistributorConfig {
        DistributorConfig {
            coalesce_window: Duration::from_millis(self.coalesce_ms),
            max_batch_files: self.max_batch_files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: DaemonConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert!(config.device_id.is_none());
        assert!(config.folders.is_empty());
        assert_eq!(config.distributor().coalesce_window, Duration::from_millis(250));
        config.validate().unwrap();
    }

    #[test]
    fn test_folder_entries() {
        let json = r#"{
            "deviceId": "00000000000000aa",
            "folders": [
                {
                    "id": "notes",
                    "path": "/srv/notes",
                    "devices": ["00000000000000bb"],
                    "ignorePatterns": ["*.tmp"]
                }
            ],
            "peers": ["ws://peer:8080"]
        }"#;
        let config: DaemonConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.device_id, Some(DeviceId::from(0xaa)));
        let entry = &config.folders[0];
        assert_eq!(entry.path, PathBuf::from("/srv/notes"));
        assert_eq!(entry.folder.id, "notes");
        assert_eq!(entry.folder.devices, vec![DeviceId::from(0xbb)]);
        assert_eq!(entry.folder.ignore_patterns, vec!["*.tmp"]);
        assert_eq!(config.peers, vec!["ws://peer:8080"]);
    }

    #[test]
    fn test_duplicate_folder_rejected() {
        let json = r#"{
            "folders": [
                {"id": "a", "path": "/one"},
                {"id": "a", "path": "/two"}
            ]
        }"#;
        let config: DaemonConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"listen": "127.0.0.1:9000"}"#).unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");

        std::fs::write(&path, "not json").unwrap();
        assert!(DaemonConfig::load(&path).is_err());
    }
}

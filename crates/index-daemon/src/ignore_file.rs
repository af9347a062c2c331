//! `.syncignore` loading.
//!
//! A folder's ignore rules live in `.syncignore` at the folder root, one
//! gitignore-style pattern per line. When the file is absent the patterns
//! from the daemon configuration apply.

use index_core::fs::{FileSystem, FsError};
use index_core::IgnoreMatcher;

/// Name of the ignore file in each folder root.
pub const IGNORE_FILE: &str = ".syncignore";

/// Whether a folder-relative path is the ignore file.
pub fn is_ignore_file(path: &str) -> bool {
    path == IGNORE_FILE
}

/// Read the folder's ignore patterns, `None` if there is no ignore file.
pub async fn load_patterns(fs: &dyn FileSystem) -> Result<Option<Vec<String>>, FsError> {
    match fs.read(IGNORE_FILE).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            Ok(Some(IgnoreMatcher::parse_rules(&text)))
        }
        Err(FsError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use index_core::InMemoryFs;

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let fs = InMemoryFs::new();
        assert!(load_patterns(&fs).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reads_one_pattern_per_line() {
        let fs = InMemoryFs::new();
        fs.write(IGNORE_FILE, b"*.tmp\r\n# comment\nbuild/\n")
            .await
            .unwrap();

        let patterns = load_patterns(&fs).await.unwrap().unwrap();
        assert_eq!(patterns, vec!["*.tmp", "# comment", "build/"]);
    }

    #[tokio::test]
    async fn test_read_failure_is_reported() {
        let fs = InMemoryFs::new();
        fs.write(IGNORE_FILE, b"*.tmp").await.unwrap();
        fs.fail_reads(IGNORE_FILE);
        assert!(load_patterns(&fs).await.is_err());
    }

    #[test]
    fn test_is_ignore_file() {
        assert!(is_ignore_file(".syncignore"));
        assert!(!is_ignore_file("sub/.syncignore"));
    }
}

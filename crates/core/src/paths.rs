//! Collector directory structure
//!
//! All collector state lives under a single data root:
//!
//! ```text
//! data/
//! ├── wal/                 # Write-ahead log segments
//! │   ├── wal_20240115_143000_000000000001.wal
//! │   └── archive/         # gzip copies of truncated segments
//! ├── SPY/                 # sink output (layout per naming convention)
//! │   └── 2024-01-15.jsonl
//! └── ...
//! ```

use std::path::{Path, PathBuf};

/// Directory name of the WAL subtree beneath the data root
pub const WAL_DIR_NAME: &str = "wal";

/// Directory name for archived (truncated) WAL segments
pub const WAL_ARCHIVE_DIR_NAME: &str = "archive";

/// Collector directory paths
///
/// Provides access to all paths within the data root.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Create paths from the data root directory
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        DataPaths {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The data root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The WAL directory
    pub fn wal_dir(&self) -> PathBuf {
        self.root.join(WAL_DIR_NAME)
    }

    /// The archived-segment directory
    pub fn wal_archive_dir(&self) -> PathBuf {
        self.wal_dir().join(WAL_ARCHIVE_DIR_NAME)
    }

    /// Check whether a path lies inside the WAL subtree
    ///
    /// Retention and packaging must never touch WAL files.
    pub fn is_wal_path(&self, path: &Path) -> bool {
        path.starts_with(self.wal_dir())
    }

    /// Create the data root and WAL directories
    pub fn create_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.wal_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_from_root() {
        let paths = DataPaths::from_root("/tmp/data");

        assert_eq!(paths.root(), Path::new("/tmp/data"));
        assert_eq!(paths.wal_dir(), PathBuf::from("/tmp/data/wal"));
        assert_eq!(paths.wal_archive_dir(), PathBuf::from("/tmp/data/wal/archive"));
    }

    #[test]
    fn test_is_wal_path() {
        let paths = DataPaths::from_root("/tmp/data");
        assert!(paths.is_wal_path(Path::new("/tmp/data/wal/x.wal")));
        assert!(paths.is_wal_path(Path::new("/tmp/data/wal/archive/x.wal.gz")));
        assert!(!paths.is_wal_path(Path::new("/tmp/data/SPY/2024-01-15.jsonl")));
    }

    #[test]
    fn test_create_directories() {
        let dir = tempdir().unwrap();
        let paths = DataPaths::from_root(dir.path().join("data"));

        paths.create_directories().unwrap();

        assert!(paths.root().exists());
        assert!(paths.wal_dir().exists());
        // The archive directory is created lazily on first truncation
        assert!(!paths.wal_archive_dir().exists());
    }
}

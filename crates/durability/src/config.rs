//! WAL configuration

use crate::mode::SyncMode;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// WAL configuration parameters
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the segment files
    pub dir: PathBuf,

    /// Maximum segment size in bytes (default: 100 MiB)
    ///
    /// When an append would push the current segment past this size,
    /// the segment rotates first.
    pub max_segment_bytes: u64,

    /// Maximum segment age before rotation (default: 1 hour, None disables)
    pub max_segment_age: Option<Duration>,

    /// Sync mode (default: BatchedSync)
    pub sync_mode: SyncMode,

    /// Records between fsyncs in BatchedSync mode (default: 1000)
    pub sync_batch_size: usize,

    /// Maximum time between fsyncs in BatchedSync mode (default: 1 s)
    pub max_flush_delay: Duration,

    /// gzip truncated segments into `archive/` instead of deleting (default: true)
    pub archive_after_truncate: bool,
}

impl WalConfig {
    /// Create a configuration with default values for the given directory
    pub fn new(dir: impl AsRef<Path>) -> Self {
        WalConfig {
            dir: dir.as_ref().to_path_buf(),
            max_segment_bytes: 100 * 1024 * 1024,
            max_segment_age: Some(Duration::from_secs(3600)),
            sync_mode: SyncMode::BatchedSync,
            sync_batch_size: 1000,
            max_flush_delay: Duration::from_secs(1),
            archive_after_truncate: true,
        }
    }

    /// Set the maximum segment size (builder pattern)
    pub fn with_max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes;
        self
    }

    /// Set the maximum segment age (builder pattern)
    pub fn with_max_segment_age(mut self, age: Option<Duration>) -> Self {
        self.max_segment_age = age;
        self
    }

    /// Set the sync mode (builder pattern)
    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Set the batched-sync record threshold (builder pattern)
    pub fn with_sync_batch_size(mut self, size: usize) -> Self {
        self.sync_batch_size = size;
        self
    }

    /// Set the batched-sync time threshold (builder pattern)
    pub fn with_max_flush_delay(mut self, delay: Duration) -> Self {
        self.max_flush_delay = delay;
        self
    }

    /// Keep or drop truncated segments (builder pattern)
    pub fn with_archive_after_truncate(mut self, archive: bool) -> Self {
        self.archive_after_truncate = archive;
        self
    }

    /// The archive directory for truncated segments
    pub fn archive_dir(&self) -> PathBuf {
        self.dir.join("archive")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), WalConfigError> {
        if self.max_segment_bytes < 1024 {
            return Err(WalConfigError::SegmentSizeTooSmall);
        }
        if self.sync_batch_size == 0 {
            return Err(WalConfigError::ZeroSyncBatch);
        }
        Ok(())
    }

    /// Configuration optimized for tests (small segments, strict sync)
    pub fn for_testing(dir: impl AsRef<Path>) -> Self {
        WalConfig::new(dir)
            .with_max_segment_bytes(64 * 1024)
            .with_sync_mode(SyncMode::EveryWrite)
    }
}

/// WAL configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalConfigError {
    /// Segment size is too small (minimum 1 KiB)
    #[error("WAL segment size must be at least 1KiB")]
    SegmentSizeTooSmall,

    /// Batched sync threshold of zero would never fsync
    #[error("sync batch size must be at least 1")]
    ZeroSyncBatch,
}

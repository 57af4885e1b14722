//! WAL sync mode
//!
//! Controls when segments are fsynced to disk.

use serde::{Deserialize, Serialize};

/// Sync mode for WAL appends
///
/// | Mode | fsync | Data Loss Window |
/// |------|-------|-----------------|
/// | NoSync | Never | All OS-buffered records |
/// | EveryWrite | Every append | Zero |
/// | BatchedSync | Periodic | Up to batch/interval |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// Rely on the OS page cache; fastest, graceful-shutdown durability only
    NoSync,

    /// fsync when enough records or enough time has accumulated (the default)
    ///
    /// Thresholds come from `WalConfig::sync_batch_size` and
    /// `WalConfig::max_flush_delay`.
    #[default]
    BatchedSync,

    /// fsync after every append; slowest, zero-loss
    EveryWrite,
}

impl SyncMode {
    /// True when `flush` must fsync rather than only draining buffers
    pub fn requires_fsync(&self) -> bool {
        !matches!(self, SyncMode::NoSync)
    }

    /// True when every single append must fsync before returning
    pub fn fsync_every_write(&self) -> bool {
        matches!(self, SyncMode::EveryWrite)
    }

    /// Parse a tag (used by the env overlay)
    pub fn from_tag(tag: &str) -> Option<SyncMode> {
        match tag {
            "noSync" | "no_sync" | "nosync" => Some(SyncMode::NoSync),
            "batchedSync" | "batched_sync" | "batched" => Some(SyncMode::BatchedSync),
            "everyWrite" | "every_write" => Some(SyncMode::EveryWrite),
            _ => None,
        }
    }

    /// Human-readable description of the mode
    pub fn description(&self) -> &'static str {
        match self {
            SyncMode::NoSync => "NoSync (OS page cache only)",
            SyncMode::BatchedSync => "BatchedSync (periodic fsync)",
            SyncMode::EveryWrite => "EveryWrite (fsync per append)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_batched() {
        assert_eq!(SyncMode::default(), SyncMode::BatchedSync);
    }

    #[test]
    fn test_fsync_predicates() {
        assert!(!SyncMode::NoSync.requires_fsync());
        assert!(SyncMode::BatchedSync.requires_fsync());
        assert!(SyncMode::EveryWrite.requires_fsync());

        assert!(SyncMode::EveryWrite.fsync_every_write());
        assert!(!SyncMode::BatchedSync.fsync_every_write());
    }

    #[test]
    fn test_from_tag() {
        assert_eq!(SyncMode::from_tag("noSync"), Some(SyncMode::NoSync));
        assert_eq!(SyncMode::from_tag("batched"), Some(SyncMode::BatchedSync));
        assert_eq!(SyncMode::from_tag("every_write"), Some(SyncMode::EveryWrite));
        assert_eq!(SyncMode::from_tag("bogus"), None);
    }
}

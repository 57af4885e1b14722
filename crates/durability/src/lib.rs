//! Durability layer for the market-data collector
//!
//! This crate owns the write-ahead log:
//!
//! - WAL records: sequenced, checksummed, newline-delimited text lines
//! - Segments: append-only files rotated by size and age
//! - Sync modes: NoSync, BatchedSync (default), EveryWrite
//! - Recovery: forward scan yielding events past the final COMMIT
//! - Truncation: covered segments are gzip-archived or deleted

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod log;
pub mod mode;
pub mod record;
pub mod recovery;
pub mod segment;

pub use config::{WalConfig, WalConfigError};
pub use log::{TruncateInfo, WalCounters, WalError, WalResult, WriteAheadLog};
pub use mode::SyncMode;
pub use record::{
    WalRecord, WalRecordError, WalRecordType, CHECKSUM_HEX_LEN, MAX_COMMIT_PAYLOAD_LEN,
};
pub use recovery::{RecoveredEvent, UncommittedRecords};
pub use segment::{
    list_segment_files, scan_segment, segment_file_name, segment_header, ClosedSegment,
    SegmentScan, WalSegment, SEGMENT_FORMAT_VERSION, SEGMENT_MAGIC,
};

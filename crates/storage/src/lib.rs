//! On-disk storage layer for the market-data collector
//!
//! This crate owns everything beneath the data root except the WAL:
//!
//! - Atomic whole-file writes (temp + fsync + rename, checksum sidecars)
//! - The path policy mapping events to destination paths
//! - The JSONL and columnar primary sinks
//! - Retention sweeps over sink output

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod atomic;
pub mod columnar;
pub mod jsonl;
pub mod path_policy;
pub mod retention;
pub mod sink;

pub use columnar::{ColumnarCompression, ColumnarSink, ColumnarSinkConfig};
pub use jsonl::{JsonlSink, JsonlSinkConfig};
pub use path_policy::{DatePartition, NamingConvention, PathPolicy, SinkFormat, StorageLayout};
pub use retention::{RetentionConfig, RetentionManager, SweepStats, MIN_SWEEP_INTERVAL};
pub use sink::{EventSink, FanoutSink, SinkError, SinkResult};

pub use atomic::AtomicWriteError;

//! Portable archives and replay for the market-data collector
//!
//! - Packager: self-contained, verifiable zip packages of sink output
//!   (manifest with per-file SHA-256, checksum list, schema descriptors)
//! - Extract with a path-traversal guard and post-extract verification
//! - Replay reader: forward scan over committed JSONL files

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod manifest;
pub mod packager;
pub mod replay;

pub use manifest::{
    derive_symbols, extract_event_type, extract_symbol, DateRange, PackageFilter,
    PackageManifest, PackageTotals, PackagedFile, MANIFEST_VERSION, MAX_MANIFEST_SYMBOLS,
};
pub use packager::{
    ArchivePackager, ExtractReport, PackageError, PackageInfo, PackageVerifyReport,
    PackagerConfig, CHECKSUMS_ENTRY, DATA_PREFIX, MANIFEST_ENTRY, README_ENTRY, SCHEMAS_PREFIX,
};
pub use replay::{ReplayIter, ReplayOptions, ReplayReader, DEFAULT_MIN_SIZE_FOR_MAPPING};

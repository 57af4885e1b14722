//! Package manifest types
//!
//! The manifest is the first file read when opening a package. It carries
//! format metadata, a per-file SHA-256 table for integrity verification,
//! and a summary of the packaged data (symbols, date range, totals).

use chrono::NaiveDate;
use mdc_core::{EventType, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Current manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Upper bound on symbols derived into a manifest
pub const MAX_MANIFEST_SYMBOLS: usize = 1000;

/// Package manifest, serialized as `manifest.json` at the package root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    /// Format version (currently 1)
    pub manifest_version: u32,
    /// Human-chosen package name
    pub package_name: String,
    /// ISO 8601 creation timestamp
    pub created_at: String,
    /// Aggregate counts
    pub totals: PackageTotals,
    /// Symbols present, derived lexically from file paths
    pub symbols: Vec<String>,
    /// Min/max dates of packaged files, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    /// Per-file entries with digests
    pub files: Vec<PackagedFile>,
}

/// Aggregate counts over packaged files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageTotals {
    /// Number of data files
    pub file_count: usize,
    /// Sum of data-file sizes in bytes
    pub total_bytes: u64,
}

/// Inclusive date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    /// Earliest date
    pub from: NaiveDate,
    /// Latest date
    pub to: NaiveDate,
}

/// One packaged data file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackagedFile {
    /// Path relative to the data root (also the path under `data/`)
    pub path: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Lowercase-hex SHA-256 of the file contents
    pub sha256: String,
    /// ISO 8601 last-modified timestamp
    pub last_modified: String,
}

/// Selection of files to package
#[derive(Debug, Clone, Default)]
pub struct PackageFilter {
    /// Keep only files attributable to these symbols (empty: all)
    pub symbols: Vec<Symbol>,
    /// Keep only files attributable to these event types (empty: all)
    pub event_types: Vec<EventType>,
    /// Keep only files last modified on or after this date
    pub from: Option<NaiveDate>,
    /// Keep only files last modified on or before this date
    pub to: Option<NaiveDate>,
}

impl PackageFilter {
    /// A filter that matches everything
    pub fn all() -> Self {
        PackageFilter::default()
    }

    /// Restrict to the given symbols (builder pattern)
    pub fn with_symbols(mut self, symbols: Vec<Symbol>) -> Self {
        self.symbols = symbols;
        self
    }

    /// Restrict to the given event types (builder pattern)
    pub fn with_event_types(mut self, types: Vec<EventType>) -> Self {
        self.event_types = types;
        self
    }

    /// Restrict to a modification-date range (builder pattern)
    pub fn with_date_range(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    /// Decide whether a data file belongs in the package
    pub fn matches(&self, relative_path: &Path, modified: NaiveDate) -> bool {
        if let Some(from) = self.from {
            if modified < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if modified > to {
                return false;
            }
        }
        if !self.symbols.is_empty() {
            let found = extract_symbol(relative_path);
            match found {
                Some(sym) => {
                    if !self.symbols.iter().any(|s| s.path_component() == sym) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if !self.event_types.is_empty() {
            match extract_event_type(relative_path) {
                // Files without a recognizable type (e.g. BySymbol layout)
                // are kept: the type filter can only narrow what it can see
                Some(ty) => {
                    if !self.event_types.contains(&ty) {
                        return false;
                    }
                }
                None => {}
            }
        }
        true
    }
}

/// Extract a symbol from a relative data path by a bounded lexical rule.
///
/// Directory components are checked first, then the first `_`-separated
/// fragment of the filename (the columnar key embeds it there). A
/// component counts as a symbol when it validates as one and carries at
/// least one uppercase letter, which rules out date directories and type
/// tags.
pub fn extract_symbol(relative_path: &Path) -> Option<String> {
    let looks_like_symbol = |s: &str| {
        Symbol::parse(s.replace('-', "/")).is_ok() || Symbol::parse(s).is_ok()
    };
    let has_upper = |s: &str| s.chars().any(|c| c.is_ascii_uppercase());

    for component in relative_path.iter() {
        let s = component.to_string_lossy();
        if component == relative_path.file_name().unwrap_or_default() {
            break;
        }
        if looks_like_symbol(&s) && has_upper(&s) {
            return Some(s.to_string());
        }
    }

    let stem = relative_path.file_stem()?.to_string_lossy();
    let first = stem.split('_').next()?;
    if looks_like_symbol(first) && has_upper(first) {
        return Some(first.to_string());
    }
    None
}

/// Extract an event type from a relative data path, if the layout shows one
pub fn extract_event_type(relative_path: &Path) -> Option<EventType> {
    for component in relative_path.iter() {
        if let Some(ty) = EventType::from_tag(&component.to_string_lossy()) {
            return Some(ty);
        }
    }
    let stem = relative_path.file_stem()?.to_string_lossy();
    // Columnar filenames embed the tag as `<symbol>_<type>_<date>`
    let stripped = stem.strip_suffix(".jsonl").unwrap_or(&*stem);
    let fragments: Vec<&str> = stripped.split('_').collect();
    for width in (1..=2).rev() {
        for window in fragments.windows(width) {
            if let Some(ty) = EventType::from_tag(&window.join("_")) {
                return Some(ty);
            }
        }
    }
    None
}

/// Derive the bounded symbol set for a manifest from its file paths
pub fn derive_symbols(paths: &[String]) -> Vec<String> {
    let mut symbols = BTreeSet::new();
    for path in paths {
        if symbols.len() >= MAX_MANIFEST_SYMBOLS {
            break;
        }
        if let Some(sym) = extract_symbol(Path::new(path)) {
            symbols.insert(sym);
        }
    }
    symbols.into_iter().collect()
}

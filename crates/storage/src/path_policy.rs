//! Destination path policy
//!
//! Pure function from event attributes + storage layout to a destination
//! path beneath the data root. Stateless: the same input always yields the
//! same output. The sinks never invent paths on their own; every output
//! file location flows through this module.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use mdc_core::{EventType, MarketEvent, Symbol};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory layout convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum NamingConvention {
    /// Everything in one directory
    Flat,
    /// `<symbol>/` (the default)
    #[default]
    BySymbol,
    /// `<YYYY>/<MM>/<DD>/`
    ByDate,
    /// `<type>/`
    ByType,
    /// `<source>/`
    BySource,
    /// `<asset class>/<symbol>/`
    ByAssetClass,
    /// `<source>/<symbol>/<type>/<YYYY>/<MM>/<DD>/`
    Hierarchical,
    /// `<symbol>/<type>/<YYYY>/<MM>/`
    Canonical,
}

impl NamingConvention {
    /// Parse a camelCase or snake_case tag (used by the env overlay)
    pub fn from_tag(tag: &str) -> Option<NamingConvention> {
        match tag {
            "flat" => Some(NamingConvention::Flat),
            "bySymbol" | "by_symbol" => Some(NamingConvention::BySymbol),
            "byDate" | "by_date" => Some(NamingConvention::ByDate),
            "byType" | "by_type" => Some(NamingConvention::ByType),
            "bySource" | "by_source" => Some(NamingConvention::BySource),
            "byAssetClass" | "by_asset_class" => Some(NamingConvention::ByAssetClass),
            "hierarchical" => Some(NamingConvention::Hierarchical),
            "canonical" => Some(NamingConvention::Canonical),
            _ => None,
        }
    }
}

/// Filename date partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum DatePartition {
    /// Fixed stem per destination
    None,
    /// `YYYY-MM-DD` (the default)
    #[default]
    Daily,
    /// `YYYY-MM-DD-HH`
    Hourly,
    /// `YYYY-MM`
    Monthly,
}

impl DatePartition {
    /// Parse a tag (used by the env overlay)
    pub fn from_tag(tag: &str) -> Option<DatePartition> {
        match tag {
            "none" => Some(DatePartition::None),
            "daily" => Some(DatePartition::Daily),
            "hourly" => Some(DatePartition::Hourly),
            "monthly" => Some(DatePartition::Monthly),
            _ => None,
        }
    }

    fn stem(&self, ts: &DateTime<Utc>) -> String {
        match self {
            DatePartition::None => "events".to_string(),
            DatePartition::Daily => ts.format("%Y-%m-%d").to_string(),
            DatePartition::Hourly => ts.format("%Y-%m-%d-%H").to_string(),
            DatePartition::Monthly => ts.format("%Y-%m").to_string(),
        }
    }
}

/// Output file format, deciding the extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFormat {
    /// Line-delimited JSON
    Jsonl,
    /// Line-delimited JSON, gzip-compressed
    JsonlGz,
    /// Columnar batch file
    Parquet,
}

impl SinkFormat {
    /// File extension including the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            SinkFormat::Jsonl => ".jsonl",
            SinkFormat::JsonlGz => ".jsonl.gz",
            SinkFormat::Parquet => ".parquet",
        }
    }
}

/// Storage layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageLayout {
    /// Directory layout convention
    pub naming_convention: NamingConvention,
    /// Filename date partition
    pub date_partition: DatePartition,
    /// Prepend the producing source to filenames
    pub include_provider: bool,
    /// Optional filename prefix
    pub file_prefix: Option<String>,
    /// Delete data files older than this many days
    pub retention_days: Option<u32>,
    /// Prune oldest data files beyond this total size
    pub max_total_megabytes: Option<u64>,
}

impl Default for StorageLayout {
    fn default() -> Self {
        StorageLayout {
            naming_convention: NamingConvention::BySymbol,
            date_partition: DatePartition::Daily,
            include_provider: false,
            file_prefix: None,
            retention_days: None,
            max_total_megabytes: None,
        }
    }
}

/// Deterministic event-to-path mapping
#[derive(Debug, Clone)]
pub struct PathPolicy {
    data_root: PathBuf,
    layout: StorageLayout,
}

impl PathPolicy {
    /// Create a policy rooted at `data_root`
    pub fn new(data_root: impl AsRef<Path>, layout: StorageLayout) -> Self {
        PathPolicy {
            data_root: data_root.as_ref().to_path_buf(),
            layout,
        }
    }

    /// The data root this policy maps beneath
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// Destination path for an event
    pub fn destination(&self, event: &MarketEvent, format: SinkFormat) -> PathBuf {
        self.destination_parts(
            &event.symbol,
            event.event_type(),
            &event.timestamp,
            &event.source,
            format,
        )
    }

    /// Destination path from the individual attributes
    pub fn destination_parts(
        &self,
        symbol: &Symbol,
        event_type: EventType,
        timestamp: &DateTime<Utc>,
        source: &str,
        format: SinkFormat,
    ) -> PathBuf {
        let dir = self.base_dir(symbol, event_type, timestamp, source);
        let stem = self.file_stem(source, self.layout.date_partition.stem(timestamp));
        dir.join(format!("{}{}", stem, format.extension()))
    }

    /// Destination for a columnar batch keyed by (symbol, type, date)
    ///
    /// The batch key is embedded in the filename so same-day batches of
    /// different types never collide regardless of convention.
    pub fn columnar_destination(
        &self,
        symbol: &Symbol,
        event_type: EventType,
        date: NaiveDate,
        source: &str,
    ) -> PathBuf {
        let ts = date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always a valid time")
            .and_utc();
        let dir = self.base_dir(symbol, event_type, &ts, source);
        let key = format!(
            "{}_{}_{}",
            symbol.path_component(),
            event_type.as_str(),
            date.format("%Y-%m-%d")
        );
        let stem = self.file_stem(source, key);
        dir.join(format!("{}{}", stem, SinkFormat::Parquet.extension()))
    }

    fn base_dir(
        &self,
        symbol: &Symbol,
        event_type: EventType,
        ts: &DateTime<Utc>,
        source: &str,
    ) -> PathBuf {
        let root = &self.data_root;
        let sym = symbol.path_component();
        match self.layout.naming_convention {
            NamingConvention::Flat => root.clone(),
            NamingConvention::BySymbol => root.join(sym),
            NamingConvention::ByDate => root
                .join(format!("{:04}", ts.year()))
                .join(format!("{:02}", ts.month()))
                .join(format!("{:02}", ts.day())),
            NamingConvention::ByType => root.join(event_type.as_str()),
            NamingConvention::BySource => root.join(sanitize_component(source)),
            NamingConvention::ByAssetClass => root.join(asset_class(symbol)).join(sym),
            NamingConvention::Hierarchical => root
                .join(sanitize_component(source))
                .join(sym)
                .join(event_type.as_str())
                .join(format!("{:04}", ts.year()))
                .join(format!("{:02}", ts.month()))
                .join(format!("{:02}", ts.day())),
            NamingConvention::Canonical => root
                .join(sym)
                .join(event_type.as_str())
                .join(format!("{:04}", ts.year()))
                .join(format!("{:02}", ts.month())),
        }
    }

    fn file_stem(&self, source: &str, base: String) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(3);
        if let Some(prefix) = &self.layout.file_prefix {
            if !prefix.is_empty() {
                parts.push(sanitize_component(prefix));
            }
        }
        if self.layout.include_provider {
            parts.push(sanitize_component(source));
        }
        parts.push(base);
        parts.join("-")
    }
}

/// Classify a symbol into a coarse asset class by lexical shape.
///
/// `/`-separated pairs are FX, `-`-suffixed identifiers are crypto or
/// dated futures, everything else defaults to equity.
fn asset_class(symbol: &Symbol) -> &'static str {
    let s = symbol.as_str();
    if s.contains('/') {
        "fx"
    } else if s.contains('-') {
        "crypto"
    } else {
        "equity"
    }
}

fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

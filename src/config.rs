//! Effective collector configuration
//!
//! Composes the per-subsystem configurations into the single shape the
//! collector consumes, with defaults matching the shipped behavior. All
//! configuration is explicit and passed at construction; there is no
//! process-wide state.
//!
//! # Environment overlay
//!
//! A fixed, enumerated set of `MDC_*` variables may override fields.
//! Unknown `MDC_*` variables are ignored — nothing is mapped by
//! reflection — and malformed values fail loudly at init.

use mdc_core::DataPaths;
use mdc_durability::{SyncMode, WalConfig, WalConfigError};
use mdc_engine::OrchestratorConfig;
use mdc_storage::{
    ColumnarSinkConfig, DatePartition, JsonlSinkConfig, NamingConvention, StorageLayout,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default shutdown budget for the final flush
pub const DEFAULT_SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

/// Configuration errors; the service does not start on any of these
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// WAL configuration rejected
    #[error("invalid WAL config: {0}")]
    InvalidWal(#[from] WalConfigError),

    /// An environment override held an unparseable value
    #[error("invalid value '{value}' for {variable}")]
    InvalidEnvValue {
        /// The variable name
        variable: &'static str,
        /// The rejected value
        value: String,
    },

    /// A threshold that must be positive was zero
    #[error("{field} must be at least 1")]
    ZeroThreshold {
        /// The offending field
        field: &'static str,
    },

    /// Neither sink is enabled
    #[error("at least one sink must be enabled")]
    NoSinkEnabled,
}

/// Effective configuration consumed by the collector
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Root directory for all collector state (default: `data`)
    pub data_root: PathBuf,
    /// gzip JSONL output (default: false)
    pub compress: bool,
    /// Storage layout and retention settings
    pub storage: StorageLayout,
    /// Write-ahead log settings
    pub wal: WalConfig,
    /// Orchestrator settings
    pub orchestrator: OrchestratorConfig,
    /// JSONL sink settings
    pub jsonl_sink: JsonlSinkConfig,
    /// Columnar sink settings
    pub columnar_sink: ColumnarSinkConfig,
    /// Budget for the final shutdown flush (default: 30 s)
    pub shutdown_budget: Duration,
}

impl CollectorConfig {
    /// Defaults rooted at the given directory
    pub fn new(data_root: impl AsRef<Path>) -> Self {
        let data_root = data_root.as_ref().to_path_buf();
        let wal_dir = DataPaths::from_root(&data_root).wal_dir();
        CollectorConfig {
            wal: WalConfig::new(wal_dir),
            data_root,
            compress: false,
            storage: StorageLayout::default(),
            orchestrator: OrchestratorConfig::default(),
            jsonl_sink: JsonlSinkConfig::default(),
            columnar_sink: ColumnarSinkConfig::default(),
            shutdown_budget: DEFAULT_SHUTDOWN_BUDGET,
        }
    }

    /// Move the whole tree under a new data root (builder pattern)
    pub fn with_data_root(mut self, data_root: impl AsRef<Path>) -> Self {
        self.data_root = data_root.as_ref().to_path_buf();
        self.wal.dir = DataPaths::from_root(&self.data_root).wal_dir();
        self
    }

    /// Directory paths derived from the data root
    pub fn paths(&self) -> DataPaths {
        DataPaths::from_root(&self.data_root)
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.wal.validate()?;
        if self.orchestrator.flush_threshold == 0 {
            return Err(ConfigError::ZeroThreshold {
                field: "orchestrator.flush_threshold",
            });
        }
        if self.columnar_sink.enabled && self.columnar_sink.buffer_size == 0 {
            return Err(ConfigError::ZeroThreshold {
                field: "columnar_sink.buffer_size",
            });
        }
        if !self.jsonl_sink.enabled && !self.columnar_sink.enabled {
            return Err(ConfigError::NoSinkEnabled);
        }
        Ok(())
    }

    /// Apply the enumerated `MDC_*` environment overrides.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `MDC_DATA_ROOT` | `data_root` (WAL dir follows) |
    /// | `MDC_COMPRESS` | `compress` |
    /// | `MDC_NAMING_CONVENTION` | `storage.naming_convention` |
    /// | `MDC_DATE_PARTITION` | `storage.date_partition` |
    /// | `MDC_FILE_PREFIX` | `storage.file_prefix` |
    /// | `MDC_RETENTION_DAYS` | `storage.retention_days` |
    /// | `MDC_MAX_TOTAL_MEGABYTES` | `storage.max_total_megabytes` |
    /// | `MDC_WAL_SYNC_MODE` | `wal.sync_mode` |
    /// | `MDC_WAL_MAX_SEGMENT_BYTES` | `wal.max_segment_bytes` |
    /// | `MDC_FLUSH_THRESHOLD` | `orchestrator.flush_threshold` |
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = env_var("MDC_DATA_ROOT") {
            self.data_root = PathBuf::from(&value);
            self.wal.dir = DataPaths::from_root(&self.data_root).wal_dir();
        }
        if let Some(value) = env_var("MDC_COMPRESS") {
            self.compress = parse_bool("MDC_COMPRESS", &value)?;
        }
        if let Some(value) = env_var("MDC_NAMING_CONVENTION") {
            self.storage.naming_convention = NamingConvention::from_tag(&value)
                .ok_or(ConfigError::InvalidEnvValue {
                    variable: "MDC_NAMING_CONVENTION",
                    value,
                })?;
        }
        if let Some(value) = env_var("MDC_DATE_PARTITION") {
            self.storage.date_partition =
                DatePartition::from_tag(&value).ok_or(ConfigError::InvalidEnvValue {
                    variable: "MDC_DATE_PARTITION",
                    value,
                })?;
        }
        if let Some(value) = env_var("MDC_FILE_PREFIX") {
            self.storage.file_prefix = Some(value);
        }
        if let Some(value) = env_var("MDC_RETENTION_DAYS") {
            self.storage.retention_days = Some(parse_num("MDC_RETENTION_DAYS", &value)?);
        }
        if let Some(value) = env_var("MDC_MAX_TOTAL_MEGABYTES") {
            self.storage.max_total_megabytes = Some(parse_num("MDC_MAX_TOTAL_MEGABYTES", &value)?);
        }
        if let Some(value) = env_var("MDC_WAL_SYNC_MODE") {
            self.wal.sync_mode =
                SyncMode::from_tag(&value).ok_or(ConfigError::InvalidEnvValue {
                    variable: "MDC_WAL_SYNC_MODE",
                    value,
                })?;
        }
        if let Some(value) = env_var("MDC_WAL_MAX_SEGMENT_BYTES") {
            self.wal.max_segment_bytes = parse_num("MDC_WAL_MAX_SEGMENT_BYTES", &value)?;
        }
        if let Some(value) = env_var("MDC_FLUSH_THRESHOLD") {
            self.orchestrator.flush_threshold = parse_num("MDC_FLUSH_THRESHOLD", &value)?;
        }
        Ok(())
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig::new("data")
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_bool(variable: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidEnvValue {
            variable,
            value: value.to_string(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(variable: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnvValue {
        variable,
        value: value.to_string(),
    })
}

//! Crash-safe market-data collection and archival pipeline
//!
//! Ingests live trade/quote/depth/bar events from brokerage feeds and
//! persists them to local disk with write-ahead durability: every event
//! is appended to a checksummed WAL segment before acknowledgement, then
//! batched into JSONL and/or parquet sink files, committed, and
//! eventually truncated out of the WAL.
//!
//! # Crates
//!
//! - `mdc-core`: event model and directory layout
//! - `mdc-storage`: atomic writes, path policy, sinks, retention
//! - `mdc-durability`: the write-ahead log
//! - `mdc-engine`: the archival orchestrator
//! - `mdc-archive`: portable packages and the replay reader
//!
//! # Example
//!
//! ```no_run
//! use marketdata_collector::{CollectorConfig, MarketDataCollector};
//! use marketdata_collector::event::{EventPayload, Aggressor, MarketEvent, Symbol};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let collector = MarketDataCollector::open(CollectorConfig::new("data"))?;
//! let event = MarketEvent::new(
//!     Symbol::parse("SPY")?,
//!     EventPayload::Trade {
//!         price: "450.12".parse()?,
//!         size: 100,
//!         aggressor: Aggressor::Buy,
//!         sequence_number: None,
//!         venue: None,
//!     },
//!     "my-feed",
//! );
//! collector.append(&event)?;
//! collector.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collector;
pub mod config;

pub use collector::{CollectorError, MarketDataCollector};
pub use config::{CollectorConfig, ConfigError, DEFAULT_SHUTDOWN_BUDGET};

/// Event model re-exports
pub mod event {
    pub use mdc_core::{
        Aggressor, EventPayload, EventType, MarketEvent, PriceLevel, Symbol, SymbolError,
    };
}

pub use mdc_archive::{
    ArchivePackager, PackageFilter, PackageManifest, PackagerConfig, ReplayOptions, ReplayReader,
};
pub use mdc_core::DataPaths;
pub use mdc_durability::{SyncMode, WalConfig, WriteAheadLog};
pub use mdc_engine::{ArchivalOrchestrator, OrchestratorConfig, PipelineStats};
pub use mdc_storage::{
    ColumnarCompression, ColumnarSinkConfig, DatePartition, JsonlSinkConfig, NamingConvention,
    StorageLayout,
};

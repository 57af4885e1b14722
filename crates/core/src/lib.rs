//! Core types for the market-data collector
//!
//! This crate defines the event model shared by every layer of the
//! persistence pipeline:
//!
//! - `MarketEvent`: the sole payload unit (trades, quotes, depth, bars)
//! - `Symbol`: validated instrument identifier
//! - `EventType` / `EventPayload`: the closed set of event variants
//! - `DataPaths`: the on-disk directory layout beneath the data root

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod event;
pub mod paths;

pub use event::{
    Aggressor, EventPayload, EventType, MarketEvent, PriceLevel, Symbol, SymbolError,
    MAX_SYMBOL_LEN,
};
pub use paths::{DataPaths, WAL_ARCHIVE_DIR_NAME, WAL_DIR_NAME};

//! Persistence engine for the market-data collector
//!
//! Hosts the archival orchestrator: the coordinator that ties the WAL to
//! the primary sinks, enforcing write-ahead durability with buffered
//! delivery, background flushing, and crash recovery.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod orchestrator;

pub use orchestrator::{
    ArchivalOrchestrator, OrchestratorConfig, PipelineError, PipelineResult, PipelineStats,
};

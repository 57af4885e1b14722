//! Collector front door
//!
//! Wires the configuration into a running pipeline: path policy, sinks,
//! WAL-backed orchestrator (with crash recovery), and the retention
//! sweeper. Producers call `append`; everything else runs on the
//! pipeline's own background threads.

use crate::config::{CollectorConfig, ConfigError};
use mdc_archive::{ArchivePackager, PackagerConfig, ReplayReader};
use mdc_core::MarketEvent;
use mdc_engine::{ArchivalOrchestrator, OrchestratorConfig, PipelineError, PipelineStats};
use mdc_storage::{
    ColumnarSink, EventSink, FanoutSink, JsonlSink, PathPolicy, RetentionConfig, RetentionManager,
};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Collector errors
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// Configuration rejected; the service does not start
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Pipeline failure
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Data directories could not be created
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running market-data collector
///
/// Construction validates the configuration, creates the directory tree,
/// recovers any uncommitted WAL records into the sinks, and starts the
/// background flush and retention threads.
pub struct MarketDataCollector {
    orchestrator: Arc<ArchivalOrchestrator>,
    retention: Option<Arc<RetentionManager>>,
    config: CollectorConfig,
}

impl MarketDataCollector {
    /// Open the collector with the given configuration
    pub fn open(config: CollectorConfig) -> Result<MarketDataCollector, CollectorError> {
        config.validate()?;
        let paths = config.paths();
        paths.create_directories()?;

        let policy = PathPolicy::new(&config.data_root, config.storage.clone());

        let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
        if config.jsonl_sink.enabled {
            sinks.push(Arc::new(JsonlSink::new(
                policy.clone(),
                config.jsonl_sink.clone(),
                config.compress,
            )));
        }
        if config.columnar_sink.enabled {
            sinks.push(Arc::new(ColumnarSink::new(
                policy.clone(),
                config.columnar_sink.clone(),
            )));
        }
        let sink: Arc<dyn EventSink> = if sinks.len() == 1 {
            sinks.pop().expect("one sink is present")
        } else {
            Arc::new(FanoutSink::new(sinks))
        };

        let orchestrator = Arc::new(ArchivalOrchestrator::open(
            config.wal.clone(),
            sink,
            config.orchestrator.clone(),
        )?);

        let retention_config = RetentionConfig::from_layout(&config.storage);
        let retention = if retention_config.is_disabled() {
            None
        } else {
            let manager = Arc::new(RetentionManager::new(
                &config.data_root,
                paths.wal_dir(),
                retention_config,
            ));
            manager.start();
            Some(manager)
        };

        info!(data_root = %config.data_root.display(), "collector started");
        Ok(MarketDataCollector {
            orchestrator,
            retention,
            config,
        })
    }

    /// Persist one event; returns its WAL sequence
    pub fn append(&self, event: &MarketEvent) -> Result<u64, CollectorError> {
        Ok(self.orchestrator.append(event)?)
    }

    /// Flush all buffers through to committed sink output
    pub fn flush(&self) -> Result<(), CollectorError> {
        Ok(self.orchestrator.flush()?)
    }

    /// Pipeline counter snapshot
    pub fn stats(&self) -> PipelineStats {
        self.orchestrator.stats()
    }

    /// The effective configuration
    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Orchestrator settings currently in force
    pub fn orchestrator_config(&self) -> &OrchestratorConfig {
        &self.config.orchestrator
    }

    /// A replay reader over this collector's committed output
    pub fn replay(&self) -> ReplayReader {
        ReplayReader::new(&self.config.data_root, self.config.paths().wal_dir())
    }

    /// A packager over this collector's committed output
    pub fn packager(&self, packager_config: PackagerConfig) -> ArchivePackager {
        ArchivePackager::new(
            &self.config.data_root,
            self.config.paths().wal_dir(),
            packager_config,
        )
    }

    /// Graceful shutdown under the configured budget.
    ///
    /// The final flush is pushed onto a worker so the budget can be
    /// enforced; on exceedance the WAL is left on disk and the next start
    /// re-delivers whatever the flush did not finish.
    pub fn shutdown(self) -> Result<(), CollectorError> {
        if let Some(retention) = &self.retention {
            retention.stop();
        }

        let started = Instant::now();
        let orchestrator = Arc::clone(&self.orchestrator);
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("mdc-shutdown".to_string())
            .spawn(move || {
                let _ = tx.send(orchestrator.shutdown());
            })
            .expect("failed to spawn shutdown thread");

        match rx.recv_timeout(self.config.shutdown_budget) {
            Ok(result) => {
                let _ = worker.join();
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "collector stopped");
                result?;
                Ok(())
            }
            Err(_) => {
                // The worker keeps flushing in the background; the WAL
                // stays on disk either way and recovery re-delivers on
                // the next start.
                warn!(
                    budget_secs = self.config.shutdown_budget.as_secs(),
                    "shutdown budget exceeded; some data may be lost"
                );
                Ok(())
            }
        }
    }
}

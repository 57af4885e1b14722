//! Archival orchestrator
//!
//! Front door for event persistence. Exposes the same append/flush/close
//! surface as a sink, but internally enforces write-ahead durability:
//! every event is WAL-appended before it is buffered, and a COMMIT marker
//! is only written once the primary sink has accepted and flushed the
//! whole batch.
//!
//! A single background thread wakes periodically and flushes when the
//! buffer has aged past the configured delay. Foreground flush failures
//! raise; background ones log and continue.

use mdc_core::MarketEvent;
use mdc_durability::{WalConfig, WalError, WriteAheadLog};
use mdc_storage::{EventSink, SinkError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Buffered events that trigger a synchronous flush (default: 1000)
    pub flush_threshold: usize,
    /// Maximum buffer age before a flush is forced (default: 5 s)
    pub max_flush_delay: Duration,
    /// Background thread wake interval (default: 1 s)
    pub background_flush_interval: Duration,
    /// Truncate the WAL after each successful commit (default: true)
    pub auto_truncate_wal: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            flush_threshold: 1000,
            max_flush_delay: Duration::from_secs(5),
            background_flush_interval: Duration::from_secs(1),
            auto_truncate_wal: true,
        }
    }
}

impl OrchestratorConfig {
    /// Configuration with tiny thresholds for tests
    pub fn for_testing() -> Self {
        OrchestratorConfig {
            flush_threshold: 4,
            max_flush_delay: Duration::from_millis(100),
            background_flush_interval: Duration::from_millis(20),
            auto_truncate_wal: true,
        }
    }

    /// Set the flush threshold (builder pattern)
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    /// Set the maximum flush delay (builder pattern)
    pub fn with_max_flush_delay(mut self, delay: Duration) -> Self {
        self.max_flush_delay = delay;
        self
    }

    /// Enable or disable automatic truncation (builder pattern)
    pub fn with_auto_truncate(mut self, auto: bool) -> Self {
        self.auto_truncate_wal = auto;
        self
    }
}

/// Pipeline errors surfaced to producers
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// WAL append/commit/truncate failure — the event is not persisted
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Primary sink failure — the batch stays pending, no COMMIT written
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Event could not be serialized
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Operation after shutdown
    #[error("orchestrator is closed")]
    Closed,
}

/// Result alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Counter snapshot for observability
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    /// Events accepted since open
    pub events_appended: u64,
    /// Events currently buffered, not yet committed
    pub pending_events: usize,
    /// Flushes performed since open
    pub flushes: u64,
    /// Highest committed WAL sequence
    pub last_committed_sequence: u64,
    /// Events re-enqueued from the WAL at startup
    pub recovered_events: u64,
}

struct PendingEvent {
    wal_sequence: u64,
    event: MarketEvent,
    received_at: Instant,
}

struct OrchestratorInner {
    wal: WriteAheadLog,
    sink: Arc<dyn EventSink>,
    config: OrchestratorConfig,
    buffer: Mutex<VecDeque<PendingEvent>>,
    pending_count: AtomicUsize,
    last_flush: Mutex<Instant>,
    /// Serializes the whole flush protocol
    flush_lock: Mutex<()>,
    last_committed: AtomicU64,
    events_appended: AtomicU64,
    flushes: AtomicU64,
    recovered_events: AtomicU64,
    closed: AtomicBool,
    shutdown: AtomicBool,
    flush_signal: (Mutex<bool>, Condvar),
}

impl OrchestratorInner {
    /// The flush protocol: drain, order, deliver, commit.
    ///
    /// On sink failure the drained batch is returned to the buffer so the
    /// next flush re-delivers it; the COMMIT is not written.
    fn flush(&self) -> PipelineResult<()> {
        let _guard = self.flush_lock.lock();

        let mut batch: Vec<PendingEvent> = {
            let mut buffer = self.buffer.lock();
            buffer.drain(..).collect()
        };
        if batch.is_empty() {
            *self.last_flush.lock() = Instant::now();
            return Ok(());
        }

        batch.sort_by_key(|p| p.wal_sequence);
        let max_seq = batch.last().map(|p| p.wal_sequence).unwrap_or(0);

        let delivery = (|| -> Result<(), SinkError> {
            for pending in &batch {
                self.sink.append(&pending.event)?;
            }
            self.sink.flush()
        })();

        if let Err(e) = delivery {
            // Return the batch for re-delivery, ahead of anything that
            // arrived while we were flushing.
            let mut buffer = self.buffer.lock();
            for pending in batch.into_iter().rev() {
                buffer.push_front(pending);
            }
            return Err(e.into());
        }

        let count = batch.len();
        let oldest_ms = batch
            .first()
            .map(|p| p.received_at.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.wal.commit(max_seq)?;
        self.last_committed.store(max_seq, Ordering::Release);
        self.pending_count.fetch_sub(count, Ordering::AcqRel);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        *self.last_flush.lock() = Instant::now();
        debug!(count, through_sequence = max_seq, oldest_ms, "pipeline flush committed");

        if self.config.auto_truncate_wal {
            self.wal.truncate(max_seq)?;
        }
        Ok(())
    }

    fn flush_due(&self) -> bool {
        self.pending_count.load(Ordering::Acquire) > 0
            && self.last_flush.lock().elapsed() >= self.config.max_flush_delay
    }
}

/// Coordinates WAL and primary sink with background flushing and recovery
pub struct ArchivalOrchestrator {
    inner: Arc<OrchestratorInner>,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ArchivalOrchestrator {
    /// Open the pipeline: WAL init, crash recovery, background thread.
    ///
    /// Events found past the final COMMIT are re-enqueued with their
    /// original sequences and flushed synchronously before any new append
    /// is accepted.
    pub fn open(
        wal_config: WalConfig,
        sink: Arc<dyn EventSink>,
        config: OrchestratorConfig,
    ) -> PipelineResult<ArchivalOrchestrator> {
        let wal = WriteAheadLog::open(wal_config)?;

        let mut recovered = VecDeque::new();
        for recovered_event in wal.uncommitted_events()? {
            recovered.push_back(PendingEvent {
                wal_sequence: recovered_event.wal_sequence,
                event: recovered_event.event,
                received_at: Instant::now(),
            });
        }
        let recovered_count = recovered.len();

        let inner = Arc::new(OrchestratorInner {
            wal,
            sink,
            config,
            pending_count: AtomicUsize::new(recovered_count),
            buffer: Mutex::new(recovered),
            last_flush: Mutex::new(Instant::now()),
            flush_lock: Mutex::new(()),
            last_committed: AtomicU64::new(0),
            events_appended: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            recovered_events: AtomicU64::new(recovered_count as u64),
            closed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            flush_signal: (Mutex::new(false), Condvar::new()),
        });

        if recovered_count > 0 {
            info!(recovered_count, "recovering uncommitted events into sink");
            inner.flush()?;
        }

        let thread_inner = Arc::clone(&inner);
        let interval = thread_inner.config.background_flush_interval;
        let handle = thread::Builder::new()
            .name("mdc-flush".to_string())
            .spawn(move || loop {
                {
                    let (lock, cvar) = &thread_inner.flush_signal;
                    let mut signaled = lock.lock();
                    if !*signaled {
                        cvar.wait_for(&mut signaled, interval);
                    }
                    *signaled = false;
                }
                if thread_inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                if thread_inner.flush_due() {
                    if let Err(e) = thread_inner.flush() {
                        warn!(error = %e, "background flush failed");
                    }
                }
            })
            .expect("failed to spawn flush thread");

        Ok(ArchivalOrchestrator {
            inner,
            flush_thread: Mutex::new(Some(handle)),
        })
    }

    /// Persist one event.
    ///
    /// The event is WAL-appended (durable per sync mode) before this
    /// returns; the assigned WAL sequence is the return value. Crossing
    /// the flush threshold or the age limit triggers a synchronous flush,
    /// whose failure surfaces here.
    pub fn append(&self, event: &MarketEvent) -> PipelineResult<u64> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }

        let payload = event.to_json_line()?;
        let record = self.inner.wal.append_event(&payload)?;

        // The counter moves with the buffer, under its lock: a concurrent
        // flush that drains this event must already see it counted.
        let pending = {
            let mut buffer = self.inner.buffer.lock();
            buffer.push_back(PendingEvent {
                wal_sequence: record.sequence,
                event: event.clone(),
                received_at: Instant::now(),
            });
            self.inner.pending_count.fetch_add(1, Ordering::AcqRel) + 1
        };
        self.inner.events_appended.fetch_add(1, Ordering::Relaxed);

        if pending >= self.inner.config.flush_threshold
            || self.inner.last_flush.lock().elapsed() >= self.inner.config.max_flush_delay
        {
            self.inner.flush()?;
        }
        Ok(record.sequence)
    }

    /// Flush everything buffered and commit the WAL
    pub fn flush(&self) -> PipelineResult<()> {
        self.inner.flush()
    }

    /// Events buffered but not yet committed
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Acquire)
    }

    /// Counter snapshot
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            events_appended: self.inner.events_appended.load(Ordering::Relaxed),
            pending_events: self.inner.pending_count.load(Ordering::Acquire),
            flushes: self.inner.flushes.load(Ordering::Relaxed),
            last_committed_sequence: self.inner.last_committed.load(Ordering::Acquire),
            recovered_events: self.inner.recovered_events.load(Ordering::Relaxed),
        }
    }

    /// The WAL backing this pipeline
    pub fn wal(&self) -> &WriteAheadLog {
        &self.inner.wal
    }

    /// Graceful shutdown: stop the background thread, final flush, close
    /// WAL and sink.
    ///
    /// The final flush runs after the thread is joined, so nothing can
    /// interrupt it; an event accepted by `append` is either committed
    /// here or left replayable in the WAL.
    pub fn shutdown(&self) -> PipelineResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_flush_thread();

        let flush_result = self.inner.flush();
        self.inner.wal.close()?;
        self.inner.sink.close()?;
        info!("pipeline shut down");
        flush_result
    }

    fn stop_flush_thread(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let (lock, cvar) = &self.inner.flush_signal;
            let mut signaled = lock.lock();
            *signaled = true;
            cvar.notify_one();
        }
        if let Some(handle) = self.flush_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ArchivalOrchestrator {
    fn drop(&mut self) {
        // The thread must not outlive the orchestrator; an explicit
        // shutdown() is still required for the final flush guarantee.
        self.stop_flush_thread();
    }
}

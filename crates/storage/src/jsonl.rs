//! Line-delimited JSON sink
//!
//! Maintains one append writer per destination path. Events are buffered
//! per destination and drained in batches; a periodic timer thread drains
//! whatever the batch threshold has not. Writers are serialized by a
//! per-destination mutex, so different destinations proceed in parallel.
//!
//! Compressed output is a single gzip stream per file. A stream is never
//! reopened for append — that would concatenate gzip members — so an
//! existing `.gz` destination gets a fresh part-numbered sibling instead.

use crate::path_policy::{PathPolicy, SinkFormat};
use crate::sink::{EventSink, SinkError, SinkResult};
use dashmap::DashMap;
use flate2::write::GzEncoder;
use flate2::Compression;
use mdc_core::MarketEvent;
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::warn;

/// JSONL sink configuration
#[derive(Debug, Clone)]
pub struct JsonlSinkConfig {
    /// Whether the sink participates in the pipeline
    pub enabled: bool,
    /// Events buffered per destination before a drain (<= 1 disables batching)
    pub batch_size: usize,
    /// Periodic drain interval
    pub flush_interval: Duration,
    /// Batches larger than this are JSON-encoded on the rayon pool
    pub parallel_serialization_threshold: usize,
}

impl Default for JsonlSinkConfig {
    fn default() -> Self {
        JsonlSinkConfig {
            enabled: true,
            batch_size: 1000,
            flush_interval: Duration::from_secs(5),
            parallel_serialization_threshold: 100,
        }
    }
}

impl JsonlSinkConfig {
    /// Configuration with tiny thresholds for tests
    pub fn for_testing() -> Self {
        JsonlSinkConfig {
            enabled: true,
            batch_size: 4,
            flush_interval: Duration::from_millis(50),
            parallel_serialization_threshold: 8,
        }
    }
}

/// One open output file, plain or gzip
enum DestWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl DestWriter {
    fn open(path: &Path, compress: bool) -> io::Result<DestWriter> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if compress {
            // Never append to an existing gzip stream
            let path = next_free_gz_path(path);
            let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
            Ok(DestWriter::Gzip(GzEncoder::new(
                BufWriter::new(file),
                Compression::fast(),
            )))
        } else {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok(DestWriter::Plain(BufWriter::new(file)))
        }
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self {
            DestWriter::Plain(w) => {
                w.write_all(line.as_bytes())?;
                w.write_all(b"\n")
            }
            DestWriter::Gzip(w) => {
                w.write_all(line.as_bytes())?;
                w.write_all(b"\n")
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            DestWriter::Plain(w) => w.flush(),
            DestWriter::Gzip(w) => w.flush(),
        }
    }

    fn sync(&mut self) -> io::Result<()> {
        match self {
            DestWriter::Plain(w) => {
                w.flush()?;
                w.get_ref().sync_all()
            }
            DestWriter::Gzip(w) => {
                w.flush()?;
                w.get_ref().get_ref().sync_all()
            }
        }
    }

    fn finish(self) -> io::Result<()> {
        match self {
            DestWriter::Plain(mut w) => {
                w.flush()?;
                w.get_ref().sync_all()
            }
            DestWriter::Gzip(w) => {
                let mut inner = w.finish()?;
                inner.flush()?;
                inner.get_ref().sync_all()
            }
        }
    }
}

/// Pick `<stem>-<n>.jsonl.gz` when the destination already exists
fn next_free_gz_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let stem = name.strip_suffix(".jsonl.gz").unwrap_or(&name);
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    for n in 1u32.. {
        let candidate = parent.join(format!("{}-{}.jsonl.gz", stem, n));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("u32 part numbers exhausted");
}

/// Per-destination state: event buffer + owned writer
struct Destination {
    /// Serializes drains so lines land in delivery order
    drain_lock: Mutex<()>,
    buffer: Mutex<Vec<MarketEvent>>,
    writer: Mutex<Option<DestWriter>>,
}

impl Destination {
    fn new() -> Self {
        Destination {
            drain_lock: Mutex::new(()),
            buffer: Mutex::new(Vec::new()),
            writer: Mutex::new(None),
        }
    }
}

struct JsonlInner {
    policy: PathPolicy,
    config: JsonlSinkConfig,
    compress: bool,
    destinations: DashMap<PathBuf, Arc<Destination>>,
    closed: AtomicBool,
    shutdown: AtomicBool,
    drain_signal: (Mutex<bool>, Condvar),
}

impl JsonlInner {
    fn serialize_batch(&self, events: &[MarketEvent]) -> SinkResult<Vec<String>> {
        if events.len() > self.config.parallel_serialization_threshold {
            let lines: Result<Vec<String>, serde_json::Error> =
                events.par_iter().map(|e| e.to_json_line()).collect();
            Ok(lines?)
        } else {
            let lines: Result<Vec<String>, serde_json::Error> =
                events.iter().map(|e| e.to_json_line()).collect();
            Ok(lines?)
        }
    }

    /// Drain one destination's buffer into its writer
    fn drain_destination(&self, path: &Path, dest: &Destination) -> SinkResult<()> {
        let _guard = dest.drain_lock.lock();

        let batch: Vec<MarketEvent> = {
            let mut buffer = dest.buffer.lock();
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };

        // Encode before taking the writer lock
        let lines = self.serialize_batch(&batch)?;

        let mut writer = dest.writer.lock();
        if writer.is_none() {
            *writer = Some(DestWriter::open(path, self.compress)?);
        }
        let w = writer.as_mut().expect("writer was just installed");
        for line in &lines {
            w.write_line(line)?;
        }
        w.flush()?;
        Ok(())
    }

    /// Drain every destination, then fsync every open writer
    fn flush_all(&self) -> SinkResult<()> {
        let paths: Vec<(PathBuf, Arc<Destination>)> = self
            .destinations
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (path, dest) in &paths {
            self.drain_destination(path, dest)?;
        }
        for (_, dest) in &paths {
            if let Some(w) = dest.writer.lock().as_mut() {
                w.sync()?;
            }
        }
        Ok(())
    }

    /// Periodic non-blocking drain; errors are logged, never raised
    fn drain_tick(&self) {
        let paths: Vec<(PathBuf, Arc<Destination>)> = self
            .destinations
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (path, dest) in paths {
            if let Err(e) = self.drain_destination(&path, &dest) {
                warn!(path = %path.display(), error = %e, "periodic jsonl drain failed");
            }
        }
    }
}

/// Append-only line-delimited JSON sink
///
/// # Concurrency
///
/// Per-destination writers are serialized by a per-destination mutex;
/// multiple destinations proceed in parallel. A single timer thread drains
/// all buffers every `flush_interval`.
pub struct JsonlSink {
    inner: Arc<JsonlInner>,
    drain_thread: Mutex<Option<JoinHandle<()>>>,
}

impl JsonlSink {
    /// Create the sink and start its periodic drain thread
    pub fn new(policy: PathPolicy, config: JsonlSinkConfig, compress: bool) -> Self {
        let inner = Arc::new(JsonlInner {
            policy,
            config,
            compress,
            destinations: DashMap::new(),
            closed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            drain_signal: (Mutex::new(false), Condvar::new()),
        });

        let thread_inner = Arc::clone(&inner);
        let interval = thread_inner.config.flush_interval;
        let handle = thread::Builder::new()
            .name("mdc-jsonl-drain".to_string())
            .spawn(move || loop {
                {
                    let (lock, cvar) = &thread_inner.drain_signal;
                    let mut signaled = lock.lock();
                    if !*signaled {
                        cvar.wait_for(&mut signaled, interval);
                    }
                    *signaled = false;
                }
                if thread_inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                thread_inner.drain_tick();
            })
            .expect("failed to spawn jsonl drain thread");

        JsonlSink {
            inner,
            drain_thread: Mutex::new(Some(handle)),
        }
    }

    /// The output format this sink produces
    pub fn format(&self) -> SinkFormat {
        if self.inner.compress {
            SinkFormat::JsonlGz
        } else {
            SinkFormat::Jsonl
        }
    }

    /// Number of destinations with an open writer or pending buffer
    pub fn destination_count(&self) -> usize {
        self.inner.destinations.len()
    }

    fn stop_drain_thread(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let (lock, cvar) = &self.inner.drain_signal;
            let mut signaled = lock.lock();
            *signaled = true;
            cvar.notify_one();
        }
        if let Some(handle) = self.drain_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl EventSink for JsonlSink {
    fn append(&self, event: &MarketEvent) -> SinkResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }

        let path = self.inner.policy.destination(event, self.format());
        let dest = self
            .inner
            .destinations
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Destination::new()))
            .clone();

        if self.inner.config.batch_size <= 1 {
            // NoBatching: one line per append under the writer lock
            let line = event.to_json_line()?;
            let mut writer = dest.writer.lock();
            if writer.is_none() {
                *writer = Some(DestWriter::open(&path, self.inner.compress)?);
            }
            let w = writer.as_mut().expect("writer was just installed");
            w.write_line(&line)?;
            w.flush()?;
            return Ok(());
        }

        let should_drain = {
            let mut buffer = dest.buffer.lock();
            buffer.push(event.clone());
            buffer.len() >= self.inner.config.batch_size
        };

        if should_drain {
            self.inner.drain_destination(&path, &dest)?;
        }
        Ok(())
    }

    fn flush(&self) -> SinkResult<()> {
        self.inner.flush_all()
    }

    fn close(&self) -> SinkResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_drain_thread();
        self.inner.flush_all()?;

        // Ownership of each writer moves into finish(); the map is cleared
        // only after every writer has been closed.
        let mut first_err: Option<SinkError> = None;
        for entry in self.inner.destinations.iter() {
            if let Some(w) = entry.value().writer.lock().take() {
                if let Err(e) = w.finish() {
                    warn!(path = %entry.key().display(), error = %e, "closing jsonl writer failed");
                    first_err.get_or_insert(SinkError::Io(e));
                }
            }
        }
        self.inner.destinations.clear();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        self.stop_drain_thread();
    }
}

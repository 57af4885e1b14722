//! Columnar batch sink
//!
//! Groups events of the same (symbol, type, date) into a typed batch and
//! emits each batch as one parquet file. Every event type publishes a
//! fixed, positional arrow schema; each column is built as a typed array
//! of batch length in a single pass over the events.
//!
//! A global flush mutex prevents the periodic timer and synchronous
//! flushes from interleaving flush cascades.

use crate::path_policy::PathPolicy;
use crate::sink::{EventSink, SinkError, SinkResult};
use arrow::array::{
    ArrayRef, StringBuilder, TimestampMillisecondBuilder, UInt32Builder, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use dashmap::DashMap;
use mdc_core::{EventPayload, EventType, MarketEvent, Symbol};
use parking_lot::{Condvar, Mutex};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel};
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, warn};

/// Parquet page compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ColumnarCompression {
    /// No compression
    None,
    /// Snappy (the default)
    #[default]
    Snappy,
    /// Gzip
    Gzip,
}

impl ColumnarCompression {
    fn to_parquet(self) -> Compression {
        match self {
            ColumnarCompression::None => Compression::UNCOMPRESSED,
            ColumnarCompression::Snappy => Compression::SNAPPY,
            ColumnarCompression::Gzip => Compression::GZIP(GzipLevel::default()),
        }
    }
}

/// Columnar sink configuration
#[derive(Debug, Clone)]
pub struct ColumnarSinkConfig {
    /// Whether the sink participates in the pipeline
    pub enabled: bool,
    /// Events buffered per key before the batch is written
    pub buffer_size: usize,
    /// Periodic flush interval
    pub flush_interval: Duration,
    /// Parquet compression
    pub compression: ColumnarCompression,
}

impl Default for ColumnarSinkConfig {
    fn default() -> Self {
        ColumnarSinkConfig {
            enabled: false,
            buffer_size: 10_000,
            flush_interval: Duration::from_secs(30),
            compression: ColumnarCompression::Snappy,
        }
    }
}

impl ColumnarSinkConfig {
    /// Configuration with tiny thresholds for tests
    pub fn for_testing() -> Self {
        ColumnarSinkConfig {
            enabled: true,
            buffer_size: 8,
            flush_interval: Duration::from_millis(50),
            compression: ColumnarCompression::Snappy,
        }
    }
}

/// One buffered batch: all events share (symbol, type, date)
struct BatchBuffer {
    symbol: Symbol,
    event_type: EventType,
    date: NaiveDate,
    source: String,
    events: Vec<MarketEvent>,
}

struct ColumnarInner {
    policy: PathPolicy,
    config: ColumnarSinkConfig,
    buffers: DashMap<String, BatchBuffer>,
    /// Prevents concurrent flush cascades
    flush_lock: Mutex<()>,
    closed: AtomicBool,
    shutdown: AtomicBool,
    flush_signal: (Mutex<bool>, Condvar),
}

impl ColumnarInner {
    fn batch_key(event: &MarketEvent) -> String {
        format!(
            "{}_{}_{}",
            event.symbol.path_component(),
            event.event_type().as_str(),
            event.timestamp.date_naive().format("%Y-%m-%d")
        )
    }

    /// Write one batch out as a parquet file
    fn write_batch(&self, batch: BatchBuffer) -> SinkResult<()> {
        let record_batch = build_record_batch(batch.event_type, &batch.events)?;

        let path = next_free_path(&self.policy.columnar_destination(
            &batch.symbol,
            batch.event_type,
            batch.date,
            &batch.source,
        ));
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let props = WriterProperties::builder()
            .set_compression(self.config.compression.to_parquet())
            .build();
        let file = File::create(&path)?;
        let mut writer = ArrowWriter::try_new(file, record_batch.schema(), Some(props))?;
        writer.write(&record_batch)?;
        let file = writer.into_inner()?;
        file.sync_all()?;
        Ok(())
    }

    /// Flush one key's buffer under the global flush mutex
    fn flush_key(&self, key: &str) -> SinkResult<()> {
        let _guard = self.flush_lock.lock();
        self.flush_key_locked(key)
    }

    fn flush_key_locked(&self, key: &str) -> SinkResult<()> {
        let batch = match self.buffers.remove(key) {
            Some((_, batch)) if !batch.events.is_empty() => batch,
            _ => return Ok(()),
        };

        if let Err(e) = self.write_batch(batch) {
            error!(key, error = %e, "columnar batch flush failed");
            return Err(e);
        }
        Ok(())
    }

    /// Flush every non-empty key under the global flush mutex
    fn flush_all(&self) -> SinkResult<()> {
        let _guard = self.flush_lock.lock();
        let keys: Vec<String> = self.buffers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.flush_key_locked(&key)?;
        }
        Ok(())
    }
}

/// Pick `<stem>-<n>.parquet` when the destination already exists
fn next_free_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let stem = name.strip_suffix(".parquet").unwrap_or(&name);
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    for n in 1u32.. {
        let candidate = parent.join(format!("{}-{}.parquet", stem, n));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("u32 part numbers exhausted");
}

/// Columnar batch sink
pub struct ColumnarSink {
    inner: Arc<ColumnarInner>,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ColumnarSink {
    /// Create the sink and start its periodic flush thread
    pub fn new(policy: PathPolicy, config: ColumnarSinkConfig) -> Self {
        let inner = Arc::new(ColumnarInner {
            policy,
            config,
            buffers: DashMap::new(),
            flush_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            flush_signal: (Mutex::new(false), Condvar::new()),
        });

        let thread_inner = Arc::clone(&inner);
        let interval = thread_inner.config.flush_interval;
        let handle = thread::Builder::new()
            .name("mdc-columnar-flush".to_string())
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
                if let Err(e) = thread_inner.flush_all() {
                    warn!(error = %e, "periodic columnar flush failed");
                }
            })
            .expect("failed to spawn columnar flush thread");

        ColumnarSink {
            inner,
            flush_thread: Mutex::new(Some(handle)),
        }
    }

    /// Number of keys currently buffered
    pub fn buffered_keys(&self) -> usize {
        self.inner.buffers.len()
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

impl EventSink for ColumnarSink {
    fn append(&self, event: &MarketEvent) -> SinkResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }

        let key = ColumnarInner::batch_key(event);
        let should_flush = {
            let mut entry = self
                .inner
                .buffers
                .entry(key.clone())
                .or_insert_with(|| BatchBuffer {
                    symbol: event.symbol.clone(),
                    event_type: event.event_type(),
                    date: event.timestamp.date_naive(),
                    source: event.source.clone(),
                    events: Vec::new(),
                });
            entry.events.push(event.clone());
            entry.events.len() >= self.inner.config.buffer_size
        };

        if should_flush {
            self.inner.flush_key(&key)?;
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
        // Timer is stopped first so the final flush owns the mutex alone
        self.stop_flush_thread();
        self.inner.flush_all()
    }

    fn name(&self) -> &'static str {
        "columnar"
    }
}

impl Drop for ColumnarSink {
    fn drop(&mut self) {
        self.stop_flush_thread();
    }
}

// ============================================================================
// Arrow schemas and one-pass batch construction
// ============================================================================

fn ts_field() -> Field {
    Field::new(
        "timestamp",
        DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
        false,
    )
}

fn trade_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ts_field(),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("price", DataType::Utf8, false),
        Field::new("size", DataType::UInt64, false),
        Field::new("aggressor", DataType::Utf8, false),
        Field::new("sequence", DataType::UInt64, true),
        Field::new("venue", DataType::Utf8, true),
        Field::new("source", DataType::Utf8, false),
    ]))
}

fn bbo_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ts_field(),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("bid_price", DataType::Utf8, false),
        Field::new("bid_size", DataType::UInt64, false),
        Field::new("ask_price", DataType::Utf8, false),
        Field::new("ask_size", DataType::UInt64, false),
        Field::new("spread", DataType::Utf8, false),
        Field::new("sequence", DataType::UInt64, true),
        Field::new("source", DataType::Utf8, false),
    ]))
}

fn bar_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ts_field(),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("open", DataType::Utf8, false),
        Field::new("high", DataType::Utf8, false),
        Field::new("low", DataType::Utf8, false),
        Field::new("close", DataType::Utf8, false),
        Field::new("volume", DataType::UInt64, false),
        Field::new("sequence", DataType::UInt64, true),
        Field::new("source", DataType::Utf8, false),
    ]))
}

fn book_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ts_field(),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("bids", DataType::Utf8, false),
        Field::new("asks", DataType::Utf8, false),
        Field::new("bid_levels", DataType::UInt32, false),
        Field::new("ask_levels", DataType::UInt32, false),
        Field::new("best_bid", DataType::Utf8, true),
        Field::new("best_ask", DataType::Utf8, true),
        Field::new("spread", DataType::Utf8, true),
        Field::new("sequence", DataType::UInt64, true),
        Field::new("source", DataType::Utf8, false),
    ]))
}

fn other_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ts_field(),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("event_type", DataType::Utf8, false),
        Field::new("payload", DataType::Utf8, false),
        Field::new("sequence", DataType::UInt64, true),
        Field::new("source", DataType::Utf8, false),
    ]))
}

/// Build the typed record batch for one buffered key.
///
/// Each column is appended in the same single pass over `events`.
fn build_record_batch(event_type: EventType, events: &[MarketEvent]) -> SinkResult<RecordBatch> {
    match event_type {
        EventType::Trade => build_trade_batch(events),
        EventType::BboQuote => build_bbo_batch(events),
        EventType::HistoricalBar => build_bar_batch(events),
        EventType::Depth | EventType::L2Snapshot => build_book_batch(events),
        EventType::Other => build_other_batch(events),
    }
}

fn finish_timestamps(mut builder: TimestampMillisecondBuilder) -> ArrayRef {
    Arc::new(builder.finish().with_timezone("UTC"))
}

fn build_trade_batch(events: &[MarketEvent]) -> SinkResult<RecordBatch> {
    let n = events.len();
    let mut ts = TimestampMillisecondBuilder::with_capacity(n);
    let mut symbol = StringBuilder::new();
    let mut price = StringBuilder::new();
    let mut size = UInt64Builder::with_capacity(n);
    let mut aggressor = StringBuilder::new();
    let mut sequence = UInt64Builder::with_capacity(n);
    let mut venue = StringBuilder::new();
    let mut source = StringBuilder::new();

    for event in events {
        if let EventPayload::Trade {
            price: p,
            size: s,
            aggressor: a,
            sequence_number,
            venue: v,
        } = &event.payload
        {
            ts.append_value(event.timestamp.timestamp_millis());
            symbol.append_value(event.symbol.as_str());
            price.append_value(p.to_string());
            size.append_value(*s);
            aggressor.append_value(a.as_str());
            sequence.append_option(sequence_number.or(event.sequence));
            venue.append_option(v.as_deref());
            source.append_value(&event.source);
        }
    }

    let batch = RecordBatch::try_new(
        trade_schema(),
        vec![
            finish_timestamps(ts),
            Arc::new(symbol.finish()),
            Arc::new(price.finish()),
            Arc::new(size.finish()),
            Arc::new(aggressor.finish()),
            Arc::new(sequence.finish()),
            Arc::new(venue.finish()),
            Arc::new(source.finish()),
        ],
    )?;
    Ok(batch)
}

fn build_bbo_batch(events: &[MarketEvent]) -> SinkResult<RecordBatch> {
    let n = events.len();
    let mut ts = TimestampMillisecondBuilder::with_capacity(n);
    let mut symbol = StringBuilder::new();
    let mut bid_price = StringBuilder::new();
    let mut bid_size = UInt64Builder::with_capacity(n);
    let mut ask_price = StringBuilder::new();
    let mut ask_size = UInt64Builder::with_capacity(n);
    let mut spread = StringBuilder::new();
    let mut sequence = UInt64Builder::with_capacity(n);
    let mut source = StringBuilder::new();

    for event in events {
        if let EventPayload::BboQuote {
            bid_price: bp,
            bid_size: bs,
            ask_price: ap,
            ask_size: asz,
        } = &event.payload
        {
            ts.append_value(event.timestamp.timestamp_millis());
            symbol.append_value(event.symbol.as_str());
            bid_price.append_value(bp.to_string());
            bid_size.append_value(*bs);
            ask_price.append_value(ap.to_string());
            ask_size.append_value(*asz);
            spread.append_value((ap - bp).to_string());
            sequence.append_option(event.sequence);
            source.append_value(&event.source);
        }
    }

    let batch = RecordBatch::try_new(
        bbo_schema(),
        vec![
            finish_timestamps(ts),
            Arc::new(symbol.finish()),
            Arc::new(bid_price.finish()),
            Arc::new(bid_size.finish()),
            Arc::new(ask_price.finish()),
            Arc::new(ask_size.finish()),
            Arc::new(spread.finish()),
            Arc::new(sequence.finish()),
            Arc::new(source.finish()),
        ],
    )?;
    Ok(batch)
}

fn build_bar_batch(events: &[MarketEvent]) -> SinkResult<RecordBatch> {
    let n = events.len();
    let mut ts = TimestampMillisecondBuilder::with_capacity(n);
    let mut symbol = StringBuilder::new();
    let mut open = StringBuilder::new();
    let mut high = StringBuilder::new();
    let mut low = StringBuilder::new();
    let mut close = StringBuilder::new();
    let mut volume = UInt64Builder::with_capacity(n);
    let mut sequence = UInt64Builder::with_capacity(n);
    let mut source = StringBuilder::new();

    for event in events {
        if let EventPayload::HistoricalBar {
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
        } = &event.payload
        {
            ts.append_value(event.timestamp.timestamp_millis());
            symbol.append_value(event.symbol.as_str());
            open.append_value(o.to_string());
            high.append_value(h.to_string());
            low.append_value(l.to_string());
            close.append_value(c.to_string());
            volume.append_value(*v);
            sequence.append_option(event.sequence);
            source.append_value(&event.source);
        }
    }

    let batch = RecordBatch::try_new(
        bar_schema(),
        vec![
            finish_timestamps(ts),
            Arc::new(symbol.finish()),
            Arc::new(open.finish()),
            Arc::new(high.finish()),
            Arc::new(low.finish()),
            Arc::new(close.finish()),
            Arc::new(volume.finish()),
            Arc::new(sequence.finish()),
            Arc::new(source.finish()),
        ],
    )?;
    Ok(batch)
}

fn build_book_batch(events: &[MarketEvent]) -> SinkResult<RecordBatch> {
    let n = events.len();
    let mut ts = TimestampMillisecondBuilder::with_capacity(n);
    let mut symbol = StringBuilder::new();
    let mut bids_col = StringBuilder::new();
    let mut asks_col = StringBuilder::new();
    let mut bid_levels = UInt32Builder::with_capacity(n);
    let mut ask_levels = UInt32Builder::with_capacity(n);
    let mut best_bid = StringBuilder::new();
    let mut best_ask = StringBuilder::new();
    let mut spread = StringBuilder::new();
    let mut sequence = UInt64Builder::with_capacity(n);
    let mut source = StringBuilder::new();

    for event in events {
        let (bids, asks) = match &event.payload {
            EventPayload::Depth { bids, asks } => (bids, asks),
            EventPayload::L2Snapshot { bids, asks } => (bids, asks),
            _ => continue,
        };

        ts.append_value(event.timestamp.timestamp_millis());
        symbol.append_value(event.symbol.as_str());
        bids_col.append_value(serde_json::to_string(bids)?);
        asks_col.append_value(serde_json::to_string(asks)?);
        bid_levels.append_value(bids.len() as u32);
        ask_levels.append_value(asks.len() as u32);
        best_bid.append_option(bids.first().map(|l| l.price.to_string()));
        best_ask.append_option(asks.first().map(|l| l.price.to_string()));
        spread.append_option(match (bids.first(), asks.first()) {
            (Some(b), Some(a)) => Some((a.price - b.price).to_string()),
            _ => None,
        });
        sequence.append_option(event.sequence);
        source.append_value(&event.source);
    }

    let batch = RecordBatch::try_new(
        book_schema(),
        vec![
            finish_timestamps(ts),
            Arc::new(symbol.finish()),
            Arc::new(bids_col.finish()),
            Arc::new(asks_col.finish()),
            Arc::new(bid_levels.finish()),
            Arc::new(ask_levels.finish()),
            Arc::new(best_bid.finish()),
            Arc::new(best_ask.finish()),
            Arc::new(spread.finish()),
            Arc::new(sequence.finish()),
            Arc::new(source.finish()),
        ],
    )?;
    Ok(batch)
}

fn build_other_batch(events: &[MarketEvent]) -> SinkResult<RecordBatch> {
    let n = events.len();
    let mut ts = TimestampMillisecondBuilder::with_capacity(n);
    let mut symbol = StringBuilder::new();
    let mut event_type = StringBuilder::new();
    let mut payload = StringBuilder::new();
    let mut sequence = UInt64Builder::with_capacity(n);
    let mut source = StringBuilder::new();

    for event in events {
        if let EventPayload::Other { data } = &event.payload {
            ts.append_value(event.timestamp.timestamp_millis());
            symbol.append_value(event.symbol.as_str());
            event_type.append_value(event.event_type().as_str());
            payload.append_value(serde_json::to_string(data)?);
            sequence.append_option(event.sequence);
            source.append_value(&event.source);
        }
    }

    let batch = RecordBatch::try_new(
        other_schema(),
        vec![
            finish_timestamps(ts),
            Arc::new(symbol.finish()),
            Arc::new(event_type.finish()),
            Arc::new(payload.finish()),
            Arc::new(sequence.finish()),
            Arc::new(source.finish()),
        ],
    )?;
    Ok(batch)
}

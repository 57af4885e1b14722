//! Primary sink abstraction
//!
//! A sink is the system of record after commit: events handed to a sink and
//! flushed are considered durably archived, which is what allows the WAL to
//! emit a COMMIT marker and eventually truncate.

use mdc_core::MarketEvent;
use std::sync::Arc;

/// Sink errors
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Underlying I/O failure
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failure
    #[error("sink serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Arrow batch construction failure
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet write failure
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Operation on a sink that has been closed
    #[error("sink is closed")]
    Closed,
}

/// Result alias for sink operations
pub type SinkResult<T> = Result<T, SinkError>;

/// Append-only destination for market events
///
/// Implementations buffer internally; `flush` makes everything accepted so
/// far durable on disk. All methods take `&self` — sinks are shared between
/// the orchestrator and their own periodic timer threads.
pub trait EventSink: Send + Sync {
    /// Buffer one event for persistence
    fn append(&self, event: &MarketEvent) -> SinkResult<()>;

    /// Drain all buffers and fsync every open writer
    fn flush(&self) -> SinkResult<()>;

    /// Flush, then release every writer; the sink accepts no further appends
    fn close(&self) -> SinkResult<()>;

    /// Short name used in log lines
    fn name(&self) -> &'static str;
}

/// Dispatches every event to a set of underlying sinks
///
/// Used when both the JSONL and the columnar sink are enabled. Errors from
/// the first failing sink surface immediately; a COMMIT only happens once
/// every sink flushed.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// Create a fanout over the given sinks
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        FanoutSink { sinks }
    }

    /// Number of underlying sinks
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// True when no sinks are configured
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn append(&self, event: &MarketEvent) -> SinkResult<()> {
        for sink in &self.sinks {
            sink.append(event)?;
        }
        Ok(())
    }

    fn flush(&self) -> SinkResult<()> {
        for sink in &self.sinks {
            sink.flush()?;
        }
        Ok(())
    }

    fn close(&self) -> SinkResult<()> {
        for sink in &self.sinks {
            sink.close()?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fanout"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdc_core::{EventPayload, Symbol};
    use parking_lot::Mutex;

    /// Test sink recording every call
    pub(crate) struct RecordingSink {
        pub events: Mutex<Vec<MarketEvent>>,
        pub flushes: Mutex<usize>,
    }

    impl RecordingSink {
        pub(crate) fn new() -> Self {
            RecordingSink {
                events: Mutex::new(Vec::new()),
                flushes: Mutex::new(0),
            }
        }
    }

    impl EventSink for RecordingSink {
        fn append(&self, event: &MarketEvent) -> SinkResult<()> {
            self.events.lock().push(event.clone());
            Ok(())
        }

        fn flush(&self) -> SinkResult<()> {
            *self.flushes.lock() += 1;
            Ok(())
        }

        fn close(&self) -> SinkResult<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    fn test_event() -> MarketEvent {
        MarketEvent::new(
            Symbol::parse("SPY").unwrap(),
            EventPayload::Other {
                data: serde_json::json!({}),
            },
            "test",
        )
    }

    #[test]
    fn test_fanout_dispatches_to_all() {
        let a = Arc::new(RecordingSink::new());
        let b = Arc::new(RecordingSink::new());
        let fanout = FanoutSink::new(vec![a.clone(), b.clone()]);

        fanout.append(&test_event()).unwrap();
        fanout.flush().unwrap();

        assert_eq!(a.events.lock().len(), 1);
        assert_eq!(b.events.lock().len(), 1);
        assert_eq!(*a.flushes.lock(), 1);
        assert_eq!(*b.flushes.lock(), 1);
    }

    #[test]
    fn test_fanout_len() {
        let fanout = FanoutSink::new(vec![Arc::new(RecordingSink::new())]);
        assert_eq!(fanout.len(), 1);
        assert!(!fanout.is_empty());
    }
}

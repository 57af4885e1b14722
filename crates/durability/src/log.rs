//! Write-ahead log
//!
//! The WAL owns the durability contract: every event enters the pipeline
//! through `append`, receives a strictly monotonic process-global sequence,
//! and is persisted to the current segment before the call returns
//! (fsynced according to the sync mode).
//!
//! Single-writer semantics: one internal mutex serializes append, commit,
//! flush, and truncate. Recovery reads never hold the write mutex — they
//! operate on the immutable closed segments plus a flushed view of the
//! current one.

use crate::config::{WalConfig, WalConfigError};
use crate::record::{WalRecord, WalRecordType, MAX_COMMIT_PAYLOAD_LEN};
use crate::segment::{
    list_segment_files, scan_segment_range, ClosedSegment, WalSegment,
};
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// WAL errors
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// Underlying I/O failure
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration rejected at open
    #[error("WAL config error: {0}")]
    Config(#[from] WalConfigError),
}

/// Result alias for WAL operations
pub type WalResult<T> = Result<T, WalError>;

/// Outcome of a truncation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TruncateInfo {
    /// Segments gzip-copied into `archive/`
    pub archived: usize,
    /// Segments deleted outright
    pub deleted: usize,
}

/// Monotonic counters exposed for observability
#[derive(Debug, Clone, Copy, Default)]
pub struct WalCounters {
    /// EVENT records appended since open
    pub events_appended: u64,
    /// COMMIT records appended since open
    pub commits: u64,
    /// fsyncs performed since open
    pub syncs: u64,
    /// Segment rotations since open
    pub rotations: u64,
}

struct WalInner {
    segment: WalSegment,
    closed: Vec<ClosedSegment>,
    /// Highest sequence assigned so far
    current_sequence: u64,
    records_since_sync: usize,
    last_sync: Instant,
    counters: WalCounters,
}

/// Segmented, checksummed write-ahead log
pub struct WriteAheadLog {
    config: WalConfig,
    inner: Mutex<WalInner>,
}

impl WriteAheadLog {
    /// Open the WAL: scan existing segments, then start a fresh one.
    ///
    /// The highest sequence observed across all segments (valid records
    /// only) seeds the sequence counter; the new segment starts at that
    /// value plus one.
    pub fn open(config: WalConfig) -> WalResult<WriteAheadLog> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)?;

        let mut closed = Vec::new();
        let mut max_sequence: u64 = 0;
        for path in list_segment_files(&config.dir)? {
            let range = scan_segment_range(&path)?;
            if let Some(last) = range.last_sequence {
                max_sequence = max_sequence.max(last);
            }
            closed.push(range);
        }

        let segment = WalSegment::create(&config.dir, max_sequence + 1)?;
        info!(
            dir = %config.dir.display(),
            recovered_segments = closed.len(),
            next_sequence = max_sequence + 1,
            mode = config.sync_mode.description(),
            "WAL opened"
        );

        Ok(WriteAheadLog {
            config,
            inner: Mutex::new(WalInner {
                segment,
                closed,
                current_sequence: max_sequence,
                records_since_sync: 0,
                last_sync: Instant::now(),
                counters: WalCounters::default(),
            }),
        })
    }

    /// The WAL directory
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Highest sequence assigned so far (0 before the first append)
    pub fn current_sequence(&self) -> u64 {
        self.inner.lock().current_sequence
    }

    /// Counter snapshot
    pub fn counters(&self) -> WalCounters {
        self.inner.lock().counters
    }

    /// Append an EVENT record carrying the serialized event
    pub fn append_event(&self, payload: &str) -> WalResult<WalRecord> {
        self.append(payload, WalRecordType::Event)
    }

    /// Append a record of the given type.
    ///
    /// May rotate the current segment first (size or age threshold). The
    /// record is written and the buffer drained to the OS before the call
    /// returns; fsync follows the sync mode.
    pub fn append(&self, payload: &str, record_type: WalRecordType) -> WalResult<WalRecord> {
        let mut inner = self.inner.lock();
        self.maybe_rotate(&mut inner, payload.len())?;

        let sequence = inner.current_sequence + 1;
        let record = WalRecord::new(sequence, Utc::now(), record_type, payload.to_string());
        inner.segment.append_record(&record)?;
        inner.current_sequence = sequence;
        inner.records_since_sync += 1;
        match record_type {
            WalRecordType::Event => inner.counters.events_appended += 1,
            WalRecordType::Commit => inner.counters.commits += 1,
        }

        self.maybe_sync(&mut inner)?;
        Ok(record)
    }

    /// Append a COMMIT covering everything up to `through_sequence`, then
    /// force a flush.
    pub fn commit(&self, through_sequence: u64) -> WalResult<WalRecord> {
        let mut inner = self.inner.lock();
        self.maybe_rotate(&mut inner, MAX_COMMIT_PAYLOAD_LEN)?;

        let sequence = inner.current_sequence + 1;
        let record = WalRecord::new(
            sequence,
            Utc::now(),
            WalRecordType::Commit,
            through_sequence.to_string(),
        );
        inner.segment.append_record(&record)?;
        inner.current_sequence = sequence;
        inner.counters.commits += 1;

        self.flush_locked(&mut inner)?;
        debug!(through_sequence, "WAL commit");
        Ok(record)
    }

    /// Drain buffers; fsync unless the sync mode is NoSync
    pub fn flush(&self) -> WalResult<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }

    /// Delete or archive every closed segment fully covered by
    /// `through_sequence`.
    ///
    /// With `archive_after_truncate` each covered segment is gzip-copied
    /// into `archive/` before the original is removed — a truncated
    /// segment is never silently dropped.
    pub fn truncate(&self, through_sequence: u64) -> WalResult<TruncateInfo> {
        let mut inner = self.inner.lock();
        let mut info = TruncateInfo::default();

        let mut remaining = Vec::with_capacity(inner.closed.len());
        for closed in inner.closed.drain(..) {
            if !closed.covered_by(through_sequence) {
                remaining.push(closed);
                continue;
            }

            if self.config.archive_after_truncate {
                archive_segment(&closed.path, &self.config.archive_dir())?;
                info.archived += 1;
            } else {
                info.deleted += 1;
            }
            std::fs::remove_file(&closed.path)?;
            debug!(path = %closed.path.display(), through_sequence, "WAL segment truncated");
        }
        inner.closed = remaining;
        Ok(info)
    }

    /// Paths of every segment currently on disk, lexicographic order.
    ///
    /// Flushes first so the current segment's buffered records are
    /// visible to the reader.
    pub fn segment_paths(&self) -> WalResult<Vec<PathBuf>> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)?;
        drop(inner);
        Ok(list_segment_files(&self.config.dir)?)
    }

    /// Number of closed segments awaiting truncation
    pub fn closed_segment_count(&self) -> usize {
        self.inner.lock().closed.len()
    }

    /// Final flush and fsync; the WAL stays usable afterwards
    pub fn close(&self) -> WalResult<()> {
        let mut inner = self.inner.lock();
        inner.segment.sync()?;
        inner.records_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    fn flush_locked(&self, inner: &mut WalInner) -> WalResult<()> {
        if self.config.sync_mode.requires_fsync() {
            inner.segment.sync()?;
            inner.counters.syncs += 1;
        }
        inner.records_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    fn maybe_sync(&self, inner: &mut WalInner) -> WalResult<()> {
        if self.config.sync_mode.fsync_every_write() {
            return self.flush_locked(inner);
        }
        if !self.config.sync_mode.requires_fsync() {
            return Ok(());
        }
        let due = inner.records_since_sync >= self.config.sync_batch_size
            || inner.last_sync.elapsed() >= self.config.max_flush_delay;
        if due {
            self.flush_locked(inner)?;
        }
        Ok(())
    }

    fn maybe_rotate(&self, inner: &mut WalInner, incoming_len: usize) -> WalResult<()> {
        let over_size =
            inner.segment.size() + incoming_len as u64 + 64 > self.config.max_segment_bytes;
        let over_age = self
            .config
            .max_segment_age
            .map(|max| inner.segment.age() >= max)
            .unwrap_or(false);
        if !(over_size || over_age) {
            return Ok(());
        }

        // Rotation: flush, close, start a new segment one past the
        // current sequence.
        let next_start = inner.current_sequence + 1;
        let fresh = WalSegment::create(&self.config.dir, next_start)?;
        let old = std::mem::replace(&mut inner.segment, fresh);
        match old.close() {
            Ok(closed) => inner.closed.push(closed),
            Err(e) => {
                warn!(error = %e, "closing rotated WAL segment failed");
                return Err(e.into());
            }
        }
        inner.counters.rotations += 1;
        debug!(next_start, "WAL segment rotated");
        Ok(())
    }
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        // Final fsync so buffered records survive an orderly drop
        let mut inner = self.inner.lock();
        if let Err(e) = inner.segment.sync() {
            warn!(error = %e, "final WAL sync on drop failed");
        }
    }
}

/// gzip-copy a segment into the archive directory
fn archive_segment(path: &Path, archive_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(archive_dir)?;
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "segment has no file name"))?
        .to_string_lossy();
    let target = archive_dir.join(format!("{}.gz", name));

    let mut input = std::fs::File::open(path)?;
    let output = std::fs::File::create(&target)?;
    let mut encoder = GzEncoder::new(io::BufWriter::new(output), Compression::fast());
    io::copy(&mut input, &mut encoder)?;
    let mut inner = encoder.finish()?;
    inner.flush()?;
    inner.get_ref().sync_all()?;
    Ok(())
}

//! WAL recovery scan
//!
//! Recovery is a forward scan of every segment in lexicographic (creation)
//! order. The scan first establishes the final COMMIT's through-sequence,
//! then lazily yields every EVENT record above it. Corrupt lines are
//! logged and skipped; an event that no longer deserializes is logged and
//! dropped.

use crate::log::{WalResult, WriteAheadLog};
use crate::record::{WalRecord, WalRecordType};
use crate::segment::SEGMENT_MAGIC;
use mdc_core::MarketEvent;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;
use tracing::{debug, warn};

/// An EVENT record recovered from the WAL, decoded back into its event
#[derive(Debug, Clone)]
pub struct RecoveredEvent {
    /// The WAL sequence originally assigned to the event
    pub wal_sequence: u64,
    /// The deserialized event
    pub event: MarketEvent,
}

impl RecoveredEvent {
    /// Decode a WAL record's payload back into an event.
    ///
    /// Returns None (after logging) for COMMIT records and for payloads
    /// that no longer deserialize.
    pub fn decode(record: &WalRecord) -> Option<RecoveredEvent> {
        if record.record_type != WalRecordType::Event {
            return None;
        }
        match MarketEvent::from_json_line(&record.payload) {
            Ok(event) => Some(RecoveredEvent {
                wal_sequence: record.sequence,
                event,
            }),
            Err(e) => {
                warn!(
                    sequence = record.sequence,
                    error = %e,
                    "dropping undeserializable recovered event"
                );
                None
            }
        }
    }
}

/// Lazy iterator over EVENT records past the final COMMIT
pub struct UncommittedRecords {
    files: std::vec::IntoIter<PathBuf>,
    current: Option<Lines<BufReader<File>>>,
    current_path: PathBuf,
    line_index: usize,
    last_committed: u64,
}

impl UncommittedRecords {
    fn new(files: Vec<PathBuf>, last_committed: u64) -> Self {
        UncommittedRecords {
            files: files.into_iter(),
            current: None,
            current_path: PathBuf::new(),
            line_index: 0,
            last_committed,
        }
    }

    /// The through-sequence of the final COMMIT found during the scan
    pub fn last_committed_sequence(&self) -> u64 {
        self.last_committed
    }
}

impl Iterator for UncommittedRecords {
    type Item = WalRecord;

    fn next(&mut self) -> Option<WalRecord> {
        loop {
            let lines = match self.current.as_mut() {
                Some(lines) => lines,
                None => {
                    let path = self.files.next()?;
                    match File::open(&path) {
                        Ok(file) => {
                            self.current = Some(BufReader::new(file).lines());
                            self.current_path = path;
                            self.line_index = 0;
                            continue;
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "skipping unreadable WAL segment");
                            continue;
                        }
                    }
                }
            };

            let line = match lines.next() {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    warn!(path = %self.current_path.display(), error = %e, "read error, abandoning segment");
                    self.current = None;
                    continue;
                }
                None => {
                    self.current = None;
                    continue;
                }
            };

            let index = self.line_index;
            self.line_index += 1;
            if index == 0 && line.starts_with(SEGMENT_MAGIC) {
                continue;
            }
            if line.is_empty() {
                continue;
            }

            match WalRecord::parse_line(&line) {
                Ok(record)
                    if record.record_type == WalRecordType::Event
                        && record.sequence > self.last_committed =>
                {
                    return Some(record);
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(
                        path = %self.current_path.display(),
                        line_number = index + 1,
                        error = %e,
                        "skipping corrupt WAL line during recovery"
                    );
                    continue;
                }
            }
        }
    }
}

impl WriteAheadLog {
    /// Iterate every EVENT record not covered by the final COMMIT.
    ///
    /// Reads every segment in lexicographic order, tracking
    /// `last_committed_sequence` across COMMIT records, then yields each
    /// EVENT with a higher sequence. Invalid-checksum lines are logged
    /// and skipped.
    pub fn uncommitted_records(&self) -> WalResult<UncommittedRecords> {
        let files = self.segment_paths()?;
        let last_committed = find_last_committed(&files);
        debug!(
            segments = files.len(),
            last_committed, "WAL recovery scan starting"
        );
        Ok(UncommittedRecords::new(files, last_committed))
    }

    /// Recovered events past the final COMMIT, decoded and in order
    pub fn uncommitted_events(&self) -> WalResult<impl Iterator<Item = RecoveredEvent>> {
        Ok(self
            .uncommitted_records()?
            .filter_map(|record| RecoveredEvent::decode(&record)))
    }
}

/// First pass: the through-sequence of the final COMMIT across all files.
///
/// Quiet about corruption — the yielding pass logs it once.
fn find_last_committed(files: &[PathBuf]) -> u64 {
    let mut last_committed = 0u64;
    for path in files {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(_) => continue,
        };
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if index == 0 && line.starts_with(SEGMENT_MAGIC) {
                continue;
            }
            if let Ok(record) = WalRecord::parse_line(&line) {
                if let Some(through) = record.commit_through() {
                    last_committed = through;
                }
            }
        }
    }
    last_committed
}

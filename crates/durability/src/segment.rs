//! WAL segment files
//!
//! A segment is an append-only text file: one header line followed by one
//! record per line, strictly ascending in sequence. Segment filenames sort
//! lexicographically in creation order:
//!
//! ```text
//! wal_YYYYMMDD_HHMMSS_<starting sequence, 12 digits>.wal
//! ```

use crate::record::{WalRecord, WalRecordError};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::warn;

/// Magic prefix of the segment header line
pub const SEGMENT_MAGIC: &str = "MDCWAL01";

/// Segment format version carried in the header
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// File extension of live segments
pub const SEGMENT_EXTENSION: &str = "wal";

/// Render the header line for a segment created at `ts`
pub fn segment_header(ts: &DateTime<Utc>) -> String {
    format!(
        "{}|{}|{}",
        SEGMENT_MAGIC,
        SEGMENT_FORMAT_VERSION,
        ts.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Filename for a segment created at `ts` starting at `starting_sequence`
pub fn segment_file_name(ts: &DateTime<Utc>, starting_sequence: u64) -> String {
    format!(
        "wal_{}_{:012}.{}",
        ts.format("%Y%m%d_%H%M%S"),
        starting_sequence,
        SEGMENT_EXTENSION
    )
}

/// List all segment files in `dir`, lexicographically sorted.
///
/// Lexicographic order equals creation order by the filename construction.
pub fn list_segment_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_file() && name.starts_with("wal_") && name.ends_with(".wal") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// A closed (immutable) segment with its sequence range
#[derive(Debug, Clone)]
pub struct ClosedSegment {
    /// Segment file path
    pub path: PathBuf,
    /// Lowest record sequence in the file, if any records exist
    pub first_sequence: Option<u64>,
    /// Highest record sequence in the file, if any records exist
    pub last_sequence: Option<u64>,
}

impl ClosedSegment {
    /// True when every record in this segment is covered by `through`
    pub fn covered_by(&self, through: u64) -> bool {
        match self.last_sequence {
            Some(last) => last <= through,
            // A segment holding only a header has nothing to preserve
            None => true,
        }
    }
}

/// The currently-open segment being appended to
pub struct WalSegment {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
    opened_at: Instant,
    starting_sequence: u64,
    first_sequence: Option<u64>,
    last_sequence: Option<u64>,
}

impl WalSegment {
    /// Create a fresh segment in `dir`
    ///
    /// Writes the header line and flushes it so a crash right after
    /// rotation still leaves a well-formed file.
    pub fn create(dir: &Path, starting_sequence: u64) -> io::Result<WalSegment> {
        std::fs::create_dir_all(dir)?;
        let now = Utc::now();
        let path = dir.join(segment_file_name(&now, starting_sequence));
        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        let mut writer = BufWriter::new(file);

        let header = segment_header(&now);
        writer.write_all(header.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        Ok(WalSegment {
            size: header.len() as u64 + 1,
            path,
            writer,
            opened_at: Instant::now(),
            starting_sequence,
            first_sequence: None,
            last_sequence: None,
        })
    }

    /// Append one record line and drain the buffer to the OS
    pub fn append_record(&mut self, record: &WalRecord) -> io::Result<()> {
        let line = record.encode_line();
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        // Keep the file readable by recovery scans even in NoSync mode
        self.writer.flush()?;

        self.size += line.len() as u64 + 1;
        self.first_sequence.get_or_insert(record.sequence);
        self.last_sequence = Some(record.sequence);
        Ok(())
    }

    /// fsync the segment file
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Current size in bytes, counting buffered writes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Time since this segment was opened
    pub fn age(&self) -> std::time::Duration {
        self.opened_at.elapsed()
    }

    /// Segment file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence the segment was opened at
    pub fn starting_sequence(&self) -> u64 {
        self.starting_sequence
    }

    /// Close the segment, returning its immutable description
    pub fn close(mut self) -> io::Result<ClosedSegment> {
        self.sync()?;
        Ok(ClosedSegment {
            path: self.path,
            first_sequence: self.first_sequence,
            last_sequence: self.last_sequence,
        })
    }
}

/// Outcome of scanning one segment file
#[derive(Debug, Default)]
pub struct SegmentScan {
    /// Records that parsed and verified
    pub records: Vec<WalRecord>,
    /// Lines skipped due to corruption
    pub skipped: usize,
}

/// Read every valid record of a segment file.
///
/// Invalid-checksum and malformed lines are logged and skipped; a missing
/// or corrupt header is logged but does not abort the scan.
pub fn scan_segment(path: &Path) -> io::Result<SegmentScan> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut scan = SegmentScan::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if index == 0 {
            if !line.starts_with(SEGMENT_MAGIC) {
                warn!(path = %path.display(), "segment missing header line");
                // Fall through: the first line may still be a record
            } else {
                continue;
            }
        }
        if line.is_empty() {
            continue;
        }
        match WalRecord::parse_line(&line) {
            Ok(record) => scan.records.push(record),
            Err(WalRecordError::ChecksumMismatch {
                sequence,
                expected,
                actual,
            }) => {
                warn!(
                    path = %path.display(),
                    sequence, expected = %expected, actual = %actual,
                    "skipping WAL record with bad checksum"
                );
                scan.skipped += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), line_number = index + 1, error = %e, "skipping malformed WAL line");
                scan.skipped += 1;
            }
        }
    }
    Ok(scan)
}

/// Scan a segment only for its sequence range (used on startup)
pub fn scan_segment_range(path: &Path) -> io::Result<ClosedSegment> {
    let scan = scan_segment(path)?;
    Ok(ClosedSegment {
        path: path.to_path_buf(),
        first_sequence: scan.records.first().map(|r| r.sequence),
        last_sequence: scan.records.iter().map(|r| r.sequence).max(),
    })
}

//! Replay reader
//!
//! Forward scan over committed JSONL output beneath the data root. Files
//! are visited in case-insensitive lexicographic path order; within a
//! file, events come back in write order. Large uncompressed files are
//! memory-mapped to avoid copy overhead; compressed and small files
//! stream through a buffered reader.
//!
//! This is a full forward scan — there is no index and no seeking.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use mdc_core::{MarketEvent, Symbol};
use memmap2::Mmap;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default size above which uncompressed files are memory-mapped (1 MiB)
pub const DEFAULT_MIN_SIZE_FOR_MAPPING: u64 = 1024 * 1024;

/// Replay reader options
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Uncompressed files at least this large are memory-mapped
    pub min_size_for_mapping: u64,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        ReplayOptions {
            min_size_for_mapping: DEFAULT_MIN_SIZE_FOR_MAPPING,
        }
    }
}

/// Event filter applied during the scan
enum ReplayFilter {
    All,
    TimeRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    Symbols(HashSet<String>),
}

impl ReplayFilter {
    fn keep(&self, event: &MarketEvent) -> bool {
        match self {
            ReplayFilter::All => true,
            ReplayFilter::TimeRange { from, to } => {
                event.timestamp >= *from && event.timestamp <= *to
            }
            ReplayFilter::Symbols(set) => set.contains(event.symbol.as_str()),
        }
    }
}

/// Forward-scan reader over JSONL sink output
pub struct ReplayReader {
    data_root: PathBuf,
    wal_dir: PathBuf,
    options: ReplayOptions,
}

impl ReplayReader {
    /// Create a reader over `data_root`, skipping the WAL subtree
    pub fn new(data_root: impl AsRef<Path>, wal_dir: impl AsRef<Path>) -> Self {
        ReplayReader {
            data_root: data_root.as_ref().to_path_buf(),
            wal_dir: wal_dir.as_ref().to_path_buf(),
            options: ReplayOptions::default(),
        }
    }

    /// Override the reader options (builder pattern)
    pub fn with_options(mut self, options: ReplayOptions) -> Self {
        self.options = options;
        self
    }

    /// Iterate every event under the data root
    pub fn events(&self) -> std::io::Result<ReplayIter> {
        self.scan(ReplayFilter::All)
    }

    /// Iterate events with `from <= timestamp <= to`
    pub fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> std::io::Result<ReplayIter> {
        self.scan(ReplayFilter::TimeRange { from, to })
    }

    /// Iterate events whose symbol is in the given set
    pub fn events_for_symbols<I>(&self, symbols: I) -> std::io::Result<ReplayIter>
    where
        I: IntoIterator<Item = Symbol>,
    {
        let set = symbols
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();
        self.scan(ReplayFilter::Symbols(set))
    }

    fn scan(&self, filter: ReplayFilter) -> std::io::Result<ReplayIter> {
        let mut files = Vec::new();
        collect_jsonl_files(&self.data_root, &self.wal_dir, &mut files)?;
        // Case-insensitive lexicographic path order
        files.sort_by_key(|p| p.to_string_lossy().to_lowercase());

        Ok(ReplayIter {
            files: files.into_iter(),
            current: None,
            current_path: PathBuf::new(),
            filter,
            min_size_for_mapping: self.options.min_size_for_mapping,
        })
    }
}

fn collect_jsonl_files(dir: &Path, wal_dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if !dir.exists() || dir == wal_dir {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_jsonl_files(&path, wal_dir, out)?;
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".jsonl") || name.ends_with(".jsonl.gz") {
            out.push(path);
        }
    }
    Ok(())
}

/// Line source for one open file
enum LineSource {
    /// Memory-mapped uncompressed file
    Mapped { mmap: Mmap, pos: usize },
    /// Buffered plain-text stream
    Stream(Lines<BufReader<File>>),
    /// Buffered gzip stream
    Gzip(Lines<BufReader<GzDecoder<File>>>),
}

impl LineSource {
    fn open(path: &Path, min_size_for_mapping: u64) -> std::io::Result<LineSource> {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let file = File::open(path)?;

        if name.ends_with(".jsonl.gz") {
            return Ok(LineSource::Gzip(
                BufReader::new(GzDecoder::new(file)).lines(),
            ));
        }

        let size = file.metadata()?.len();
        if size >= min_size_for_mapping {
            // Safety: sink output files are append-only and never
            // truncated; a concurrent append past the mapped length is
            // invisible to this map.
            let mmap = unsafe { Mmap::map(&file)? };
            return Ok(LineSource::Mapped { mmap, pos: 0 });
        }
        Ok(LineSource::Stream(BufReader::new(file).lines()))
    }

    fn next_line(&mut self) -> Option<std::io::Result<String>> {
        match self {
            LineSource::Mapped { mmap, pos } => {
                let bytes = &mmap[..];
                if *pos >= bytes.len() {
                    return None;
                }
                let rest = &bytes[*pos..];
                let end = rest
                    .iter()
                    .position(|&b| b == b'\n')
                    .unwrap_or(rest.len());
                let line_bytes = &rest[..end];
                *pos += end + 1;
                Some(Ok(String::from_utf8_lossy(line_bytes).into_owned()))
            }
            LineSource::Stream(lines) => lines.next(),
            LineSource::Gzip(lines) => lines.next(),
        }
    }
}

/// Iterator over replayed events
pub struct ReplayIter {
    files: std::vec::IntoIter<PathBuf>,
    current: Option<LineSource>,
    current_path: PathBuf,
    filter: ReplayFilter,
    min_size_for_mapping: u64,
}

impl Iterator for ReplayIter {
    type Item = MarketEvent;

    fn next(&mut self) -> Option<MarketEvent> {
        loop {
            let source = match self.current.as_mut() {
                Some(source) => source,
                None => {
                    let path = self.files.next()?;
                    match LineSource::open(&path, self.min_size_for_mapping) {
                        Ok(source) => {
                            self.current = Some(source);
                            self.current_path = path;
                            continue;
                        }
                        Err(e) => {
                            debug!(path = %path.display(), error = %e, "skipping unreadable replay file");
                            continue;
                        }
                    }
                }
            };

            let line = match source.next_line() {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    debug!(path = %self.current_path.display(), error = %e, "read error, abandoning file");
                    self.current = None;
                    continue;
                }
                None => {
                    self.current = None;
                    continue;
                }
            };

            if line.is_empty() {
                continue;
            }
            match MarketEvent::from_json_line(&line) {
                Ok(event) => {
                    if self.filter.keep(&event) {
                        return Some(event);
                    }
                }
                Err(e) => {
                    debug!(path = %self.current_path.display(), error = %e, "skipping malformed replay line");
                }
            }
        }
    }
}

//! Data-file retention
//!
//! Periodically prunes sink output beneath the data root, first by age and
//! then oldest-first down to a total-bytes budget. The WAL subtree is never
//! touched — WAL lifetime is governed by commit/truncate, not retention.
//!
//! The "last sweep" timestamp is guarded by a reader-writer lock: checks
//! are frequent and must not contend with each other, so only the rare
//! stamp update takes the write lock and the sweep itself runs outside it.

use crate::path_policy::StorageLayout;
use parking_lot::{Condvar, Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Smallest allowed interval between sweeps
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Retention configuration
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Delete data files with mtime older than this many days
    pub retention_days: Option<u32>,
    /// Prune oldest files until total data bytes fit this budget
    pub max_total_bytes: Option<u64>,
    /// Interval between sweeps (clamped to at least 15 s)
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            retention_days: None,
            max_total_bytes: None,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl RetentionConfig {
    /// Derive retention settings from the storage layout
    pub fn from_layout(layout: &StorageLayout) -> Self {
        RetentionConfig {
            retention_days: layout.retention_days,
            max_total_bytes: layout.max_total_megabytes.map(|mb| mb * 1024 * 1024),
            ..Default::default()
        }
    }

    /// True when neither pruning rule is configured
    pub fn is_disabled(&self) -> bool {
        self.retention_days.is_none() && self.max_total_bytes.is_none()
    }

    fn effective_interval(&self) -> Duration {
        self.sweep_interval.max(MIN_SWEEP_INTERVAL)
    }
}

/// Outcome of one retention sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Files deleted by the age rule
    pub expired_files: usize,
    /// Files deleted by the size budget
    pub evicted_files: usize,
    /// Total bytes reclaimed
    pub bytes_removed: u64,
}

struct CandidateFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Periodic pruner for sink output files
pub struct RetentionManager {
    data_root: PathBuf,
    wal_dir: PathBuf,
    config: RetentionConfig,
    last_sweep: RwLock<Instant>,
    shutdown: AtomicBool,
    tick_signal: (Mutex<bool>, Condvar),
    sweep_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RetentionManager {
    /// Create a manager for data files beneath `data_root`
    ///
    /// `wal_dir` is excluded from every sweep.
    pub fn new(data_root: impl AsRef<Path>, wal_dir: impl AsRef<Path>, config: RetentionConfig) -> Self {
        RetentionManager {
            data_root: data_root.as_ref().to_path_buf(),
            wal_dir: wal_dir.as_ref().to_path_buf(),
            config,
            last_sweep: RwLock::new(Instant::now()),
            shutdown: AtomicBool::new(false),
            tick_signal: (Mutex::new(false), Condvar::new()),
            sweep_thread: Mutex::new(None),
        }
    }

    /// Start the background sweep thread
    pub fn start(self: &Arc<Self>) {
        if self.config.is_disabled() {
            return;
        }
        let manager = Arc::clone(self);
        let interval = self.config.effective_interval();
        let handle = thread::Builder::new()
            .name("mdc-retention".to_string())
            .spawn(move || loop {
                {
                    let (lock, cvar) = &manager.tick_signal;
                    let mut signaled = lock.lock();
                    if !*signaled {
                        cvar.wait_for(&mut signaled, interval);
                    }
                    *signaled = false;
                }
                if manager.shutdown.load(Ordering::Acquire) {
                    break;
                }
                manager.maybe_sweep();
            })
            .expect("failed to spawn retention thread");
        *self.sweep_thread.lock() = Some(handle);
    }

    /// Stop the background thread, waiting for its final iteration
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let (lock, cvar) = &self.tick_signal;
            let mut signaled = lock.lock();
            *signaled = true;
            cvar.notify_one();
        }
        if let Some(handle) = self.sweep_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Sweep if the minimum interval has elapsed since the last one.
    ///
    /// Cheap to call from hot paths: a read lock and an `Instant` compare
    /// when no sweep is due.
    pub fn maybe_sweep(&self) {
        if self.config.is_disabled() {
            return;
        }
        let interval = self.config.effective_interval();
        if self.last_sweep.read().elapsed() < interval {
            return;
        }

        {
            let mut stamp = self.last_sweep.write();
            // Another caller may have swept while we waited for the lock
            if stamp.elapsed() < interval {
                return;
            }
            *stamp = Instant::now();
        }

        // The sweep itself runs outside the write lock
        if let Err(e) = self.sweep_now() {
            warn!(error = %e, "retention sweep failed");
        }
    }

    /// Run one sweep immediately
    pub fn sweep_now(&self) -> std::io::Result<SweepStats> {
        let mut stats = SweepStats::default();
        let mut files = Vec::new();
        collect_data_files(&self.data_root, &self.wal_dir, &mut files)?;

        // Rule (a): age
        if let Some(days) = self.config.retention_days {
            let cutoff = SystemTime::now() - Duration::from_secs(u64::from(days) * 86_400);
            files.retain(|f| {
                if f.modified < cutoff {
                    match std::fs::remove_file(&f.path) {
                        Ok(()) => {
                            debug!(path = %f.path.display(), "retention expired file");
                            stats.expired_files += 1;
                            stats.bytes_removed += f.size;
                            false
                        }
                        Err(e) => {
                            warn!(path = %f.path.display(), error = %e, "retention delete failed");
                            true
                        }
                    }
                } else {
                    true
                }
            });
        }

        // Rule (b): total-bytes budget, oldest first
        if let Some(budget) = self.config.max_total_bytes {
            let mut total: u64 = files.iter().map(|f| f.size).sum();
            files.sort_by_key(|f| f.modified);
            for f in &files {
                if total <= budget {
                    break;
                }
                match std::fs::remove_file(&f.path) {
                    Ok(()) => {
                        debug!(path = %f.path.display(), "retention evicted file");
                        stats.evicted_files += 1;
                        stats.bytes_removed += f.size;
                        total -= f.size;
                    }
                    Err(e) => {
                        warn!(path = %f.path.display(), error = %e, "retention delete failed");
                    }
                }
            }
        }

        Ok(stats)
    }
}

impl Drop for RetentionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// True for the data-file extensions retention manages
fn is_data_file(path: &Path) -> bool {
    let name = match path.file_name() {
        Some(n) => n.to_string_lossy(),
        None => return false,
    };
    name.ends_with(".jsonl") || name.ends_with(".jsonl.gz") || name.ends_with(".parquet")
}

fn collect_data_files(
    dir: &Path,
    wal_dir: &Path,
    out: &mut Vec<CandidateFile>,
) -> std::io::Result<()> {
    if !dir.exists() || dir == wal_dir {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_data_files(&path, wal_dir, out)?;
        } else if is_data_file(&path) {
            let meta = entry.metadata()?;
            out.push(CandidateFile {
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                path,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(path: &Path, size: usize) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![b'x'; size]).unwrap();
    }

    fn set_mtime_days_ago(path: &Path, days: u64) {
        let mtime = SystemTime::now() - Duration::from_secs(days * 86_400);
        let file = std::fs::File::options().append(true).open(path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    fn manager(root: &Path, config: RetentionConfig) -> RetentionManager {
        RetentionManager::new(root, root.join("wal"), config)
    }

    #[test]
    fn test_age_rule() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("SPY/2023-01-01.jsonl");
        let fresh = dir.path().join("SPY/2024-01-15.jsonl");
        write_file(&old, 10);
        write_file(&fresh, 10);
        set_mtime_days_ago(&old, 30);

        let m = manager(
            dir.path(),
            RetentionConfig {
                retention_days: Some(7),
                ..Default::default()
            },
        );
        let stats = m.sweep_now().unwrap();

        assert_eq!(stats.expired_files, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_size_budget_evicts_oldest_first() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("A/2024-01-01.jsonl");
        let b = dir.path().join("B/2024-01-02.jsonl");
        let c = dir.path().join("C/2024-01-03.jsonl");
        write_file(&a, 1000);
        write_file(&b, 1000);
        write_file(&c, 1000);
        set_mtime_days_ago(&a, 3);
        set_mtime_days_ago(&b, 2);
        set_mtime_days_ago(&c, 1);

        let m = manager(
            dir.path(),
            RetentionConfig {
                max_total_bytes: Some(2000),
                ..Default::default()
            },
        );
        let stats = m.sweep_now().unwrap();

        assert_eq!(stats.evicted_files, 1);
        assert!(!a.exists());
        assert!(b.exists());
        assert!(c.exists());
    }

    #[test]
    fn test_budget_reached_after_one_sweep() {
        let dir = tempdir().unwrap();
        for i in 0..10 {
            let path = dir.path().join(format!("S/file-{:02}.jsonl", i));
            write_file(&path, 100);
            set_mtime_days_ago(&path, 10 - i as u64);
        }

        let m = manager(
            dir.path(),
            RetentionConfig {
                max_total_bytes: Some(350),
                ..Default::default()
            },
        );
        m.sweep_now().unwrap();

        let mut files = Vec::new();
        collect_data_files(dir.path(), &dir.path().join("wal"), &mut files).unwrap();
        let total: u64 = files.iter().map(|f| f.size).sum();
        assert!(total <= 350);
    }

    #[test]
    fn test_wal_subtree_untouched() {
        let dir = tempdir().unwrap();
        let wal_like = dir.path().join("wal/archive/old.jsonl");
        write_file(&wal_like, 10);
        set_mtime_days_ago(&wal_like, 365);

        let m = manager(
            dir.path(),
            RetentionConfig {
                retention_days: Some(1),
                max_total_bytes: Some(0),
                ..Default::default()
            },
        );
        m.sweep_now().unwrap();

        assert!(wal_like.exists());
    }

    #[test]
    fn test_non_data_files_ignored() {
        let dir = tempdir().unwrap();
        let sidecar = dir.path().join("manifest.json");
        write_file(&sidecar, 10);
        set_mtime_days_ago(&sidecar, 365);

        let m = manager(
            dir.path(),
            RetentionConfig {
                retention_days: Some(1),
                ..Default::default()
            },
        );
        m.sweep_now().unwrap();

        assert!(sidecar.exists());
    }

    #[test]
    fn test_maybe_sweep_respects_interval() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("S/x.jsonl");
        write_file(&file, 10);
        set_mtime_days_ago(&file, 30);

        let m = manager(
            dir.path(),
            RetentionConfig {
                retention_days: Some(7),
                sweep_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );

        // The manager was just created, so the interval has not elapsed
        m.maybe_sweep();
        assert!(file.exists());
    }

    #[test]
    fn test_disabled_config_never_deletes() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("S/x.jsonl");
        write_file(&file, 10);

        let m = manager(dir.path(), RetentionConfig::default());
        assert!(m.config.is_disabled());
        let stats = m.sweep_now().unwrap();
        assert_eq!(stats, SweepStats::default());
        assert!(file.exists());
    }

    #[test]
    fn test_start_stop_background_thread() {
        let dir = tempdir().unwrap();
        let m = Arc::new(manager(
            dir.path(),
            RetentionConfig {
                retention_days: Some(7),
                ..Default::default()
            },
        ));
        m.start();
        m.stop();
    }
}

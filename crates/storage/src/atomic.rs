//! Crash-safe whole-file writes
//!
//! Uses the write-fsync-rename pattern for atomic file creation: a reader
//! observes either the old file or the fully new file, never a truncated
//! intermediate.
//!
//! # Crash Safety
//!
//! Every write follows this pattern:
//! 1. Write to a uniquely-named sibling temp file (`.<basename>.<random>.tmp`)
//! 2. fsync the temp file
//! 3. Atomic rename over the destination
//! 4. fsync the parent directory (POSIX; NTFS journals metadata on its own)
//!
//! On any failure the temp file is removed best-effort and the error is
//! surfaced; the destination is never observed in a partial state.

use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Sidecar extension for checksum files
pub const CHECKSUM_EXTENSION: &str = "sha256";

/// Atomic write errors
#[derive(Debug, thiserror::Error)]
pub enum AtomicWriteError {
    /// Underlying I/O failure
    #[error("atomic write I/O error: {0}")]
    Io(#[from] io::Error),

    /// Re-read digest disagrees with the pre-write digest
    #[error("checksum mismatch after write of {path}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        /// Destination path
        path: PathBuf,
        /// Digest computed before the write
        expected: String,
        /// Digest computed from the temp file
        actual: String,
    },

    /// Destination has no file name component
    #[error("destination {0} has no file name")]
    InvalidDestination(PathBuf),
}

/// Lowercase-hex SHA-256 of a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

/// Lowercase-hex SHA-256 of a file, streaming in 64 KiB chunks
pub fn sha256_file(path: &Path) -> io::Result<String> {
    use std::io::Read;

    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn temp_path_for(dest: &Path) -> Result<PathBuf, AtomicWriteError> {
    let name = dest
        .file_name()
        .ok_or_else(|| AtomicWriteError::InvalidDestination(dest.to_path_buf()))?
        .to_string_lossy()
        .to_string();
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join(format!(".{}.{:08x}.tmp", name, rand::random::<u32>())))
}

/// fsync the directory containing `path` so the rename itself is durable.
///
/// Windows has no directory handles to sync; NTFS journals metadata.
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            let dir = if parent.as_os_str().is_empty() {
                File::open(".")?
            } else {
                File::open(parent)?
            };
            dir.sync_all()?;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Write `bytes` to `dest` atomically.
///
/// Creates parent directories as needed.
pub fn write(dest: &Path, bytes: &[u8]) -> Result<(), AtomicWriteError> {
    write_with(dest, |w| w.write_all(bytes))
}

/// Write to `dest` atomically through a streaming callback.
///
/// The callback receives the buffered temp-file writer; whatever it writes
/// becomes the full new content of `dest`.
pub fn write_with<F>(dest: &Path, f: F) -> Result<(), AtomicWriteError>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let temp = temp_path_for(dest)?;

    let result = (|| -> Result<(), AtomicWriteError> {
        let file = OpenOptions::new().create_new(true).write(true).open(&temp)?;
        let mut writer = io::BufWriter::new(file);
        f(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        std::fs::rename(&temp, dest)?;
        sync_parent_dir(dest)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp);
    }
    result
}

/// Write `bytes` atomically, verify the digest, and emit a checksum sidecar.
///
/// After the temp write the file is re-read and its SHA-256 compared with
/// the digest of `bytes`; a disagreement fails the write. On success a
/// `<dest>.sha256` sidecar is written containing `<hex>  <basename>\n`.
pub fn write_with_checksum(dest: &Path, bytes: &[u8]) -> Result<String, AtomicWriteError> {
    let expected = sha256_hex(bytes);

    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let temp = temp_path_for(dest)?;

    let result = (|| -> Result<(), AtomicWriteError> {
        {
            let file = OpenOptions::new().create_new(true).write(true).open(&temp)?;
            let mut writer = io::BufWriter::new(file);
            writer.write_all(bytes)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        // Re-read and compare before the rename makes the file visible
        let actual = sha256_file(&temp)?;
        if actual != expected {
            return Err(AtomicWriteError::ChecksumMismatch {
                path: dest.to_path_buf(),
                expected: expected.clone(),
                actual,
            });
        }

        std::fs::rename(&temp, dest)?;
        sync_parent_dir(dest)?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&temp);
        return Err(e);
    }

    write_sidecar(dest, &expected)?;
    Ok(expected)
}

/// Replace `dest` atomically, keeping a `.bak` of any previous content.
///
/// Any existing `dest` is first renamed to `<dest>.bak`. If the write then
/// fails and `dest` is absent, the backup is restored. When `keep_backup`
/// is false the backup is removed after a successful write.
pub fn replace(dest: &Path, bytes: &[u8], keep_backup: bool) -> Result<(), AtomicWriteError> {
    let backup = backup_path(dest);
    let had_previous = dest.exists();

    if had_previous {
        std::fs::rename(dest, &backup)?;
    }

    match write(dest, bytes) {
        Ok(()) => {
            if had_previous && !keep_backup {
                let _ = std::fs::remove_file(&backup);
            }
            Ok(())
        }
        Err(e) => {
            if had_previous && !dest.exists() {
                let _ = std::fs::rename(&backup, dest);
            }
            Err(e)
        }
    }
}

/// Verify the checksum sidecar of `path`.
///
/// Returns true iff the sidecar exists and its digest matches the file.
pub fn verify_checksum(path: &Path) -> io::Result<bool> {
    let sidecar = sidecar_path(path);
    if !sidecar.exists() {
        return Ok(false);
    }

    let contents = std::fs::read_to_string(&sidecar)?;
    let declared = match contents.split_whitespace().next() {
        Some(hex) => hex.to_string(),
        None => return Ok(false),
    };

    Ok(sha256_file(path)? == declared)
}

/// Path of the checksum sidecar for `path` (`<path>.sha256`)
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(CHECKSUM_EXTENSION);
    PathBuf::from(name)
}

/// Path of the replace backup for `path` (`<path>.bak`)
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

fn write_sidecar(dest: &Path, hex: &str) -> Result<(), AtomicWriteError> {
    let basename = dest
        .file_name()
        .ok_or_else(|| AtomicWriteError::InvalidDestination(dest.to_path_buf()))?
        .to_string_lossy();
    let line = format!("{}  {}\n", hex, basename);
    write(&sidecar_path(dest), line.as_bytes())
}

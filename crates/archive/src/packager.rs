//! Portable archive packager
//!
//! Produces a self-contained, verifiable zip of a subset of on-disk event
//! files. The zip carries `manifest.json` with per-file SHA-256 digests,
//! a `checksums.sha256` sidecar list, per-type schema descriptors, a
//! README, and the data files themselves under `data/`.
//!
//! The package format is zip only; the archive is written to a temp file
//! and renamed into place so a partially-built package is never visible.

use crate::manifest::{
    derive_symbols, extract_event_type, DateRange, PackageFilter, PackageManifest, PackageTotals,
    PackagedFile, MANIFEST_VERSION,
};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use mdc_core::EventType;
use mdc_storage::atomic::sha256_file;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Archive entry name of the manifest
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Archive entry name of the checksum list
pub const CHECKSUMS_ENTRY: &str = "checksums.sha256";

/// Archive entry name of the README
pub const README_ENTRY: &str = "README.txt";

/// Directory prefix of packaged data files
pub const DATA_PREFIX: &str = "data/";

/// Directory prefix of schema descriptors
pub const SCHEMAS_PREFIX: &str = "schemas/";

/// Packager errors
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    /// Underlying I/O failure
    #[error("package I/O error: {0}")]
    Io(#[from] io::Error),

    /// Zip read/write failure
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Manifest (de)serialization failure
    #[error("manifest error: {0}")]
    Json(#[from] serde_json::Error),

    /// Zip entry would resolve outside the extraction target
    #[error("entry '{0}' escapes the extraction target")]
    PathTraversal(String),

    /// The archive has no manifest.json
    #[error("package has no {MANIFEST_ENTRY}")]
    MissingManifest,

    /// Post-creation verification found mismatches
    #[error("package failed verification: {0} error(s)")]
    VerificationFailed(usize),
}

/// Packager configuration
#[derive(Debug, Clone)]
pub struct PackagerConfig {
    /// Re-open and verify the zip after creating it (default: true)
    pub verify_after_creation: bool,
}

impl Default for PackagerConfig {
    fn default() -> Self {
        PackagerConfig {
            verify_after_creation: true,
        }
    }
}

/// Summary of a created package
#[derive(Debug, Clone)]
pub struct PackageInfo {
    /// Path of the finished zip
    pub path: PathBuf,
    /// Number of packaged data files
    pub file_count: usize,
    /// Total bytes of packaged data files (uncompressed)
    pub total_bytes: u64,
    /// Symbols recorded in the manifest
    pub symbols: Vec<String>,
}

/// Result of verifying a package against its manifest
#[derive(Debug, Clone, Default)]
pub struct PackageVerifyReport {
    /// True when every digest matched
    pub is_valid: bool,
    /// One message per mismatched or missing file
    pub errors: Vec<String>,
    /// Number of files checked
    pub files_checked: usize,
}

/// Result of extracting a package
#[derive(Debug, Clone)]
pub struct ExtractReport {
    /// Number of entries written
    pub files_extracted: usize,
    /// Digest verification of the extracted data files
    pub verify: PackageVerifyReport,
}

/// Builds, verifies, and extracts portable packages
pub struct ArchivePackager {
    data_root: PathBuf,
    wal_dir: PathBuf,
    config: PackagerConfig,
}

impl ArchivePackager {
    /// Create a packager over `data_root`, excluding the WAL subtree
    pub fn new(
        data_root: impl AsRef<Path>,
        wal_dir: impl AsRef<Path>,
        config: PackagerConfig,
    ) -> Self {
        ArchivePackager {
            data_root: data_root.as_ref().to_path_buf(),
            wal_dir: wal_dir.as_ref().to_path_buf(),
            config,
        }
    }

    /// Create a package at `dest` from the files selected by `filter`
    pub fn create(
        &self,
        package_name: &str,
        filter: &PackageFilter,
        dest: &Path,
    ) -> Result<PackageInfo, PackageError> {
        // 1. Enumerate and filter data files
        let mut entries = Vec::new();
        let mut paths = Vec::new();
        for path in self.enumerate_data_files()? {
            let relative = path
                .strip_prefix(&self.data_root)
                .unwrap_or(&path)
                .to_path_buf();
            let meta = std::fs::metadata(&path)?;
            let modified: DateTime<Utc> = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH).into();
            if !filter.matches(&relative, modified.date_naive()) {
                continue;
            }

            // 2. Per-file digest
            let sha256 = sha256_file(&path)?;
            let rel_str = relative.to_string_lossy().replace('\\', "/");
            paths.push(rel_str.clone());
            entries.push((
                path,
                PackagedFile {
                    path: rel_str,
                    size_bytes: meta.len(),
                    sha256,
                    last_modified: modified.to_rfc3339_opts(SecondsFormat::Millis, true),
                },
            ));
        }

        // 3. Manifest summary fields
        let symbols = derive_symbols(&paths);
        let date_range = derive_date_range(entries.iter().map(|(_, f)| &f.last_modified));
        let totals = PackageTotals {
            file_count: entries.len(),
            total_bytes: entries.iter().map(|(_, f)| f.size_bytes).sum(),
        };
        let manifest = PackageManifest {
            manifest_version: MANIFEST_VERSION,
            package_name: package_name.to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            totals,
            symbols: symbols.clone(),
            date_range,
            files: entries.iter().map(|(_, f)| f.clone()).collect(),
        };

        // 4. Write the zip to a temp sibling, then rename into place
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let temp = dest.with_extension("zip.tmp");
        let result = self.write_zip(&manifest, &entries, &temp);
        if let Err(e) = result {
            let _ = std::fs::remove_file(&temp);
            return Err(e);
        }
        std::fs::rename(&temp, dest)?;

        info!(
            package = package_name,
            path = %dest.display(),
            files = manifest.totals.file_count,
            "package created"
        );

        // 5. Optional re-open and verify
        if self.config.verify_after_creation {
            let report = Self::verify(dest)?;
            if !report.is_valid {
                return Err(PackageError::VerificationFailed(report.errors.len()));
            }
        }

        Ok(PackageInfo {
            path: dest.to_path_buf(),
            file_count: manifest.totals.file_count,
            total_bytes: manifest.totals.total_bytes,
            symbols,
        })
    }

    fn write_zip(
        &self,
        manifest: &PackageManifest,
        entries: &[(PathBuf, PackagedFile)],
        temp: &Path,
    ) -> Result<(), PackageError> {
        let file = File::create(temp)?;
        let mut zip = ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        // manifest.json
        zip.start_file(MANIFEST_ENTRY, options)?;
        zip.write_all(&serde_json::to_vec_pretty(manifest)?)?;

        // checksums.sha256: `<hex>  data/<relpath>` per line
        zip.start_file(CHECKSUMS_ENTRY, options)?;
        for (_, entry) in entries {
            writeln!(zip, "{}  {}{}", entry.sha256, DATA_PREFIX, entry.path)?;
        }

        // README.txt
        zip.start_file(README_ENTRY, options)?;
        write_readme(&mut zip, manifest)?;

        // schemas/<type>.json for every present type
        for ty in self.present_event_types(entries) {
            zip.start_file(format!("{}{}.json", SCHEMAS_PREFIX, ty.as_str()), options)?;
            let schema = self.load_or_default_schema(ty)?;
            zip.write_all(&schema)?;
        }

        // data/<relpath> mirrors the source tree
        for (source, entry) in entries {
            zip.start_file(format!("{}{}", DATA_PREFIX, entry.path), options)?;
            let mut input = File::open(source)?;
            io::copy(&mut input, &mut zip)?;
        }

        let file = zip.finish()?;
        file.sync_all()?;
        Ok(())
    }

    /// Event types visible in the packaged paths; Other when nothing else is
    fn present_event_types(&self, entries: &[(PathBuf, PackagedFile)]) -> Vec<EventType> {
        let mut types = BTreeSet::new();
        for (_, entry) in entries {
            if let Some(ty) = extract_event_type(Path::new(&entry.path)) {
                types.insert(ty);
            }
        }
        if types.is_empty() && !entries.is_empty() {
            types.insert(EventType::Other);
        }
        types.into_iter().collect()
    }

    /// Use an on-disk schema descriptor when present, else a placeholder
    fn load_or_default_schema(&self, ty: EventType) -> Result<Vec<u8>, PackageError> {
        let on_disk = self.data_root.join("schemas").join(format!("{}.json", ty.as_str()));
        if on_disk.exists() {
            return Ok(std::fs::read(&on_disk)?);
        }
        let placeholder = serde_json::json!({
            "eventType": ty.as_str(),
            "description": "Default schema descriptor; no schema file was present on disk",
            "encoding": "jsonl or parquet, camelCase keys, ISO-8601 timestamps",
        });
        Ok(serde_json::to_vec_pretty(&placeholder)?)
    }

    /// Verify every manifest digest against the archive's `data/` entries
    pub fn verify(path: &Path) -> Result<PackageVerifyReport, PackageError> {
        let mut archive = ZipArchive::new(File::open(path)?)?;
        let manifest = read_manifest(&mut archive)?;

        let mut report = PackageVerifyReport {
            is_valid: true,
            ..Default::default()
        };

        for entry in &manifest.files {
            report.files_checked += 1;
            let zip_name = format!("{}{}", DATA_PREFIX, entry.path);
            let mut file = match archive.by_name(&zip_name) {
                Ok(f) => f,
                Err(_) => {
                    report.is_valid = false;
                    report
                        .errors
                        .push(format!("Missing entry: {}", entry.path));
                    continue;
                }
            };

            let mut hasher = Sha256::new();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            let actual: String = hasher
                .finalize()
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect();

            if actual != entry.sha256 {
                report.is_valid = false;
                report.errors.push(format!(
                    "Checksum mismatch: {} (expected {}, found {})",
                    entry.path, entry.sha256, actual
                ));
            }
        }

        debug!(
            path = %path.display(),
            files = report.files_checked,
            valid = report.is_valid,
            "package verified"
        );
        Ok(report)
    }

    /// Extract a package into `target` and verify the extracted data.
    ///
    /// Every entry is resolved against `target`; an entry with absolute or
    /// `..` components aborts the extraction before anything escapes.
    pub fn extract(path: &Path, target: &Path) -> Result<ExtractReport, PackageError> {
        let mut archive = ZipArchive::new(File::open(path)?)?;
        std::fs::create_dir_all(target)?;

        let mut files_extracted = 0;
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let name = entry.name().to_string();
            let safe_relative = entry
                .enclosed_name()
                .ok_or_else(|| PackageError::PathTraversal(name.clone()))?;
            let out_path = target.join(safe_relative);

            if entry.is_dir() {
                std::fs::create_dir_all(&out_path)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&out_path)?;
            io::copy(&mut entry, &mut out)?;
            files_extracted += 1;
        }

        // Verify the extracted data against the extracted manifest
        let manifest_path = target.join(MANIFEST_ENTRY);
        if !manifest_path.exists() {
            return Err(PackageError::MissingManifest);
        }
        let manifest: PackageManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path)?)?;

        let mut verify = PackageVerifyReport {
            is_valid: true,
            ..Default::default()
        };
        for entry in &manifest.files {
            verify.files_checked += 1;
            let data_path = target.join("data").join(&entry.path);
            if !data_path.exists() {
                verify.is_valid = false;
                verify.errors.push(format!("Missing file: {}", entry.path));
                continue;
            }
            let actual = sha256_file(&data_path)?;
            if actual != entry.sha256 {
                verify.is_valid = false;
                verify.errors.push(format!(
                    "Checksum mismatch: {} (expected {}, found {})",
                    entry.path, entry.sha256, actual
                ));
                warn!(path = %data_path.display(), "extracted file failed verification");
            }
        }

        Ok(ExtractReport {
            files_extracted,
            verify,
        })
    }

    fn enumerate_data_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        collect_data_files(&self.data_root, &self.wal_dir, &mut files)?;
        files.sort();
        Ok(files)
    }
}

fn collect_data_files(dir: &Path, wal_dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    if !dir.exists() || dir == wal_dir {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_data_files(&path, wal_dir, out)?;
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".jsonl") || name.ends_with(".jsonl.gz") || name.ends_with(".parquet") {
            out.push(path);
        }
    }
    Ok(())
}

fn derive_date_range<'a>(timestamps: impl Iterator<Item = &'a String>) -> Option<DateRange> {
    let mut min: Option<NaiveDate> = None;
    let mut max: Option<NaiveDate> = None;
    for ts in timestamps {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(ts) {
            let date = parsed.date_naive();
            min = Some(min.map_or(date, |m| m.min(date)));
            max = Some(max.map_or(date, |m| m.max(date)));
        }
    }
    Some(DateRange {
        from: min?,
        to: max?,
    })
}

fn write_readme<W: Write>(w: &mut W, manifest: &PackageManifest) -> io::Result<()> {
    writeln!(w, "Market data package: {}", manifest.package_name)?;
    writeln!(w, "Created: {}", manifest.created_at)?;
    writeln!(
        w,
        "Files: {} ({} bytes)",
        manifest.totals.file_count, manifest.totals.total_bytes
    )?;
    if !manifest.symbols.is_empty() {
        writeln!(w, "Symbols: {}", manifest.symbols.join(", "))?;
    }
    if let Some(range) = &manifest.date_range {
        writeln!(w, "Date range: {} to {}", range.from, range.to)?;
    }
    writeln!(w)?;
    writeln!(w, "Layout:")?;
    writeln!(w, "  manifest.json      package manifest with per-file SHA-256")?;
    writeln!(w, "  checksums.sha256   digest list, one `<hex>  data/<path>` per line")?;
    writeln!(w, "  schemas/           one JSON schema descriptor per event type")?;
    writeln!(w, "  data/              event files, mirroring the source tree")?;
    Ok(())
}

fn read_manifest(archive: &mut ZipArchive<File>) -> Result<PackageManifest, PackageError> {
    let mut entry = archive
        .by_name(MANIFEST_ENTRY)
        .map_err(|_| PackageError::MissingManifest)?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdc_core::Symbol;
    use tempfile::tempdir;

    fn seed_data(root: &Path) {
        for (rel, contents) in [
            ("SPY/2024-01-15.jsonl", "{\"symbol\":\"SPY\"}\n"),
            ("QQQ/2024-01-15.jsonl", "{\"symbol\":\"QQQ\"}\n"),
            ("IWM/2024-01-15.jsonl", "{\"symbol\":\"IWM\"}\n"),
        ] {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
        // WAL files must never be packaged
        std::fs::create_dir_all(root.join("wal")).unwrap();
        std::fs::write(root.join("wal/wal_20240115_000000_000000000001.wal"), "x").unwrap();
    }

    fn packager(root: &Path) -> ArchivePackager {
        ArchivePackager::new(root, root.join("wal"), PackagerConfig::default())
    }

    #[test]
    fn test_create_and_verify() {
        let dir = tempdir().unwrap();
        seed_data(dir.path());
        let dest = dir.path().join("out/pkg.zip");

        let info = packager(dir.path())
            .create("pkg", &PackageFilter::all(), &dest)
            .unwrap();

        assert!(dest.exists());
        assert_eq!(info.file_count, 3);
        assert_eq!(info.symbols, vec!["IWM", "QQQ", "SPY"]);

        let report = ArchivePackager::verify(&dest).unwrap();
        assert!(report.is_valid);
        assert_eq!(report.files_checked, 3);
    }

    #[test]
    fn test_zip_layout() {
        let dir = tempdir().unwrap();
        seed_data(dir.path());
        let dest = dir.path().join("pkg.zip");
        packager(dir.path())
            .create("pkg", &PackageFilter::all(), &dest)
            .unwrap();

        let mut archive = ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();

        assert!(names.contains(&"manifest.json".to_string()));
        assert!(names.contains(&"checksums.sha256".to_string()));
        assert!(names.contains(&"README.txt".to_string()));
        assert!(names.contains(&"data/SPY/2024-01-15.jsonl".to_string()));
        assert!(names.iter().any(|n| n.starts_with("schemas/")));
        assert!(!names.iter().any(|n| n.contains(".wal")));
    }

    #[test]
    fn test_symbol_filter() {
        let dir = tempdir().unwrap();
        seed_data(dir.path());
        let dest = dir.path().join("pkg.zip");

        let filter = PackageFilter::all().with_symbols(vec![
            Symbol::parse("SPY").unwrap(),
            Symbol::parse("QQQ").unwrap(),
        ]);
        let info = packager(dir.path()).create("pkg", &filter, &dest).unwrap();

        assert_eq!(info.file_count, 2);
        assert_eq!(info.symbols, vec!["QQQ", "SPY"]);
    }

    #[test]
    fn test_checksums_entry_format() {
        let dir = tempdir().unwrap();
        seed_data(dir.path());
        let dest = dir.path().join("pkg.zip");
        packager(dir.path())
            .create("pkg", &PackageFilter::all(), &dest)
            .unwrap();

        let mut archive = ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        let mut entry = archive.by_name(CHECKSUMS_ENTRY).unwrap();
        let mut text = String::new();
        entry.read_to_string(&mut text).unwrap();

        for line in text.lines() {
            let (hex, rest) = line.split_once("  ").unwrap();
            assert_eq!(hex.len(), 64);
            assert!(rest.starts_with("data/"));
        }
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_verify_detects_corruption() {
        let dir = tempdir().unwrap();
        seed_data(dir.path());
        let dest = dir.path().join("pkg.zip");
        packager(dir.path())
            .create("pkg", &PackageFilter::all(), &dest)
            .unwrap();

        // Rebuild the zip with one corrupted data entry, keeping the
        // original manifest
        let corrupted = dir.path().join("corrupted.zip");
        {
            let mut src = ZipArchive::new(File::open(&dest).unwrap()).unwrap();
            let mut out = ZipWriter::new(File::create(&corrupted).unwrap());
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            for i in 0..src.len() {
                let mut entry = src.by_index(i).unwrap();
                let name = entry.name().to_string();
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes).unwrap();
                if name == "data/QQQ/2024-01-15.jsonl" {
                    bytes[0] ^= 0x01;
                }
                out.start_file(name, options).unwrap();
                out.write_all(&bytes).unwrap();
            }
            out.finish().unwrap();
        }

        let report = ArchivePackager::verify(&corrupted).unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("Checksum mismatch"));
        assert!(report.errors[0].contains("QQQ/2024-01-15.jsonl"));
    }

    #[test]
    fn test_extract_roundtrip() {
        let dir = tempdir().unwrap();
        seed_data(dir.path());
        let dest = dir.path().join("pkg.zip");
        packager(dir.path())
            .create("pkg", &PackageFilter::all(), &dest)
            .unwrap();

        let target = dir.path().join("extracted");
        let report = ArchivePackager::extract(&dest, &target).unwrap();

        assert!(report.verify.is_valid);
        assert_eq!(
            std::fs::read(target.join("data/SPY/2024-01-15.jsonl")).unwrap(),
            std::fs::read(dir.path().join("SPY/2024-01-15.jsonl")).unwrap()
        );
    }

    #[test]
    fn test_extract_rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let evil = dir.path().join("evil.zip");
        {
            let mut zip = ZipWriter::new(File::create(&evil).unwrap());
            let options = SimpleFileOptions::default();
            zip.start_file("../outside.txt", options).unwrap();
            zip.write_all(b"escape").unwrap();
            zip.finish().unwrap();
        }

        let target = dir.path().join("target");
        let result = ArchivePackager::extract(&evil, &target);
        assert!(matches!(result, Err(PackageError::PathTraversal(_))));
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[test]
    fn test_empty_filter_result() {
        let dir = tempdir().unwrap();
        seed_data(dir.path());
        let dest = dir.path().join("pkg.zip");

        let filter =
            PackageFilter::all().with_symbols(vec![Symbol::parse("ZZZZ").unwrap()]);
        let info = packager(dir.path()).create("pkg", &filter, &dest).unwrap();

        assert_eq!(info.file_count, 0);
        let report = ArchivePackager::verify(&dest).unwrap();
        assert!(report.is_valid);
        assert_eq!(report.files_checked, 0);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        seed_data(dir.path());
        let dest = dir.path().join("pkg.zip");
        packager(dir.path())
            .create("pkg", &PackageFilter::all(), &dest)
            .unwrap();

        assert!(!dest.with_extension("zip.tmp").exists());
    }
}

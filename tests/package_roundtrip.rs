//! Package creation, verification, and extraction scenarios
//!
//! Drives the packager against real collector output: round-trip
//! byte-for-byte extraction, corruption detection with exact error
//! attribution, and the path-traversal guard.

use chrono::{TimeZone, Utc};
use marketdata_collector::event::{Aggressor, EventPayload, MarketEvent, Symbol};
use marketdata_collector::{
    ArchivePackager, CollectorConfig, MarketDataCollector, PackageFilter, PackagerConfig, SyncMode,
};
use rust_decimal::Decimal;
use std::io::{Read, Write};
use std::path::Path;

fn trade(symbol: &str, source_seq: u64) -> MarketEvent {
    MarketEvent {
        timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap(),
        symbol: Symbol::parse(symbol).unwrap(),
        payload: EventPayload::Trade {
            price: Decimal::new(45012, 2),
            size: 100,
            aggressor: Aggressor::Buy,
            sequence_number: Some(source_seq),
            venue: None,
        },
        sequence: Some(source_seq),
        source: "pkg-test".to_string(),
    }
}

/// Surface packager warnings in test output; later calls are no-ops
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Write committed data for three symbols, return the data root
fn seed_collector(root: &Path) {
    init_tracing();
    let mut config = CollectorConfig::new(root);
    config.wal.sync_mode = SyncMode::EveryWrite;
    config.orchestrator.flush_threshold = 1000;

    let collector = MarketDataCollector::open(config).unwrap();
    for symbol in ["SPY", "QQQ", "IWM"] {
        for i in 0..10 {
            collector.append(&trade(symbol, i)).unwrap();
        }
    }
    collector.flush().unwrap();
    collector.shutdown().unwrap();
}

fn packager(root: &Path) -> ArchivePackager {
    ArchivePackager::new(root, root.join("wal"), PackagerConfig::default())
}

/// Property: extract(create(files)) == files, byte for byte
#[test]
fn package_roundtrip_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    seed_collector(dir.path());
    let dest = dir.path().join("out/pkg.zip");

    let info = packager(dir.path())
        .create("roundtrip", &PackageFilter::all(), &dest)
        .unwrap();
    assert_eq!(info.file_count, 3);
    assert_eq!(info.symbols, vec!["IWM", "QQQ", "SPY"]);

    let target = dir.path().join("extracted");
    let report = ArchivePackager::extract(&dest, &target).unwrap();
    assert!(report.verify.is_valid, "errors: {:?}", report.verify.errors);

    for symbol in ["SPY", "QQQ", "IWM"] {
        let rel = format!("{}/2024-01-15.jsonl", symbol);
        let original = std::fs::read(dir.path().join(&rel)).unwrap();
        let extracted = std::fs::read(target.join("data").join(&rel)).unwrap();
        assert_eq!(original, extracted, "{} differs after round trip", rel);
    }
}

/// Corrupt one byte of one data entry; verify names the exact file
#[test]
fn package_verify_detects_corruption() {
    let dir = tempfile::tempdir().unwrap();
    seed_collector(dir.path());
    let dest = dir.path().join("pkg.zip");

    let filter = PackageFilter::all().with_symbols(vec![
        Symbol::parse("SPY").unwrap(),
        Symbol::parse("QQQ").unwrap(),
    ]);
    packager(dir.path()).create("verify-check", &filter, &dest).unwrap();

    // Rebuild the zip, flipping one byte inside one data entry while
    // keeping the manifest intact
    let corrupted_path = dir.path().join("pkg-corrupted.zip");
    {
        let mut src = zip::ZipArchive::new(std::fs::File::open(&dest).unwrap()).unwrap();
        let mut out = zip::ZipWriter::new(std::fs::File::create(&corrupted_path).unwrap());
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for i in 0..src.len() {
            let mut entry = src.by_index(i).unwrap();
            let name = entry.name().to_string();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).unwrap();
            if name == "data/SPY/2024-01-15.jsonl" {
                let last = bytes.len() - 1;
                bytes[last] ^= 0x20;
            }
            out.start_file(name, options).unwrap();
            out.write_all(&bytes).unwrap();
        }
        out.finish().unwrap();
    }

    let report = ArchivePackager::verify(&corrupted_path).unwrap();
    assert!(!report.is_valid);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("Checksum mismatch"));
    assert!(report.errors[0].contains("SPY/2024-01-15.jsonl"));

    // The untouched entry still verifies
    assert_eq!(report.files_checked, 2);
}

/// Property: entries with `..` components never write outside the target
#[test]
fn extraction_is_traversal_safe() {
    let dir = tempfile::tempdir().unwrap();
    let evil = dir.path().join("evil.zip");
    {
        let mut zip = zip::ZipWriter::new(std::fs::File::create(&evil).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("data/ok.jsonl", options).unwrap();
        zip.write_all(b"{}\n").unwrap();
        zip.start_file("../../escape.txt", options).unwrap();
        zip.write_all(b"escaped").unwrap();
        zip.finish().unwrap();
    }

    let target = dir.path().join("nested/target");
    let result = ArchivePackager::extract(&evil, &target);
    assert!(result.is_err());
    assert!(!dir.path().join("escape.txt").exists());
    assert!(!dir.path().join("nested/escape.txt").exists());
}

/// The manifest's declared totals and digests describe the packaged data
#[test]
fn manifest_matches_package_contents() {
    let dir = tempfile::tempdir().unwrap();
    seed_collector(dir.path());
    let dest = dir.path().join("pkg.zip");
    packager(dir.path())
        .create("manifest-check", &PackageFilter::all(), &dest)
        .unwrap();

    let mut archive = zip::ZipArchive::new(std::fs::File::open(&dest).unwrap()).unwrap();
    let manifest: marketdata_collector::PackageManifest = {
        let mut entry = archive.by_name("manifest.json").unwrap();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    };

    assert_eq!(manifest.package_name, "manifest-check");
    assert_eq!(manifest.totals.file_count, 3);
    assert_eq!(manifest.files.len(), 3);
    let total: u64 = manifest.files.iter().map(|f| f.size_bytes).sum();
    assert_eq!(manifest.totals.total_bytes, total);
    for file in &manifest.files {
        assert_eq!(file.sha256.len(), 64);
    }
}

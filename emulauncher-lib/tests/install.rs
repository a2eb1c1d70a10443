#![cfg(unix)]

mod common;

use common::{write_xz, write_zstd, Entry};
use emulauncher_lib::installer::STAMP_FILE;
use emulauncher_lib::{ArchiveExtractor, Config, EmulatorError, ProgressFn, RuntimeInstaller};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::{tempdir, TempDir};

const BOX64: &[u8] = b"#!/bin/sh\nexec \"$@\"\n";
const WINE: &[u8] = b"#!/bin/sh\nexit 0\n";

fn config_with_assets() -> (TempDir, Config) {
    let dir = tempdir().unwrap();
    let config = Config::with_data_dir(dir.path());
    std::fs::create_dir_all(config.translation_archive.parent().unwrap()).unwrap();

    write_zstd(
        &config.translation_archive,
        &[
            Entry::File { name: "box64", mode: 0o755, data: BOX64 },
            Entry::File { name: "box64rc", mode: 0o644, data: b"[default]\n" },
        ],
    );
    write_xz(
        &config.runtime_archive,
        &[
            Entry::Dir { name: "bin" },
            Entry::File { name: "bin/wine", mode: 0o755, data: WINE },
            Entry::File { name: "lib/wine/ntdll.so", mode: 0o644, data: b"ntdll" },
        ],
    );
    (dir, config)
}

#[tokio::test]
async fn installs_once_then_skips() {
    let (_dir, config) = config_with_assets();
    let installer = RuntimeInstaller::new(&config, ArchiveExtractor::new());

    let first = installer.ensure_installed(None).await.unwrap();
    assert!(first.translation.was_extracted());
    assert!(first.runtime.was_extracted());
    assert!(installer.layout().is_installed());
    assert!(installer.layout().translation_dir().join(STAMP_FILE).is_file());

    let second = installer.ensure_installed(None).await.unwrap();
    assert!(!second.translation.was_extracted());
    assert!(!second.runtime.was_extracted());
}

#[tokio::test]
async fn changed_asset_is_reextracted() {
    let (_dir, config) = config_with_assets();
    let installer = RuntimeInstaller::new(&config, ArchiveExtractor::new());
    installer.ensure_installed(None).await.unwrap();

    let stale = installer.layout().runtime_dir().join("lib/wine/ntdll.so");
    assert!(stale.is_file());
    write_xz(
        &config.runtime_archive,
        &[Entry::File { name: "bin/wine", mode: 0o755, data: b"#!/bin/sh\nexit 1\n" }],
    );

    let report = installer.ensure_installed(None).await.unwrap();
    assert!(!report.translation.was_extracted());
    assert!(report.runtime.was_extracted());
    assert!(!stale.exists());
}

#[tokio::test]
async fn missing_binary_triggers_reinstall() {
    let (_dir, config) = config_with_assets();
    let installer = RuntimeInstaller::new(&config, ArchiveExtractor::new());
    installer.ensure_installed(None).await.unwrap();

    std::fs::remove_file(installer.layout().translation_binary()).unwrap();
    let report = installer.ensure_installed(None).await.unwrap();
    assert!(report.translation.was_extracted());
    assert!(installer.layout().is_installed());
}

#[tokio::test]
async fn installed_tree_survives_removed_archives() {
    let (_dir, config) = config_with_assets();
    let installer = RuntimeInstaller::new(&config, ArchiveExtractor::new());
    installer.ensure_installed(None).await.unwrap();

    std::fs::remove_file(&config.translation_archive).unwrap();
    std::fs::remove_file(&config.runtime_archive).unwrap();

    let report = installer.ensure_installed(None).await.unwrap();
    assert!(!report.translation.was_extracted());
    assert!(!report.runtime.was_extracted());
    assert!(installer.layout().is_installed());
}

#[tokio::test]
async fn removed_archive_without_install_fails() {
    let (_dir, config) = config_with_assets();
    std::fs::remove_file(&config.runtime_archive).unwrap();
    let installer = RuntimeInstaller::new(&config, ArchiveExtractor::new());

    let err = installer.ensure_installed(None).await.unwrap_err();
    assert!(matches!(err, EmulatorError::Extraction { .. }));
}

#[tokio::test]
async fn touched_archive_with_same_content_is_not_reextracted() {
    let (_dir, config) = config_with_assets();
    let installer = RuntimeInstaller::new(&config, ArchiveExtractor::new());
    installer.ensure_installed(None).await.unwrap();

    let stamp_path = installer.layout().runtime_dir().join(STAMP_FILE);
    let before = std::fs::read_to_string(&stamp_path).unwrap();
    std::fs::File::options()
        .write(true)
        .open(&config.runtime_archive)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();

    let report = installer.ensure_installed(None).await.unwrap();
    assert!(!report.runtime.was_extracted());
    let after = std::fs::read_to_string(&stamp_path).unwrap();
    assert_eq!(before.lines().next(), after.lines().next());
    assert_ne!(before, after);
}

#[tokio::test]
async fn concurrent_installs_extract_once() {
    let (_dir, config) = config_with_assets();
    let installer = Arc::new(RuntimeInstaller::new(&config, ArchiveExtractor::new()));

    let (a, b) = tokio::join!(
        installer.ensure_installed(None),
        installer.ensure_installed(None)
    );
    let reports = [a.unwrap(), b.unwrap()];
    let extracted = reports
        .iter()
        .filter(|r| r.translation.was_extracted())
        .count();
    assert_eq!(extracted, 1);
}

#[tokio::test]
async fn progress_spans_both_assets() {
    let (_dir, config) = config_with_assets();
    let installer = RuntimeInstaller::new(&config, ArchiveExtractor::new());
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let progress: ProgressFn = Arc::new(move |fraction: f32, _: &str| {
        sink.lock().unwrap().push(fraction);
    });

    installer.ensure_installed(Some(progress)).await.unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|f| *f > 0.0 && *f <= 0.5));
    assert!(seen.iter().any(|f| *f > 0.5));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
    assert_eq!(*seen.last().unwrap(), 1.0);
}

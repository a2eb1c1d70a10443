//! Lazy installation of the translation layer and compatibility runtime
//!
//! Each asset directory carries a stamp holding the SHA-256 of the archive it
//! was unpacked from; a matching stamp skips extraction. An installed asset
//! whose archive is no longer shipped stays in place.

use crate::archive::{
    ArchiveExtractor, Codec, CompressedArchive, ExtractedRoot, ExtractionTarget, ProgressFn,
};
use crate::config::Config;
use crate::error::{EmulatorError, Result};
use crate::layout::{is_executable, RuntimeLayout};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info};

/// Stamp file written into every extracted asset directory
pub const STAMP_FILE: &str = ".emulauncher-stamp";

/// One archive and the directory it unpacks into
#[derive(Debug, Clone)]
pub struct RuntimeAsset {
    pub name: &'static str,
    pub archive: CompressedArchive,
    pub target: PathBuf,
    /// Binary that must exist for the asset to count as installed
    pub binary: PathBuf,
}

impl RuntimeAsset {
    fn stamp_path(&self) -> PathBuf {
        self.target.join(STAMP_FILE)
    }

    fn read_stamp(&self) -> Option<Stamp> {
        let text = std::fs::read_to_string(self.stamp_path()).ok()?;
        Stamp::parse(&text)
    }

    fn is_installed(&self) -> bool {
        self.read_stamp().is_some() && is_executable(&self.binary)
    }
}

/// Contents of [`STAMP_FILE`]: archive digest plus the size and mtime it was hashed at
#[derive(Debug, Clone, PartialEq, Eq)]
struct Stamp {
    digest: String,
    fingerprint: Option<String>,
}

impl Stamp {
    fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines().map(str::trim);
        let digest = lines.next().filter(|d| !d.is_empty())?.to_string();
        let fingerprint = lines.next().filter(|f| !f.is_empty()).map(str::to_string);
        Some(Self {
            digest,
            fingerprint,
        })
    }

    fn render(&self) -> String {
        match &self.fingerprint {
            Some(fingerprint) => format!("{}\n{}\n", self.digest, fingerprint),
            None => format!("{}\n", self.digest),
        }
    }
}

/// Size and modification time of an archive, `None` when the mtime is unavailable
fn fingerprint(path: &Path) -> Result<Option<String>> {
    let metadata = std::fs::metadata(path)?;
    let fingerprint = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|t| format!("{}:{}", metadata.len(), t.as_nanos()));
    Ok(fingerprint)
}

/// What happened to one asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetOutcome {
    UpToDate,
    Extracted(ExtractedRoot),
}

impl AssetOutcome {
    pub fn was_extracted(&self) -> bool {
        matches!(self, AssetOutcome::Extracted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub translation: AssetOutcome,
    pub runtime: AssetOutcome,
}

/// Installs both runtime assets, one caller at a time
#[derive(Debug)]
pub struct RuntimeInstaller {
    layout: RuntimeLayout,
    translation_archive: PathBuf,
    runtime_archive: PathBuf,
    extractor: ArchiveExtractor,
    lock: tokio::sync::Mutex<()>,
}

impl RuntimeInstaller {
    pub fn new(config: &Config, extractor: ArchiveExtractor) -> Self {
        Self {
            layout: config.layout(),
            translation_archive: config.translation_archive.clone(),
            runtime_archive: config.runtime_archive.clone(),
            extractor,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    fn assets(&self) -> [RuntimeAsset; 2] {
        [
            RuntimeAsset {
                name: "translation layer",
                archive: archive_for(&self.translation_archive, Codec::Zstd),
                target: self.layout.translation_dir(),
                binary: self.layout.translation_binary(),
            },
            RuntimeAsset {
                name: "compatibility runtime",
                archive: archive_for(&self.runtime_archive, Codec::Xz),
                target: self.layout.runtime_dir(),
                binary: self.layout.runtime_binary(),
            },
        ]
    }

    /// Make sure both assets are extracted and current.
    ///
    /// Concurrent callers wait for the first one and then find the stamps in place.
    pub async fn ensure_installed(&self, progress: Option<ProgressFn>) -> Result<InstallReport> {
        let _guard = self.lock.lock().await;

        let [translation, runtime] = self.assets();
        let translation = self.install_asset(&translation, 0, progress.clone()).await?;
        let runtime = self.install_asset(&runtime, 1, progress.clone()).await?;

        self.layout.verify()?;
        if let Some(progress) = progress {
            progress(1.0, "Runtime ready");
        }
        Ok(InstallReport {
            translation,
            runtime,
        })
    }

    async fn install_asset(
        &self,
        asset: &RuntimeAsset,
        index: usize,
        progress: Option<ProgressFn>,
    ) -> Result<AssetOutcome> {
        let source = asset.archive.source.clone();
        let offset = index as f32 * 0.5;
        let up_to_date = |reason: &str| {
            debug!("{} is up to date ({})", asset.name, reason);
            if let Some(ref progress) = progress {
                progress(offset + 0.5, &format!("{} up to date", asset.name));
            }
            Ok(AssetOutcome::UpToDate)
        };

        if !source.is_file() {
            if asset.is_installed() {
                return up_to_date("archive not shipped, keeping installed tree");
            }
            return Err(EmulatorError::extraction(&source, "archive not found"));
        }

        let stamp = asset.read_stamp();
        let current_fingerprint = fingerprint(&source)?;
        if let Some(ref stamp) = stamp {
            if current_fingerprint.is_some()
                && stamp.fingerprint == current_fingerprint
                && is_executable(&asset.binary)
            {
                return up_to_date(&stamp.digest);
            }
        }

        let digest = tokio::task::spawn_blocking({
            let source = source.clone();
            move || sha256_file(&source)
        })
        .await
        .map_err(|e| EmulatorError::extraction(&source, e))??;

        let fresh = Stamp {
            digest,
            fingerprint: current_fingerprint,
        };
        if let Some(stamp) = stamp {
            if stamp.digest == fresh.digest && is_executable(&asset.binary) {
                // Same content under a new mtime (copied or touched)
                std::fs::write(asset.stamp_path(), fresh.render())?;
                return up_to_date(&fresh.digest);
            }
        }

        info!("Installing {} from {:?}", asset.name, source);
        // Drop leftovers of an older asset version
        if asset.target.exists() {
            std::fs::remove_dir_all(&asset.target)?;
        }

        let mut target = ExtractionTarget::new(&asset.target);
        if let Some(progress) = progress {
            let scaled: ProgressFn = Arc::new(move |fraction: f32, message: &str| {
                progress(offset + fraction * 0.5, message)
            });
            target = target.with_progress(scaled);
        }

        let root = self
            .extractor
            .extract_async(asset.archive.clone(), target)
            .await?;
        std::fs::write(asset.stamp_path(), fresh.render())?;

        info!(
            "Installed {}: {} files, {} bytes, {} entries skipped",
            asset.name,
            root.files,
            root.bytes_written,
            root.skipped()
        );
        Ok(AssetOutcome::Extracted(root))
    }
}

/// Archive reference, preferring the codec implied by the file name
fn archive_for(path: &Path, fallback: Codec) -> CompressedArchive {
    let codec = Codec::from_path(path).unwrap_or(fallback);
    CompressedArchive::new(path, codec)
}

/// SHA-256 of a file as lowercase hex
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = std::fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sha256_matches_known_digest() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("abc");
        std::fs::write(&file, b"abc").unwrap();
        assert_eq!(
            sha256_file(&file).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn stamp_reads_digest_and_fingerprint() {
        let stamp = Stamp::parse("abc123\n42:1700000000\n").unwrap();
        assert_eq!(stamp.digest, "abc123");
        assert_eq!(stamp.fingerprint.as_deref(), Some("42:1700000000"));
        assert_eq!(Stamp::parse(&stamp.render()), Some(stamp));

        let legacy = Stamp::parse("abc123\n").unwrap();
        assert_eq!(legacy.fingerprint, None);
        assert_eq!(Stamp::parse("\n"), None);
    }

    #[test]
    fn archive_codec_follows_extension() {
        assert_eq!(archive_for(Path::new("/a/wine.txz"), Codec::Zstd).codec, Codec::Xz);
        assert_eq!(archive_for(Path::new("/a/box64.bin"), Codec::Zstd).codec, Codec::Zstd);
    }

    #[tokio::test]
    async fn missing_archive_is_an_extraction_failure() {
        let dir = tempdir().unwrap();
        let config = Config::with_data_dir(dir.path());
        let installer = RuntimeInstaller::new(&config, ArchiveExtractor::new());

        let err = installer.ensure_installed(None).await.unwrap_err();
        assert!(matches!(err, EmulatorError::Extraction { .. }));
        assert!(err.is_retryable());
    }
}

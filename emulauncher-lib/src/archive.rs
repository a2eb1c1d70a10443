//! Secure extraction of compressed tar archives
//!
//! The translation layer ships as a zstd-compressed tar (`.tzst`) and the
//! compatibility runtime as an xz/LZMA2-compressed tar (`.txz`). Both are
//! unpacked entry by entry into a target directory. Entries that would land
//! outside the target are skipped, symlinks are never recreated, and execute
//! bits are carried over from the entry's Unix mode.

use crate::error::{EmulatorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Fixed copy buffer used for entry data
pub const COPY_BUFFER_SIZE: usize = 8 * 1024;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const XZ_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];

/// Compression codec wrapping the tar stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Fast dictionary/frame codec (zstd)
    Zstd,
    /// High-ratio LZMA2 codec (xz container)
    Xz,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Zstd => "zstd",
            Codec::Xz => "xz",
        }
    }

    /// Detect the codec from a file name (`.tzst`, `.tar.zst`, `.txz`, `.tar.xz`)
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| match ext.to_lowercase().as_str() {
                "tzst" | "zst" => Some(Codec::Zstd),
                "txz" | "xz" => Some(Codec::Xz),
                _ => None,
            })
    }

    /// Detect the codec from the first bytes of a file
    pub fn from_magic_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&ZSTD_MAGIC) {
            return Some(Codec::Zstd);
        }
        if bytes.starts_with(&XZ_MAGIC) {
            return Some(Codec::Xz);
        }
        None
    }
}

impl FromStr for Codec {
    type Err = EmulatorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fast" | "zstd" | "zst" | "tzst" => Ok(Codec::Zstd),
            "lzma2" | "lzma" | "xz" | "txz" => Ok(Codec::Xz),
            _ => Err(EmulatorError::Config(format!("Unknown archive codec: {}", s))),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only reference to a compressed tar archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedArchive {
    pub source: PathBuf,
    pub codec: Codec,
    /// Decompressed payload size, when known; drives progress reporting
    pub expected_size: Option<u64>,
}

impl CompressedArchive {
    pub fn new(source: impl Into<PathBuf>, codec: Codec) -> Self {
        Self {
            source: source.into(),
            codec,
            expected_size: None,
        }
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    /// Build an archive reference, detecting the codec from the extension or magic bytes
    pub fn detect(source: impl Into<PathBuf>) -> Result<Self> {
        let source = source.into();
        if let Some(codec) = Codec::from_path(&source) {
            return Ok(Self::new(source, codec));
        }

        let mut magic = [0u8; 6];
        let mut file = File::open(&source)?;
        let read = file.read(&mut magic)?;
        match Codec::from_magic_bytes(&magic[..read]) {
            Some(codec) => Ok(Self::new(source, codec)),
            None => Err(EmulatorError::extraction(
                source,
                "unrecognized compression format",
            )),
        }
    }
}

/// Progress sink: fraction in 0.0..=1.0 and a status line
pub type ProgressFn = Arc<dyn Fn(f32, &str) + Send + Sync>;

/// Cooperative cancellation flag, checked between archive entries
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Destination of one extraction call
#[derive(Clone)]
pub struct ExtractionTarget {
    pub directory: PathBuf,
    pub progress: Option<ProgressFn>,
    pub cancel: Option<CancelFlag>,
}

impl ExtractionTarget {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            progress: None,
            cancel: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn report(&self, fraction: f32, message: &str) {
        if let Some(ref progress) = self.progress {
            progress(fraction.clamp(0.0, 1.0), message);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled)
    }
}

impl fmt::Debug for ExtractionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionTarget")
            .field("directory", &self.directory)
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

/// Kind of a tar entry, as far as extraction cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    HardLink,
    Other,
}

/// One tar entry while it is being processed
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: PathBuf,
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    pub link_name: Option<PathBuf>,
}

impl ArchiveEntry {
    fn from_tar<R: Read>(entry: &tar::Entry<'_, R>) -> io::Result<Self> {
        let header = entry.header();
        let entry_type = header.entry_type();
        let kind = if entry_type.is_dir() {
            EntryKind::Directory
        } else if entry_type.is_symlink() {
            EntryKind::Symlink
        } else if entry_type.is_hard_link() {
            EntryKind::HardLink
        } else if entry_type.is_file()
            || entry_type.is_contiguous()
            || entry_type.is_gnu_sparse()
        {
            EntryKind::File
        } else {
            EntryKind::Other
        };

        Ok(Self {
            name: entry.path()?.into_owned(),
            kind,
            // Some archivers leave the mode field blank for synthetic entries
            mode: header.mode().unwrap_or(0o644),
            size: entry.size(),
            link_name: entry.link_name()?.map(|name| name.into_owned()),
        })
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }

    /// Any of the owner/group/other execute bits
    pub fn is_executable(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

/// Summary of a finished extraction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedRoot {
    /// Canonical target directory
    pub directory: PathBuf,
    pub files: usize,
    pub directories: usize,
    pub bytes_written: u64,
    /// Entries resolving outside the target directory
    pub skipped_unsafe: usize,
    pub skipped_symlinks: usize,
    /// Device nodes, fifos and hard links without a usable target
    pub skipped_unsupported: usize,
}

impl ExtractedRoot {
    pub fn skipped(&self) -> usize {
        self.skipped_unsafe + self.skipped_symlinks + self.skipped_unsupported
    }
}

/// Unpacks archives, refusing overlapping concurrent targets
#[derive(Debug, Clone, Default)]
pub struct ArchiveExtractor {
    active: Arc<Mutex<Vec<PathBuf>>>,
}

impl ArchiveExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract `archive` into `target` (blocking)
    pub fn extract(
        &self,
        archive: &CompressedArchive,
        target: &ExtractionTarget,
    ) -> Result<ExtractedRoot> {
        fs::create_dir_all(&target.directory)
            .map_err(|e| EmulatorError::extraction(&archive.source, e))?;
        let root = fs::canonicalize(&target.directory)
            .map_err(|e| EmulatorError::extraction(&archive.source, e))?;

        let _claim = self.claim(&root, archive)?;
        extract_into(archive, target, root)
    }

    /// Extract on the blocking pool so async callers are never stalled
    pub async fn extract_async(
        &self,
        archive: CompressedArchive,
        target: ExtractionTarget,
    ) -> Result<ExtractedRoot> {
        let extractor = self.clone();
        match tokio::task::spawn_blocking(move || extractor.extract(&archive, &target)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(EmulatorError::ExtractionCancelled),
        }
    }

    fn claim(&self, root: &Path, archive: &CompressedArchive) -> Result<TargetClaim> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(busy) = active
            .iter()
            .find(|other| other.starts_with(root) || root.starts_with(other))
        {
            return Err(EmulatorError::extraction(
                &archive.source,
                format!("target {:?} overlaps in-flight extraction into {:?}", root, busy),
            ));
        }
        active.push(root.to_path_buf());

        Ok(TargetClaim {
            active: Arc::clone(&self.active),
            root: root.to_path_buf(),
        })
    }
}

/// Releases an in-flight target when dropped
struct TargetClaim {
    active: Arc<Mutex<Vec<PathBuf>>>,
    root: PathBuf,
}

impl Drop for TargetClaim {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.retain(|path| path != &self.root);
    }
}

/// Counts compressed bytes pulled from the source file
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

fn open_decoder(archive: &CompressedArchive, consumed: Arc<AtomicU64>) -> io::Result<(Box<dyn Read>, u64)> {
    let file = File::open(&archive.source)?;
    let compressed_len = file.metadata()?.len();
    let reader = BufReader::new(CountingReader {
        inner: file,
        count: consumed,
    });

    let decoder: Box<dyn Read> = match archive.codec {
        Codec::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(reader)?),
        Codec::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(reader)),
    };
    Ok((decoder, compressed_len))
}

fn extract_into(
    archive: &CompressedArchive,
    target: &ExtractionTarget,
    root: PathBuf,
) -> Result<ExtractedRoot> {
    let fail = |e: io::Error| EmulatorError::extraction(&archive.source, e);

    info!(
        "Extracting {:?} ({}) into {:?}",
        archive.source, archive.codec, root
    );

    let consumed = Arc::new(AtomicU64::new(0));
    let (decoder, compressed_len) = open_decoder(archive, Arc::clone(&consumed)).map_err(fail)?;
    let mut tar = tar::Archive::new(decoder);

    let mut report = ExtractedRoot {
        directory: root.clone(),
        ..Default::default()
    };
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];

    for entry in tar.entries().map_err(fail)? {
        if target.is_cancelled() {
            info!("Extraction of {:?} cancelled", archive.source);
            return Err(EmulatorError::ExtractionCancelled);
        }

        let mut entry = entry.map_err(fail)?;
        let info = ArchiveEntry::from_tar(&entry).map_err(fail)?;
        extract_entry(&root, &mut entry, &info, &mut buffer, &mut report).map_err(fail)?;

        let fraction = match archive.expected_size {
            Some(total) if total > 0 => report.bytes_written as f64 / total as f64,
            _ if compressed_len > 0 => {
                consumed.load(Ordering::Relaxed) as f64 / compressed_len as f64
            }
            _ => 0.0,
        };
        target.report(fraction as f32, &format!("Extracting {}", info.name.display()));
    }

    target.report(1.0, "Extraction complete");
    info!(
        "Extracted {} files, {} directories ({} bytes) into {:?}, skipped {} entries",
        report.files,
        report.directories,
        report.bytes_written,
        report.directory,
        report.skipped()
    );
    Ok(report)
}

fn extract_entry<R: Read>(
    root: &Path,
    entry: &mut R,
    info: &ArchiveEntry,
    buffer: &mut [u8],
    report: &mut ExtractedRoot,
) -> io::Result<()> {
    let destination = match resolve_within(root, &info.name)? {
        Some(path) if path != root || info.is_dir() => path,
        _ => {
            warn!("Skipping unsafe archive entry: {:?}", info.name);
            report.skipped_unsafe += 1;
            return Ok(());
        }
    };

    match info.kind {
        EntryKind::Symlink => {
            debug!("Skipping symlink entry: {:?}", info.name);
            report.skipped_symlinks += 1;
        }
        EntryKind::Directory => {
            fs::create_dir_all(&destination)?;
            report.directories += 1;
        }
        EntryKind::File => {
            report.bytes_written += write_file(&destination, entry, info.mode, buffer)?;
            report.files += 1;
        }
        EntryKind::HardLink => {
            let source = match info.link_name.as_deref() {
                Some(link) => resolve_within(root, link)?,
                None => None,
            };
            match source {
                Some(source) if source.is_file() => {
                    if let Some(parent) = destination.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    if source != destination {
                        report.bytes_written += fs::copy(&source, &destination)?;
                    }
                    report.files += 1;
                }
                _ => {
                    warn!(
                        "Skipping hard link {:?} with unusable target {:?}",
                        info.name, info.link_name
                    );
                    report.skipped_unsupported += 1;
                }
            }
        }
        EntryKind::Other => {
            debug!("Skipping unsupported entry: {:?}", info.name);
            report.skipped_unsupported += 1;
        }
    }

    Ok(())
}

/// Stream entry bytes into `path`, overwriting it, then apply the execute bits of `mode`
fn write_file<R: Read>(path: &Path, entry: &mut R, mode: u32, buffer: &mut [u8]) -> io::Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut output = File::create(path)?;
    let mut written = 0u64;
    loop {
        let n = match entry.read(buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        output.write_all(&buffer[..n])?;
        written += n as u64;
    }
    output.flush()?;
    drop(output);

    apply_execute_bits(path, mode)?;
    Ok(written)
}

#[cfg(unix)]
fn apply_execute_bits(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    let current = permissions.mode();
    let updated = if mode & 0o111 != 0 {
        current | 0o111
    } else {
        current & !0o111
    };
    if updated != current {
        permissions.set_mode(updated);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_execute_bits(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Resolve an entry name beneath the canonical `root`.
///
/// Returns `None` when the canonical form of the result is not inside `root`,
/// including through symlinks that already exist on disk.
pub fn resolve_within(root: &Path, name: &Path) -> io::Result<Option<PathBuf>> {
    let mut candidate = root.to_path_buf();
    for component in name.components() {
        match component {
            // Absolute names are rooted at the target, like `root/name`
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !candidate.pop() {
                    return Ok(None);
                }
            }
            Component::Normal(part) => candidate.push(part),
        }
    }

    if !candidate.starts_with(root) {
        return Ok(None);
    }

    Ok(canonicalize_existing(&candidate)?
        .filter(|canonical| canonical.starts_with(root))
        .map(|_| candidate))
}

/// Canonicalize the deepest existing ancestor and re-append the rest.
/// `None` for dangling symlinks.
fn canonicalize_existing(path: &Path) -> io::Result<Option<PathBuf>> {
    let mut existing = path;
    let mut rest = Vec::new();

    loop {
        match fs::canonicalize(existing) {
            Ok(mut canonical) => {
                for part in rest.iter().rev() {
                    canonical.push(part);
                }
                return Ok(Some(canonical));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if fs::symlink_metadata(existing).is_ok() {
                    return Ok(None);
                }
                let (Some(name), Some(parent)) = (existing.file_name(), existing.parent()) else {
                    return Err(e);
                };
                rest.push(name.to_os_string());
                existing = parent;
            }
            Err(e) => return Err(e),
        }
    }
}

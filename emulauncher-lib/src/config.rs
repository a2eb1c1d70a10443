//! Configuration management for emulauncher

use crate::environment::PerformancePreset;
use crate::error::{EmulatorError, Result};
use crate::layout::RuntimeLayout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable prefix for configuration overrides (EMULAUNCHER_DATA_DIR, ...)
pub const ENV_PREFIX: &str = "EMULAUNCHER";

/// Emulauncher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// App-private data directory; the emulator tree lives in `<data_dir>/emulator`
    pub data_dir: PathBuf,

    /// Translation layer archive (zstd tar)
    pub translation_archive: PathBuf,

    /// Compatibility runtime archive (xz tar)
    pub runtime_archive: PathBuf,

    /// Preset used when a launch request does not name one
    pub default_preset: PerformancePreset,

    /// Run 32-bit guests through the 64-bit runtime (WoW64)
    pub wow64: bool,

    /// Enable translation layer logging (BOX64_LOG)
    pub translation_logs: bool,

    /// WINEDEBUG channel spec, `-all` when unset
    pub runtime_debug: Option<String>,

    /// Write child stdout/stderr to the container's logs directory
    pub capture_output: bool,

    /// Upper bound for the runtime's prefix initialization
    pub prefix_init_timeout_secs: u64,

    /// How long `launch_and_confirm` waits before checking for an early exit
    pub launch_grace_millis: u64,

    /// Verbosity level (0-2)
    #[serde(skip)]
    pub verbosity: u8,
}

impl Config {
    /// Create a new config with default paths
    pub fn new() -> Result<Self> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| EmulatorError::Config("Could not determine data directory".into()))?
            .join("emulauncher");

        Ok(Self::with_data_dir(data_dir))
    }

    /// Create a config rooted at `data_dir`, with assets expected in `<data_dir>/assets`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let assets = data_dir.join("assets");

        Self {
            translation_archive: assets.join("box64.tzst"),
            runtime_archive: assets.join("wine.txz"),
            data_dir,
            default_preset: PerformancePreset::Balanced,
            wow64: true,
            translation_logs: false,
            runtime_debug: None,
            capture_output: true,
            prefix_init_timeout_secs: 300,
            launch_grace_millis: 1500,
            verbosity: 0,
        }
    }

    /// Load configuration: defaults, then the config file, then EMULAUNCHER_* variables.
    ///
    /// An explicitly given file must exist; the default file is optional.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = Self::new()?;

        let (path, required) = match file {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::default_config_file()?, false),
        };
        debug!("Loading configuration from {:?} (required: {})", path, required);

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&defaults)?)
            .add_source(config::File::from(path.as_path()).required(required))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let mut config: Config = settings.try_deserialize()?;
        // Archive paths left at their defaults follow the loaded data directory
        let data_dir = std::mem::replace(&mut config.data_dir, defaults.data_dir);
        config.set_data_dir(data_dir);
        info!("Using data directory: {:?}", config.data_dir);
        Ok(config)
    }

    /// Default config file location (~/.config/emulauncher/config.toml)
    pub fn default_config_file() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .ok_or_else(|| EmulatorError::Config("Could not determine config directory".into()))?
            .join("emulauncher")
            .join("config.toml"))
    }

    /// Move the data directory; asset paths still at their defaults move along
    pub fn set_data_dir(&mut self, data_dir: impl Into<PathBuf>) {
        let old = Self::with_data_dir(&self.data_dir);
        let new = Self::with_data_dir(data_dir);
        if self.translation_archive == old.translation_archive {
            self.translation_archive = new.translation_archive;
        }
        if self.runtime_archive == old.runtime_archive {
            self.runtime_archive = new.runtime_archive;
        }
        self.data_dir = new.data_dir;
    }

    /// Root of the emulator tree (translation layer, runtime, containers)
    pub fn emulator_dir(&self) -> PathBuf {
        self.data_dir.join("emulator")
    }

    /// On-disk layout derived from this config
    pub fn layout(&self) -> RuntimeLayout {
        RuntimeLayout::new(self.emulator_dir())
    }

    pub fn prefix_init_timeout(&self) -> Duration {
        Duration::from_secs(self.prefix_init_timeout_secs)
    }

    pub fn launch_grace(&self) -> Duration {
        Duration::from_millis(self.launch_grace_millis)
    }

    /// Ensure directories exist
    pub fn ensure_dirs(&self) -> Result<()> {
        let layout = self.layout();
        std::fs::create_dir_all(layout.translation_dir())?;
        std::fs::create_dir_all(layout.runtime_dir())?;
        std::fs::create_dir_all(layout.containers_dir())?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_data_dir(std::env::temp_dir().join("emulauncher")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn assets_default_under_data_dir() {
        let config = Config::with_data_dir("/data/app");
        assert_eq!(config.translation_archive, Path::new("/data/app/assets/box64.tzst"));
        assert_eq!(config.runtime_archive, Path::new("/data/app/assets/wine.txz"));
        assert_eq!(config.emulator_dir(), Path::new("/data/app/emulator"));
        assert_eq!(config.default_preset, PerformancePreset::Balanced);
    }

    #[test]
    fn set_data_dir_keeps_custom_archives() {
        let mut config = Config::with_data_dir("/data/app");
        config.runtime_archive = PathBuf::from("/opt/wine.txz");
        config.set_data_dir("/mnt/sd");

        assert_eq!(config.data_dir, Path::new("/mnt/sd"));
        assert_eq!(config.translation_archive, Path::new("/mnt/sd/assets/box64.tzst"));
        assert_eq!(config.runtime_archive, Path::new("/opt/wine.txz"));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("config.toml");
        let data_dir = dir.path().join("data");
        std::fs::write(
            &file,
            format!(
                "data_dir = {:?}\ndefault_preset = \"maximum_stability\"\ncapture_output = false\n",
                data_dir.to_string_lossy()
            ),
        )
        .unwrap();

        let config = Config::load(Some(&file)).unwrap();
        assert_eq!(config.data_dir, data_dir);
        assert_eq!(config.default_preset, PerformancePreset::MaximumStability);
        assert!(!config.capture_output);
        assert!(config.wow64);
        assert!(config.translation_archive.starts_with(&data_dir));
        assert!(config.runtime_archive.starts_with(&data_dir));
    }

    #[test]
    fn load_keeps_explicit_archive_paths() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("config.toml");
        let data_dir = dir.path().join("data");
        let runtime = dir.path().join("packaged/wine.txz");
        std::fs::write(
            &file,
            format!(
                "data_dir = {:?}\nruntime_archive = {:?}\n",
                data_dir.to_string_lossy(),
                runtime.to_string_lossy()
            ),
        )
        .unwrap();

        let config = Config::load(Some(&file)).unwrap();
        assert_eq!(config.translation_archive, data_dir.join("assets/box64.tzst"));
        assert_eq!(config.runtime_archive, runtime);
    }

    #[test]
    fn load_fails_for_missing_explicit_file() {
        let dir = tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, EmulatorError::ConfigSource(_)));
    }

    #[test]
    fn ensure_dirs_creates_layout_roots() {
        let dir = tempdir().unwrap();
        let config = Config::with_data_dir(dir.path());
        config.ensure_dirs().unwrap();

        let layout = config.layout();
        assert!(layout.translation_dir().is_dir());
        assert!(layout.runtime_dir().is_dir());
        assert!(layout.containers_dir().is_dir());
    }
}

//! On-disk layout of the emulator tree
//!
//! ```text
//! <data-dir>/emulator/
//!   translation-layer/box64
//!   runtime/bin/wine
//!   containers/<container-id>/drive_root/{system, program, user}
//! ```
//!
//! The layout is persisted state and must stay stable across upgrades.

use crate::error::{EmulatorError, Result};
use std::path::{Path, PathBuf};

/// Directory holding the translation layer binary and its config files
pub const TRANSLATION_DIR: &str = "translation-layer";

/// Directory holding the compatibility runtime tree
pub const RUNTIME_DIR: &str = "runtime";

/// Directory holding one subdirectory per container
pub const CONTAINERS_DIR: &str = "containers";

/// Translation layer binary, relative to the translation directory
pub const TRANSLATION_BINARY: &str = "box64";

/// Compatibility runtime entry binary, relative to the runtime directory
pub const RUNTIME_BINARY: &str = "bin/wine";

/// Paths of the materialized runtimes and the containers root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    root: PathBuf,
}

impl RuntimeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn translation_dir(&self) -> PathBuf {
        self.root.join(TRANSLATION_DIR)
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join(RUNTIME_DIR)
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join(CONTAINERS_DIR)
    }

    pub fn translation_binary(&self) -> PathBuf {
        self.translation_dir().join(TRANSLATION_BINARY)
    }

    pub fn runtime_binary(&self) -> PathBuf {
        self.runtime_dir().join(RUNTIME_BINARY)
    }

    pub fn runtime_bin_dir(&self) -> PathBuf {
        self.runtime_dir().join("bin")
    }

    pub fn runtime_lib_dir(&self) -> PathBuf {
        self.runtime_dir().join("lib")
    }

    /// Check that both binaries needed for a launch are present and executable
    pub fn verify(&self) -> Result<()> {
        for binary in [self.translation_binary(), self.runtime_binary()] {
            if !is_executable(&binary) {
                return Err(EmulatorError::RuntimeNotInitialized { missing: binary });
            }
        }
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.verify().is_ok()
    }
}

/// Regular file with at least one execute bit set
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn paths_follow_documented_layout() {
        let layout = RuntimeLayout::new("/data/emulator");
        assert_eq!(layout.translation_binary(), Path::new("/data/emulator/translation-layer/box64"));
        assert_eq!(layout.runtime_binary(), Path::new("/data/emulator/runtime/bin/wine"));
        assert_eq!(layout.containers_dir(), Path::new("/data/emulator/containers"));
    }

    #[test]
    fn verify_reports_first_missing_binary() {
        let dir = tempdir().unwrap();
        let layout = RuntimeLayout::new(dir.path());

        match layout.verify() {
            Err(EmulatorError::RuntimeNotInitialized { missing }) => {
                assert_eq!(missing, layout.translation_binary())
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn verify_requires_execute_bit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let layout = RuntimeLayout::new(dir.path());
        for binary in [layout.translation_binary(), layout.runtime_binary()] {
            std::fs::create_dir_all(binary.parent().unwrap()).unwrap();
            std::fs::write(&binary, b"#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o644)).unwrap();
        }
        assert!(!layout.is_installed());

        for binary in [layout.translation_binary(), layout.runtime_binary()] {
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        assert!(layout.is_installed());
    }
}

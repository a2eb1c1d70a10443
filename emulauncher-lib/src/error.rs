//! Error types for emulauncher

use std::path::PathBuf;
use thiserror::Error;

/// Emulauncher result type
pub type Result<T> = std::result::Result<T, EmulatorError>;

/// Main error type for environment provisioning operations
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Extraction of {archive:?} failed: {reason}")]
    Extraction { archive: PathBuf, reason: String },

    #[error("Extraction cancelled")]
    ExtractionCancelled,

    #[error("Runtime not initialized: {missing:?} is missing or not executable")]
    RuntimeNotInitialized { missing: PathBuf },

    #[error("Container conflict on {id}: {reason}")]
    ContainerConflict { id: String, reason: String },

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Invalid container id: {0}")]
    InvalidContainerId(String),

    #[error("Invalid executable: {0:?}")]
    InvalidExecutable(PathBuf),

    #[error("Prefix initialization failed for {id}: {reason}")]
    PrefixInitialization { id: String, reason: String },

    #[error("Process spawn failed: {command} - {error}")]
    ProcessSpawn { command: String, error: String },

    #[error("{executable:?} exited immediately (exit code: {code:?})")]
    ExitedImmediately {
        executable: PathBuf,
        code: Option<i32>,
    },
}

/// Stable error codes reported across the subsystem boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Io,
    Configuration,
    ExtractionFailure,
    ExtractionCancelled,
    RuntimeNotInitialized,
    ContainerConflict,
    ContainerNotFound,
    InvalidRequest,
    PrefixInitialization,
    ProcessSpawnFailure,
    ExitedImmediately,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Io => "io_error",
            ErrorCode::Configuration => "configuration_error",
            ErrorCode::ExtractionFailure => "extraction_failure",
            ErrorCode::ExtractionCancelled => "extraction_cancelled",
            ErrorCode::RuntimeNotInitialized => "runtime_not_initialized",
            ErrorCode::ContainerConflict => "container_conflict",
            ErrorCode::ContainerNotFound => "container_not_found",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::PrefixInitialization => "prefix_initialization_failure",
            ErrorCode::ProcessSpawnFailure => "process_spawn_failure",
            ErrorCode::ExitedImmediately => "exited_immediately",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EmulatorError {
    /// Code the caller can branch on (e.g. trigger re-initialization)
    pub fn code(&self) -> ErrorCode {
        match self {
            EmulatorError::Io(_) => ErrorCode::Io,
            EmulatorError::Config(_)
            | EmulatorError::ConfigSource(_)
            | EmulatorError::Json(_) => ErrorCode::Configuration,
            EmulatorError::Extraction { .. } => ErrorCode::ExtractionFailure,
            EmulatorError::ExtractionCancelled => ErrorCode::ExtractionCancelled,
            EmulatorError::RuntimeNotInitialized { .. } => ErrorCode::RuntimeNotInitialized,
            EmulatorError::ContainerConflict { .. } => ErrorCode::ContainerConflict,
            EmulatorError::ContainerNotFound(_) => ErrorCode::ContainerNotFound,
            EmulatorError::InvalidContainerId(_) | EmulatorError::InvalidExecutable(_) => {
                ErrorCode::InvalidRequest
            }
            EmulatorError::PrefixInitialization { .. } => ErrorCode::PrefixInitialization,
            EmulatorError::ProcessSpawn { .. } => ErrorCode::ProcessSpawnFailure,
            EmulatorError::ExitedImmediately { .. } => ErrorCode::ExitedImmediately,
        }
    }

    /// Whether retrying the same request can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::ExtractionFailure
                | ErrorCode::ExtractionCancelled
                | ErrorCode::RuntimeNotInitialized
                | ErrorCode::PrefixInitialization
                | ErrorCode::Io
        )
    }

    pub(crate) fn extraction(archive: impl Into<PathBuf>, reason: impl ToString) -> Self {
        EmulatorError::Extraction {
            archive: archive.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_not_initialized_has_distinct_code() {
        let err = EmulatorError::RuntimeNotInitialized {
            missing: PathBuf::from("/data/emulator/runtime/bin/wine"),
        };
        assert_eq!(err.code(), ErrorCode::RuntimeNotInitialized);
        assert_eq!(err.code().as_str(), "runtime_not_initialized");
        assert!(err.is_retryable());

        let spawn = EmulatorError::ProcessSpawn {
            command: "box64".into(),
            error: "Permission denied".into(),
        };
        assert_eq!(spawn.code(), ErrorCode::ProcessSpawnFailure);
        assert!(!spawn.is_retryable());
    }

    #[test]
    fn extraction_errors_are_retryable() {
        let err = EmulatorError::extraction("/tmp/runtime.txz", "corrupt stream");
        assert_eq!(err.code(), ErrorCode::ExtractionFailure);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("corrupt stream"));
    }
}

//! Emulauncher Library
//!
//! Provisions the environment for running x86-64 guest executables on ARM64
//! hosts: unpacks the translation layer and compatibility runtime, detects
//! the host GPU/CPU, composes launch environments, manages isolated
//! containers and launches guest processes.

pub mod archive;
pub mod capability;
pub mod config;
pub mod container;
pub mod context;
pub mod environment;
pub mod error;
pub mod installer;
pub mod launcher;
pub mod layout;
pub mod process;

pub use archive::{
    ArchiveExtractor, CancelFlag, Codec, CompressedArchive, ExtractedRoot, ExtractionTarget,
    ProgressFn,
};
pub use capability::{CapabilitySource, DeviceCapability, GpuFamily, HostCapabilitySource};
pub use config::Config;
pub use container::{
    ContainerConfig, ContainerId, ContainerLease, ContainerManager, ContainerRequest,
    EmulatorContainer, ResetConfirmation,
};
pub use context::{Emulator, LaunchRequest};
pub use environment::{EnvironmentVariableSet, PerformancePreset};
pub use error::{EmulatorError, ErrorCode, Result};
pub use installer::{InstallReport, RuntimeInstaller};
pub use launcher::ProcessLauncher;
pub use layout::RuntimeLayout;
pub use process::{EmulatorProcess, ProcessRegistry, ProcessStatus};

//! Application-lifetime context tying the components together

use crate::archive::{ArchiveExtractor, ProgressFn};
use crate::capability::{self, CapabilitySource, DeviceCapability, HostCapabilitySource};
use crate::config::Config;
use crate::container::{
    ContainerConfig, ContainerId, ContainerManager, EmulatorContainer, ResetConfirmation,
};
use crate::environment::{self, ComposeOptions, EnvironmentVariableSet, PerformancePreset};
use crate::error::{EmulatorError, Result};
use crate::installer::{InstallReport, RuntimeInstaller};
use crate::launcher::ProcessLauncher;
use crate::layout::RuntimeLayout;
use crate::process::{EmulatorProcess, ProcessRegistry};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// A request to run a guest executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Target container; the shared container when `None`
    pub container_id: Option<ContainerId>,
    /// Absolute path of the guest executable
    pub executable_path: PathBuf,
    pub args: Vec<String>,
    /// Preset override; the configured default when `None`
    pub preset: Option<PerformancePreset>,
}

impl LaunchRequest {
    pub fn new(executable_path: impl Into<PathBuf>) -> Self {
        Self {
            container_id: None,
            executable_path: executable_path.into(),
            args: Vec::new(),
            preset: None,
        }
    }

    pub fn in_container(mut self, id: ContainerId) -> Self {
        self.container_id = Some(id);
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_preset(mut self, preset: PerformancePreset) -> Self {
        self.preset = Some(preset);
        self
    }
}

/// Emulator context
pub struct Emulator {
    config: Config,
    layout: RuntimeLayout,
    capability: OnceLock<DeviceCapability>,
    capability_source: Box<dyn CapabilitySource>,
    installer: RuntimeInstaller,
    containers: ContainerManager,
    launcher: Arc<ProcessLauncher>,
}

impl Emulator {
    /// Create a context that probes the host for device capabilities
    pub fn new(config: Config) -> Self {
        Self::with_capability_source(config, Box::new(HostCapabilitySource::new()))
    }

    pub fn with_capability_source(config: Config, source: Box<dyn CapabilitySource>) -> Self {
        let layout = config.layout();
        let registry = Arc::new(ProcessRegistry::new());
        let launcher = Arc::new(
            ProcessLauncher::new(layout.clone(), registry).with_capture_output(config.capture_output),
        );
        let installer = RuntimeInstaller::new(&config, ArchiveExtractor::new());
        let containers = ContainerManager::new(launcher.clone(), config.prefix_init_timeout());

        Self {
            config,
            layout,
            capability: OnceLock::new(),
            capability_source: source,
            installer,
            containers,
            launcher,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        self.launcher.registry()
    }

    /// Install the translation layer and runtime if missing or outdated
    pub async fn initialize(&self, progress: Option<ProgressFn>) -> Result<InstallReport> {
        self.config.ensure_dirs()?;
        self.installer.ensure_installed(progress).await
    }

    /// Device capabilities, detected on first use
    pub fn capability(&self) -> &DeviceCapability {
        self.capability
            .get_or_init(|| capability::detect(self.capability_source.as_ref()))
    }

    fn compose_options(&self) -> ComposeOptions {
        ComposeOptions {
            wow64: self.config.wow64,
            translation_logs: self.config.translation_logs,
            runtime_debug: self.config.runtime_debug.clone(),
        }
    }

    /// Launch environment for `container` under `preset`
    pub fn compose_for(
        &self,
        preset: PerformancePreset,
        container: &EmulatorContainer,
    ) -> EnvironmentVariableSet {
        environment::compose_with(
            preset,
            self.capability(),
            container.overrides(),
            &self.compose_options(),
        )
    }

    pub async fn create_container(&self, config: ContainerConfig) -> Result<EmulatorContainer> {
        self.containers.create_container(config).await
    }

    pub fn get_container(&self, id: &ContainerId) -> Result<EmulatorContainer> {
        self.containers.get_container(id)
    }

    pub fn list_containers(&self) -> Result<Vec<EmulatorContainer>> {
        self.containers.list_containers()
    }

    pub async fn delete_container(&self, id: &ContainerId) -> Result<()> {
        self.containers.delete_container(id).await
    }

    pub async fn reset_container(
        &self,
        id: &ContainerId,
        confirmation: ResetConfirmation,
    ) -> Result<EmulatorContainer> {
        self.containers.reset_container(id, confirmation).await
    }

    pub fn disk_usage(&self, id: &ContainerId) -> Result<u64> {
        self.containers.disk_usage(id)
    }

    fn prepare(&self, request: &LaunchRequest) -> Result<()> {
        let exe = &request.executable_path;
        if !exe.is_absolute() || !exe.is_file() {
            return Err(EmulatorError::InvalidExecutable(exe.clone()));
        }
        self.layout.verify()
    }

    /// Spawn under the container's lease; the lease is released once the handle is registered
    async fn spawn(&self, request: &LaunchRequest) -> Result<Arc<EmulatorProcess>> {
        self.prepare(request)?;
        let lease = self.containers.lease(request.container_id.as_ref()).await?;
        let container = lease.container();
        let preset = request.preset.unwrap_or(self.config.default_preset);
        let env = self.compose_for(preset, container);
        debug!("Launching with preset {} ({} variables)", preset, env.len());

        self.launcher
            .launch(container, &request.executable_path, &request.args, &env)
    }

    /// Launch without waiting for the process
    pub async fn launch(&self, request: LaunchRequest) -> Result<Arc<EmulatorProcess>> {
        self.spawn(&request).await
    }

    /// Launch and fail with `ExitedImmediately` if the process dies within the grace period
    pub async fn launch_and_confirm(&self, request: LaunchRequest) -> Result<Arc<EmulatorProcess>> {
        let process = self.spawn(&request).await?;
        self.launcher
            .confirm(process, self.config.launch_grace())
            .await
    }
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("layout", &self.layout)
            .field("capability", &self.capability.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{GpuFamily, Probe};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Reports an Adreno GPU and counts probe reads
    struct CountingSource(Arc<AtomicUsize>);

    impl CapabilitySource for CountingSource {
        fn read(&self, probe: Probe) -> io::Result<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            match probe {
                Probe::KgslGpuModel => Ok("Adreno740v2".into()),
                _ => Err(io::Error::new(io::ErrorKind::NotFound, "absent")),
            }
        }
    }

    #[test]
    fn capability_is_detected_once() {
        let dir = tempdir().unwrap();
        let reads = Arc::new(AtomicUsize::new(0));
        let emulator = Emulator::with_capability_source(
            Config::with_data_dir(dir.path()),
            Box::new(CountingSource(reads.clone())),
        );

        assert_eq!(emulator.capability().gpu, GpuFamily::Adreno);
        let after_first = reads.load(Ordering::SeqCst);
        assert!(after_first > 0);
        assert_eq!(emulator.capability().gpu, GpuFamily::Adreno);
        assert_eq!(reads.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn launch_rejects_relative_executable() {
        let dir = tempdir().unwrap();
        let emulator = Emulator::with_capability_source(
            Config::with_data_dir(dir.path()),
            Box::new(CountingSource(Arc::new(AtomicUsize::new(0)))),
        );

        let err = emulator
            .launch(LaunchRequest::new("game.exe"))
            .await
            .unwrap_err();
        assert!(matches!(err, EmulatorError::InvalidExecutable(_)));
    }

    #[tokio::test]
    async fn cold_start_reports_runtime_not_initialized() {
        let dir = tempdir().unwrap();
        let exe = dir.path().join("game.exe");
        std::fs::write(&exe, b"MZ").unwrap();
        let emulator = Emulator::with_capability_source(
            Config::with_data_dir(dir.path()),
            Box::new(CountingSource(Arc::new(AtomicUsize::new(0)))),
        );

        let err = emulator.launch(LaunchRequest::new(&exe)).await.unwrap_err();
        assert!(matches!(err, EmulatorError::RuntimeNotInitialized { .. }));
        assert!(emulator.list_containers().unwrap().is_empty());
    }
}

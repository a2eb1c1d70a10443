//! Process launcher: runs guest executables through the translation layer

use crate::container::EmulatorContainer;
use crate::environment::EnvironmentVariableSet;
use crate::error::{EmulatorError, Result};
use crate::layout::RuntimeLayout;
use crate::process::{EmulatorProcess, ProcessRegistry, ProcessStatus};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a killed process group gets to be reaped
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawns `box64 wine <executable> <args>` inside a container
#[derive(Debug)]
pub struct ProcessLauncher {
    layout: RuntimeLayout,
    registry: Arc<ProcessRegistry>,
    capture_output: bool,
}

impl ProcessLauncher {
    pub fn new(layout: RuntimeLayout, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            layout,
            registry,
            capture_output: true,
        }
    }

    /// Append child stdout/stderr to `<container>/logs/<stem>.log`
    pub fn with_capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Launch without waiting. The returned handle is also registered.
    pub fn launch(
        &self,
        container: &EmulatorContainer,
        executable: &Path,
        args: &[String],
        env: &EnvironmentVariableSet,
    ) -> Result<Arc<EmulatorProcess>> {
        // Nothing is spawned against a half-installed tree
        self.layout.verify()?;

        let mut command = self.command(container, executable, args, env)?;
        let description = format!(
            "{} {} {:?} {:?}",
            self.layout.translation_binary().display(),
            self.layout.runtime_binary().display(),
            executable,
            args
        );
        debug!("Spawning: {}", description);

        let process = EmulatorProcess::spawn(&mut command, executable, container.id().as_str())
            .map_err(|e| EmulatorError::ProcessSpawn {
                command: description,
                error: e.to_string(),
            })?;
        let process = Arc::new(process);

        info!(
            "Launched {:?} in container {} (pid {})",
            executable,
            container.id(),
            process.pid()
        );
        self.registry.register(process.clone());
        Ok(process)
    }

    /// Launch, wait `grace`, and fail with `ExitedImmediately` if the child is already gone
    pub async fn launch_and_confirm(
        &self,
        container: &EmulatorContainer,
        executable: &Path,
        args: &[String],
        env: &EnvironmentVariableSet,
        grace: Duration,
    ) -> Result<Arc<EmulatorProcess>> {
        let process = self.launch(container, executable, args, env)?;
        self.confirm(process, grace).await
    }

    /// Wait `grace` and fail with `ExitedImmediately` if the process has exited by then
    pub async fn confirm(
        &self,
        process: Arc<EmulatorProcess>,
        grace: Duration,
    ) -> Result<Arc<EmulatorProcess>> {
        match process.wait_for_exit(grace).await? {
            ProcessStatus::Running => Ok(process),
            ProcessStatus::Exited(code) => {
                let executable = process.executable().to_path_buf();
                warn!("{:?} exited within {:?} (code {:?})", executable, grace, code);
                Err(EmulatorError::ExitedImmediately { executable, code })
            }
        }
    }

    /// Launch and wait up to `timeout` for exit.
    ///
    /// A process still running at the deadline is killed and reported as
    /// [`ProcessStatus::Running`].
    pub async fn run_to_completion(
        &self,
        container: &EmulatorContainer,
        executable: &Path,
        args: &[String],
        env: &EnvironmentVariableSet,
        timeout: Duration,
    ) -> Result<ProcessStatus> {
        let process = self.launch(container, executable, args, env)?;
        let status = process.wait_for_exit(timeout).await?;

        if status.is_running() {
            warn!(
                "{:?} did not finish within {:?}, killing pid {}",
                executable,
                timeout,
                process.pid()
            );
            process.kill()?;
            process.wait_for_exit(KILL_REAP_TIMEOUT).await?;
        }
        self.registry.prune();
        Ok(status)
    }

    fn command(
        &self,
        container: &EmulatorContainer,
        executable: &Path,
        args: &[String],
        env: &EnvironmentVariableSet,
    ) -> Result<Command> {
        let mut command = Command::new(self.layout.translation_binary());
        command
            .arg(self.layout.runtime_binary())
            .arg(executable)
            .args(args)
            .current_dir(container.root())
            .envs(env.iter())
            // Injected after the composed set so they always win
            .env("WINEPREFIX", container.root())
            .env("PATH", self.search_path()?)
            .env("LD_LIBRARY_PATH", self.layout.runtime_lib_dir())
            .stdin(Stdio::null());

        if self.capture_output {
            let log = self.open_log(container, executable)?;
            command
                .stdout(Stdio::from(log.try_clone()?))
                .stderr(Stdio::from(log));
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        Ok(command)
    }

    /// Host PATH with the runtime's bin directory in front
    fn search_path(&self) -> Result<OsString> {
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let dirs = std::iter::once(self.layout.runtime_bin_dir())
            .chain(std::env::split_paths(&inherited));
        std::env::join_paths(dirs).map_err(|e| EmulatorError::ProcessSpawn {
            command: "PATH".into(),
            error: e.to_string(),
        })
    }

    fn open_log(&self, container: &EmulatorContainer, executable: &Path) -> Result<File> {
        let stem = executable
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "process".to_string());
        let logs = container.logs_dir();
        std::fs::create_dir_all(&logs)?;

        let path = logs.join(format!("{}.log", stem));
        debug!("Capturing output to {:?}", path);
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }
}

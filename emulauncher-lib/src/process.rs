//! Handles to launched guest processes
//!
//! Every launch runs in its own process group so that the translation layer,
//! the runtime and whatever the guest forks can be signalled together.

use command_group::{CommandGroup, GroupChild};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Interval between polls in [`EmulatorProcess::wait_for_exit`]
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Observed state of a launched process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Exit code, `None` when terminated by a signal
    Exited(Option<i32>),
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A running (or finished) guest process group
pub struct EmulatorProcess {
    pid: u32,
    executable: PathBuf,
    container_id: String,
    started_at: SystemTime,
    child: Mutex<GroupChild>,
    exit: Mutex<Option<Option<i32>>>,
}

impl std::fmt::Debug for EmulatorProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorProcess")
            .field("pid", &self.pid)
            .field("executable", &self.executable)
            .field("container_id", &self.container_id)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl EmulatorProcess {
    /// Spawn `command` as the leader of a new process group
    pub(crate) fn spawn(
        command: &mut Command,
        executable: impl Into<PathBuf>,
        container_id: impl Into<String>,
    ) -> io::Result<Self> {
        let child = command.group_spawn()?;
        Ok(Self {
            pid: child.id(),
            executable: executable.into(),
            container_id: container_id.into(),
            started_at: SystemTime::now(),
            child: Mutex::new(child),
            exit: Mutex::new(None),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Non-blocking status check
    pub fn status(&self) -> io::Result<ProcessStatus> {
        let mut exit = lock(&self.exit);
        if let Some(code) = *exit {
            return Ok(ProcessStatus::Exited(code));
        }

        match lock(&self.child).try_wait()? {
            Some(status) => {
                debug!("Process {} exited with {:?}", self.pid, status);
                *exit = Some(status.code());
                Ok(ProcessStatus::Exited(status.code()))
            }
            None => Ok(ProcessStatus::Running),
        }
    }

    pub fn is_running(&self) -> bool {
        match self.status() {
            Ok(status) => status.is_running(),
            Err(e) => {
                warn!("Failed to poll process {}: {}", self.pid, e);
                false
            }
        }
    }

    /// Kill the whole process group
    pub fn kill(&self) -> io::Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        info!("Killing process group {}", self.pid);
        let reaped = {
            let mut child = lock(&self.child);
            child.kill()?;
            child.try_wait()?
        };
        // Leader may already be reaped
        if let Some(status) = reaped {
            *lock(&self.exit) = Some(status.code());
        }
        Ok(())
    }

    /// Stop the process group (SIGSTOP)
    #[cfg(unix)]
    pub fn suspend(&self) -> io::Result<()> {
        use command_group::{Signal, UnixChildExt};

        debug!("Suspending process group {}", self.pid);
        lock(&self.child).signal(Signal::SIGSTOP)
    }

    /// Continue a stopped process group (SIGCONT)
    #[cfg(unix)]
    pub fn resume(&self) -> io::Result<()> {
        use command_group::{Signal, UnixChildExt};

        debug!("Resuming process group {}", self.pid);
        lock(&self.child).signal(Signal::SIGCONT)
    }

    #[cfg(not(unix))]
    pub fn suspend(&self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "suspend requires unix signals"))
    }

    #[cfg(not(unix))]
    pub fn resume(&self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "resume requires unix signals"))
    }

    /// Poll until the process exits or `timeout` elapses.
    ///
    /// Returns [`ProcessStatus::Running`] on timeout.
    pub async fn wait_for_exit(&self, timeout: Duration) -> io::Result<ProcessStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.status()?;
            if !status.is_running() || Instant::now() >= deadline {
                return Ok(status);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Launched processes, shared between the launcher and the container manager
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: Mutex<HashMap<u32, Arc<EmulatorProcess>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new process, dropping handles of processes that have exited
    pub fn register(&self, process: Arc<EmulatorProcess>) {
        let mut processes = lock(&self.processes);
        processes.retain(|_, p| p.is_running());
        processes.insert(process.pid(), process);
    }

    pub fn get(&self, pid: u32) -> Option<Arc<EmulatorProcess>> {
        lock(&self.processes).get(&pid).cloned()
    }

    /// Still-running processes that belong to `container_id`
    pub fn running_in(&self, container_id: &str) -> Vec<Arc<EmulatorProcess>> {
        let mut running: Vec<_> = lock(&self.processes)
            .values()
            .filter(|p| p.container_id() == container_id)
            .cloned()
            .collect();
        running.retain(|p| p.is_running());
        running.sort_by_key(|p| p.pid());
        running
    }

    /// Drop handles of exited processes, returning how many were removed
    pub fn prune(&self) -> usize {
        let mut processes = lock(&self.processes);
        let before = processes.len();
        processes.retain(|_, p| p.is_running());
        before - processes.len()
    }

    /// Kill every running process of a container
    pub fn kill_all(&self, container_id: &str) -> io::Result<usize> {
        let running = self.running_in(container_id);
        for process in &running {
            process.kill()?;
        }
        Ok(running.len())
    }

    pub fn len(&self) -> usize {
        lock(&self.processes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

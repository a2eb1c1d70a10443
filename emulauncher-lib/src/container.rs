//! Container management
//!
//! A container is an isolated runtime prefix under `containers/<id>/`. Only
//! this module creates, resets or deletes container directories.

use crate::environment::EnvironmentVariableSet;
use crate::error::{EmulatorError, Result};
use crate::launcher::ProcessLauncher;
use crate::layout::RuntimeLayout;
use crate::process::ProcessStatus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Id of the shared container used when a launch names none
pub const DEFAULT_CONTAINER: &str = "default";

/// Metadata file in every container root
pub const METADATA_FILE: &str = "container.json";

/// Drive subdirectories created for every container
pub const DRIVE_DIRS: [&str; 3] = ["system", "program", "user"];

/// Prefix initialization failures after which a reset is suggested
const RESET_HINT_THRESHOLD: u32 = 2;

const MAX_ID_LEN: usize = 64;

/// Validated container id: `[A-Za-z0-9._-]{1,64}`, never `.` or `..`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    pub fn parse(id: &str) -> Result<Self> {
        let valid = !id.is_empty()
            && id.len() <= MAX_ID_LEN
            && id != "."
            && id != ".."
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if valid {
            Ok(Self(id.to_string()))
        } else {
            Err(EmulatorError::InvalidContainerId(id.to_string()))
        }
    }

    /// The shared container
    pub fn shared() -> Self {
        Self(DEFAULT_CONTAINER.to_string())
    }

    /// Fresh id derived from the current time (`c<unix-millis>`)
    pub fn ad_hoc() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self(format!("c{}", millis))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_shared(&self) -> bool {
        self.0 == DEFAULT_CONTAINER
    }
}

impl FromStr for ContainerId {
    type Err = EmulatorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = EmulatorError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which container a create request targets
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ContainerRequest {
    /// The shared `default` container
    #[default]
    Default,
    Named(ContainerId),
    /// A new container with a generated id
    AdHoc,
}

/// Parameters for [`ContainerManager::create_container`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    pub id: ContainerRequest,
    /// Environment overrides applied after composition
    pub overrides: BTreeMap<String, String>,
    /// Run the runtime's prefix initialization if not done yet
    pub initialize_prefix: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            id: ContainerRequest::Default,
            overrides: BTreeMap::new(),
            initialize_prefix: true,
        }
    }
}

impl ContainerConfig {
    pub fn named(id: ContainerId) -> Self {
        Self {
            id: ContainerRequest::Named(id),
            ..Self::default()
        }
    }

    pub fn ad_hoc() -> Self {
        Self {
            id: ContainerRequest::AdHoc,
            ..Self::default()
        }
    }

    pub fn with_overrides(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn without_prefix_init(mut self) -> Self {
        self.initialize_prefix = false;
        self
    }
}

/// Explicit user consent for the destructive [`ContainerManager::reset_container`]
#[derive(Debug, Clone, Copy)]
pub struct ResetConfirmation(());

impl ResetConfirmation {
    /// Only construct this after the user has confirmed losing the prefix
    pub fn user_confirmed() -> Self {
        Self(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// One isolated runtime prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatorContainer {
    id: ContainerId,
    #[serde(skip)]
    root: PathBuf,
    /// Unix seconds
    created_at: u64,
    #[serde(default)]
    overrides: BTreeMap<String, String>,
    #[serde(default)]
    prefix_initialized: bool,
    #[serde(default)]
    prefix_init_failures: u32,
}

impl EmulatorContainer {
    pub fn new(id: ContainerId, root: impl Into<PathBuf>) -> Self {
        Self {
            id,
            root: root.into(),
            created_at: unix_now(),
            overrides: BTreeMap::new(),
            prefix_initialized: false,
            prefix_init_failures: 0,
        }
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Container root, used as WINEPREFIX and working directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn drive_root(&self) -> PathBuf {
        self.root.join("drive_root")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn overrides(&self) -> &BTreeMap<String, String> {
        &self.overrides
    }

    pub fn is_prefix_initialized(&self) -> bool {
        self.prefix_initialized
    }

    pub fn prefix_init_failures(&self) -> u32 {
        self.prefix_init_failures
    }

    fn load(id: ContainerId, root: PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(root.join(METADATA_FILE))?;
        let mut container: EmulatorContainer = serde_json::from_str(&content)?;
        if container.id != id {
            warn!(
                "Metadata in {:?} names container {}, using directory name {}",
                root, container.id, id
            );
            container.id = id;
        }
        container.root = root;
        Ok(container)
    }

    /// Metadata for a directory whose container.json is missing or unreadable
    fn synthesize(id: ContainerId, root: PathBuf) -> Self {
        let created_at = std::fs::metadata(&root)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            created_at,
            ..Self::new(id, root)
        }
    }

    fn load_or_synthesize(id: ContainerId, root: PathBuf) -> Self {
        match Self::load(id.clone(), root.clone()) {
            Ok(container) => container,
            Err(e) => {
                debug!("No usable metadata for container {}: {}", id, e);
                Self::synthesize(id, root)
            }
        }
    }

    /// Write container.json through a temp file so readers never see a partial file
    fn save(&self) -> Result<()> {
        let path = self.metadata_path();
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn create_dirs(&self) -> Result<()> {
        let drive_root = self.drive_root();
        for dir in DRIVE_DIRS {
            std::fs::create_dir_all(drive_root.join(dir))?;
        }
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

/// A container locked against deletion and reset while a process is started in it
pub struct ContainerLease {
    container: EmulatorContainer,
    _guard: OwnedMutexGuard<()>,
}

impl ContainerLease {
    pub fn container(&self) -> &EmulatorContainer {
        &self.container
    }
}

impl fmt::Debug for ContainerLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerLease")
            .field("container", &self.container.id)
            .finish_non_exhaustive()
    }
}

/// Creates, lists, resets and deletes containers
#[derive(Debug)]
pub struct ContainerManager {
    layout: RuntimeLayout,
    launcher: Arc<ProcessLauncher>,
    prefix_init_timeout: Duration,
    locks: Mutex<HashMap<ContainerId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ContainerManager {
    pub fn new(launcher: Arc<ProcessLauncher>, prefix_init_timeout: Duration) -> Self {
        Self {
            layout: launcher.layout().clone(),
            launcher,
            prefix_init_timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn container_root(&self, id: &ContainerId) -> PathBuf {
        self.layout.containers_dir().join(id.as_str())
    }

    /// Lock serializing mutations of one container
    fn lock_for(&self, id: &ContainerId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.clone()).or_default().clone()
    }

    /// Forget the lock of a deleted container unless someone else holds or awaits it
    fn release_lock(&self, id: &ContainerId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(id);
        }
    }

    async fn lock_owned(&self, id: &ContainerId) -> OwnedMutexGuard<()> {
        self.lock_for(id).lock_owned().await
    }

    fn resolve_request(&self, request: &ContainerRequest) -> Result<ContainerId> {
        match request {
            ContainerRequest::Default => Ok(ContainerId::shared()),
            ContainerRequest::Named(id) => Ok(id.clone()),
            ContainerRequest::AdHoc => self.claim_ad_hoc(),
        }
    }

    /// Reserve a fresh ad-hoc id by creating its directory
    fn claim_ad_hoc(&self) -> Result<ContainerId> {
        std::fs::create_dir_all(self.layout.containers_dir())?;
        let base = ContainerId::ad_hoc();
        let mut candidate = base.clone();
        let mut suffix = 1;
        loop {
            match std::fs::create_dir(self.container_root(&candidate)) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    candidate = ContainerId(format!("{}-{}", base, suffix));
                    suffix += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Load the container's metadata, creating the container when it has none yet.
    /// Callers hold the container's lock.
    fn open_or_create(
        &self,
        id: &ContainerId,
        overrides: BTreeMap<String, String>,
    ) -> Result<EmulatorContainer> {
        let root = self.container_root(id);
        if root.join(METADATA_FILE).is_file() {
            let mut existing = EmulatorContainer::load_or_synthesize(id.clone(), root);
            if !overrides.is_empty() {
                existing.overrides.extend(overrides);
                existing.save()?;
            }
            debug!("Reusing container {}", id);
            return Ok(existing);
        }

        let mut created = EmulatorContainer::new(id.clone(), root);
        created.overrides = overrides;
        created.create_dirs()?;
        created.save()?;
        info!("Created container {} at {:?}", id, created.root());
        Ok(created)
    }

    /// Create a container, or return the existing one.
    ///
    /// Overrides given for an existing container are merged into its metadata.
    pub async fn create_container(&self, config: ContainerConfig) -> Result<EmulatorContainer> {
        let id = self.resolve_request(&config.id)?;
        let _guard = self.lock_owned(&id).await;

        let mut container = self.open_or_create(&id, config.overrides)?;
        if config.initialize_prefix && !container.prefix_initialized {
            self.initialize_prefix(&mut container).await?;
        }
        Ok(container)
    }

    /// Exclusive hold on a ready container for the duration of a launch.
    ///
    /// The shared container is created on demand; any other id must exist.
    /// The prefix is initialized if it is not yet. Deletion and reset of the
    /// container wait until the lease is dropped.
    pub async fn lease(&self, id: Option<&ContainerId>) -> Result<ContainerLease> {
        let id = id.cloned().unwrap_or_else(ContainerId::shared);
        let guard = self.lock_owned(&id).await;

        let mut container = if id.is_shared() {
            self.open_or_create(&id, BTreeMap::new())?
        } else {
            let root = self.container_root(&id);
            if !root.is_dir() {
                return Err(EmulatorError::ContainerNotFound(id.to_string()));
            }
            EmulatorContainer::load_or_synthesize(id, root)
        };
        if !container.prefix_initialized {
            self.initialize_prefix(&mut container).await?;
        }

        Ok(ContainerLease {
            container,
            _guard: guard,
        })
    }

    /// Run `wineboot --init` once for the container
    async fn initialize_prefix(&self, container: &mut EmulatorContainer) -> Result<()> {
        info!("Initializing prefix of container {}", container.id());
        let env: EnvironmentVariableSet = [
            ("WINEPREFIX", container.root().to_string_lossy().into_owned()),
            ("WINEDEBUG", "-all".to_string()),
            ("WINEDLLOVERRIDES", "mscoree,mshtml=".to_string()),
        ]
        .into_iter()
        .collect();

        let outcome = self
            .launcher
            .run_to_completion(
                container,
                Path::new("wineboot"),
                &["--init".to_string()],
                &env,
                self.prefix_init_timeout,
            )
            .await;

        let reason = match outcome {
            Ok(ProcessStatus::Exited(Some(0))) => {
                container.prefix_initialized = true;
                container.prefix_init_failures = 0;
                container.save()?;
                info!("Prefix of container {} initialized", container.id());
                return Ok(());
            }
            Ok(ProcessStatus::Exited(code)) => format!("wineboot exited with {:?}", code),
            Ok(ProcessStatus::Running) => {
                format!("wineboot timed out after {:?}", self.prefix_init_timeout)
            }
            // Not a prefix problem; nothing to count
            Err(e @ EmulatorError::RuntimeNotInitialized { .. }) => return Err(e),
            Err(e) => e.to_string(),
        };

        container.prefix_init_failures += 1;
        container.save()?;
        warn!(
            "Prefix initialization of container {} failed ({} so far): {}",
            container.id(),
            container.prefix_init_failures,
            reason
        );
        if container.prefix_init_failures >= RESET_HINT_THRESHOLD {
            warn!(
                "Container {} keeps failing to initialize; consider resetting it",
                container.id()
            );
        }

        Err(EmulatorError::PrefixInitialization {
            id: container.id().to_string(),
            reason,
        })
    }

    pub fn get_container(&self, id: &ContainerId) -> Result<EmulatorContainer> {
        let root = self.container_root(id);
        if !root.is_dir() {
            return Err(EmulatorError::ContainerNotFound(id.to_string()));
        }
        Ok(EmulatorContainer::load_or_synthesize(id.clone(), root))
    }

    /// All containers, sorted by id
    pub fn list_containers(&self) -> Result<Vec<EmulatorContainer>> {
        let dir = self.layout.containers_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut containers = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| ContainerId::parse(n).ok()) else {
                debug!("Ignoring {:?} in containers directory", name);
                continue;
            };
            containers.push(EmulatorContainer::load_or_synthesize(id, entry.path()));
        }
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(containers)
    }

    fn ensure_idle(&self, id: &ContainerId) -> Result<()> {
        let running = self.launcher.registry().running_in(id.as_str());
        if running.is_empty() {
            return Ok(());
        }
        let pids: Vec<String> = running.iter().map(|p| p.pid().to_string()).collect();
        Err(EmulatorError::ContainerConflict {
            id: id.to_string(),
            reason: format!("processes still running (pid {})", pids.join(", ")),
        })
    }

    /// Delete a container. Refused while any of its processes runs.
    pub async fn delete_container(&self, id: &ContainerId) -> Result<()> {
        let guard = self.lock_owned(id).await;

        let root = self.container_root(id);
        if !root.is_dir() {
            return Err(EmulatorError::ContainerNotFound(id.to_string()));
        }
        self.ensure_idle(id)?;

        std::fs::remove_dir_all(&root)?;
        info!("Deleted container {}", id);
        drop(guard);
        self.release_lock(id);
        Ok(())
    }

    /// Wipe and re-initialize a container's prefix, keeping its overrides and logs
    pub async fn reset_container(
        &self,
        id: &ContainerId,
        _confirmation: ResetConfirmation,
    ) -> Result<EmulatorContainer> {
        let _guard = self.lock_owned(id).await;

        let root = self.container_root(id);
        if !root.is_dir() {
            return Err(EmulatorError::ContainerNotFound(id.to_string()));
        }
        self.ensure_idle(id)?;

        let previous = EmulatorContainer::load_or_synthesize(id.clone(), root.clone());
        warn!("Resetting container {}", id);

        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_name() == "logs" {
                continue;
            }
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }

        let mut container = EmulatorContainer::new(id.clone(), root);
        container.overrides = previous.overrides;
        container.create_dirs()?;
        container.save()?;

        self.initialize_prefix(&mut container).await?;
        Ok(container)
    }

    /// Total size in bytes of the files in a container
    pub fn disk_usage(&self, id: &ContainerId) -> Result<u64> {
        let root = self.container_root(id);
        if !root.is_dir() {
            return Err(EmulatorError::ContainerNotFound(id.to_string()));
        }

        let mut total = 0;
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() {
                total += entry.metadata().map_err(std::io::Error::from)?.len();
            }
        }
        Ok(total)
    }
}

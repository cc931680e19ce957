//! Job environments: the process-isolation backends jobs execute under.
//!
//! The slot manager only talks to the [`JobEnvironment`] trait. Two backends
//! are provided: plain child processes and Docker containers. Only the
//! container backend participates in root volume management.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::process::Command;

use crate::config::{JobEnvironmentConfig, JobEnvironmentKind};
use crate::error::{Result, SlotError};
use crate::slots::SlotType;

pub trait JobEnvironment: Send + Sync {
    fn kind(&self) -> JobEnvironmentKind;

    /// Brings the environment up. Must run before any location is built: it
    /// removes leftover job processes from a previous incarnation, which may
    /// still pin files inside sandboxes.
    fn init(&self, slot_count: usize, cpu_limit: f64, idle_cpu_fraction: f64) -> Result<()>;

    fn is_enabled(&self) -> bool;

    /// CPU ceiling of the given pool. The idle pool is sized as
    /// `idle_cpu_fraction * cpu_limit`; the common pool gets the rest.
    fn cpu_limit(&self, slot_type: SlotType) -> f64;

    fn update_cpu_limit(&self, cpu_limit: f64) -> Result<()>;

    fn update_idle_cpu_fraction(&self, fraction: f64);

    /// Drops per-slot cpuset bindings, used when NUMA scheduling is switched
    /// off at runtime.
    fn clear_slot_cpu_sets(&self, slot_count: usize) -> Result<()>;

    fn create_job_directory_manager(
        &self,
        path: &Path,
        location_index: usize,
    ) -> JobDirectoryManager;

    /// Uid the job in the given slot runs under.
    fn user_id(&self, slot_index: usize) -> u32;

    /// Telemetry pass-through for the node's resource reporting.
    fn major_page_fault_count(&self) -> Result<i64>;

    /// Builds the command that runs `command` inside the slot sandbox.
    fn build_command(&self, command: &str, sandbox: &Path, slot_index: usize, cpu: f64)
        -> Command;
}

pub fn create_job_environment(
    config: &JobEnvironmentConfig,
    node_tag: &str,
) -> Arc<dyn JobEnvironment> {
    match config.kind {
        JobEnvironmentKind::Process => Arc::new(ProcessJobEnvironment::new(config)),
        JobEnvironmentKind::Container => Arc::new(ContainerJobEnvironment::new(config, node_tag)),
    }
}

#[derive(Debug, Default)]
struct EnvState {
    initialized: bool,
    enabled: bool,
    cpu_limit: f64,
    idle_cpu_fraction: f64,
}

impl EnvState {
    fn idle_pool_limit(&self) -> f64 {
        self.cpu_limit * self.idle_cpu_fraction
    }

    fn pool_limit(&self, slot_type: SlotType) -> f64 {
        match slot_type {
            SlotType::Idle => self.idle_pool_limit(),
            SlotType::Common => self.cpu_limit - self.idle_pool_limit(),
        }
    }
}

/// Runs jobs as plain child processes of this daemon.
pub struct ProcessJobEnvironment {
    state: Mutex<EnvState>,
    start_uid: u32,
}

impl ProcessJobEnvironment {
    pub fn new(config: &JobEnvironmentConfig) -> Self {
        Self {
            state: Mutex::new(EnvState::default()),
            start_uid: config.start_uid,
        }
    }
}

impl JobEnvironment for ProcessJobEnvironment {
    fn kind(&self) -> JobEnvironmentKind {
        JobEnvironmentKind::Process
    }

    fn init(&self, slot_count: usize, cpu_limit: f64, idle_cpu_fraction: f64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.initialized {
            tracing::debug!("Job environment already initialized");
            return Ok(());
        }
        state.cpu_limit = cpu_limit;
        state.idle_cpu_fraction = idle_cpu_fraction;
        state.enabled = true;
        state.initialized = true;
        tracing::info!(slot_count, cpu_limit, idle_cpu_fraction, "Process job environment initialized");
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    fn cpu_limit(&self, slot_type: SlotType) -> f64 {
        self.state.lock().unwrap().pool_limit(slot_type)
    }

    fn update_cpu_limit(&self, cpu_limit: f64) -> Result<()> {
        self.state.lock().unwrap().cpu_limit = cpu_limit;
        Ok(())
    }

    fn update_idle_cpu_fraction(&self, fraction: f64) {
        self.state.lock().unwrap().idle_cpu_fraction = fraction;
    }

    fn clear_slot_cpu_sets(&self, _slot_count: usize) -> Result<()> {
        // Child processes inherit this daemon's affinity; nothing is pinned.
        Ok(())
    }

    fn create_job_directory_manager(
        &self,
        path: &Path,
        location_index: usize,
    ) -> JobDirectoryManager {
        JobDirectoryManager::new(path.to_path_buf(), location_index)
    }

    fn user_id(&self, slot_index: usize) -> u32 {
        self.start_uid + slot_index as u32
    }

    fn major_page_fault_count(&self) -> Result<i64> {
        read_major_page_fault_count()
    }

    fn build_command(
        &self,
        command: &str,
        sandbox: &Path,
        _slot_index: usize,
        _cpu: f64,
    ) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(sandbox);
        cmd
    }
}

/// Runs jobs inside Docker containers labeled with the node tag, so that a
/// restarted daemon can find and remove its predecessors' containers.
pub struct ContainerJobEnvironment {
    state: Mutex<EnvState>,
    image: String,
    start_uid: u32,
    node_tag: String,
}

impl ContainerJobEnvironment {
    pub fn new(config: &JobEnvironmentConfig, node_tag: &str) -> Self {
        Self {
            state: Mutex::new(EnvState::default()),
            image: config.container_image.clone(),
            start_uid: config.start_uid,
            node_tag: node_tag.to_string(),
        }
    }

    fn container_name(&self, slot_index: usize) -> String {
        format!("slot-{}-{}", self.node_tag, slot_index)
    }

    /// Removes containers left over from a previous incarnation of this node.
    fn remove_stale_containers(&self) -> std::io::Result<usize> {
        let listed = std::process::Command::new("docker")
            .args(["ps", "-aq", "--filter"])
            .arg(format!("label=slotd.node={}", self.node_tag))
            .output()?;
        let ids: Vec<String> = String::from_utf8_lossy(&listed.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        for id in &ids {
            let _ = std::process::Command::new("docker")
                .args(["rm", "-f", id])
                .output();
        }
        Ok(ids.len())
    }
}

impl JobEnvironment for ContainerJobEnvironment {
    fn kind(&self) -> JobEnvironmentKind {
        JobEnvironmentKind::Container
    }

    fn init(&self, slot_count: usize, cpu_limit: f64, idle_cpu_fraction: f64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.initialized {
            tracing::debug!("Job environment already initialized");
            return Ok(());
        }
        state.cpu_limit = cpu_limit;
        state.idle_cpu_fraction = idle_cpu_fraction;
        state.initialized = true;

        let probe = std::process::Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .output();
        match probe {
            Ok(output) if output.status.success() => {
                state.enabled = true;
                drop(state);
                match self.remove_stale_containers() {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "Removed stale job containers")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Failed to scan for stale containers"),
                }
                tracing::info!(slot_count, cpu_limit, idle_cpu_fraction, image = %self.image, "Container job environment initialized");
            }
            _ => {
                state.enabled = false;
                tracing::warn!("Docker daemon unreachable, container job environment disabled");
            }
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    fn cpu_limit(&self, slot_type: SlotType) -> f64 {
        self.state.lock().unwrap().pool_limit(slot_type)
    }

    fn update_cpu_limit(&self, cpu_limit: f64) -> Result<()> {
        self.state.lock().unwrap().cpu_limit = cpu_limit;
        Ok(())
    }

    fn update_idle_cpu_fraction(&self, fraction: f64) {
        self.state.lock().unwrap().idle_cpu_fraction = fraction;
    }

    fn clear_slot_cpu_sets(&self, slot_count: usize) -> Result<()> {
        for slot_index in 0..slot_count {
            // Best effort: the container may have exited already.
            let _ = std::process::Command::new("docker")
                .args(["update", "--cpuset-cpus", ""])
                .arg(self.container_name(slot_index))
                .output();
        }
        Ok(())
    }

    fn create_job_directory_manager(
        &self,
        path: &Path,
        location_index: usize,
    ) -> JobDirectoryManager {
        JobDirectoryManager::new(path.to_path_buf(), location_index)
    }

    fn user_id(&self, slot_index: usize) -> u32 {
        self.start_uid + slot_index as u32
    }

    fn major_page_fault_count(&self) -> Result<i64> {
        read_major_page_fault_count()
    }

    fn build_command(&self, command: &str, sandbox: &Path, slot_index: usize, cpu: f64) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg(format!("--name={}", self.container_name(slot_index)))
            .arg(format!("--label=slotd.node={}", self.node_tag))
            .arg(format!("--cpus={cpu}"))
            .arg("--cap-drop=ALL")
            .arg("--security-opt=no-new-privileges")
            .arg(format!("--volume={}:/slot", sandbox.display()))
            .arg("--workdir=/slot")
            .arg(&self.image)
            .arg("sh")
            .arg("-c")
            .arg(command);
        cmd
    }
}

/// Per-location factory for slot sandbox directories.
#[derive(Debug, Clone)]
pub struct JobDirectoryManager {
    root: PathBuf,
    location_index: usize,
}

impl JobDirectoryManager {
    pub fn new(root: PathBuf, location_index: usize) -> Self {
        Self {
            root,
            location_index,
        }
    }

    pub fn location_index(&self) -> usize {
        self.location_index
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_path(&self, slot_index: usize) -> PathBuf {
        self.root.join(slot_index.to_string()).join("sandbox")
    }

    pub fn create_base(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn prepare_slot_dir(&self, slot_index: usize) -> Result<PathBuf> {
        let path = self.slot_path(slot_index);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    pub fn remove_slot_dir(&self, slot_index: usize) -> Result<()> {
        let path = self.root.join(slot_index.to_string());
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        Ok(())
    }
}

/// Major page faults of this process, from `/proc/self/stat`.
fn read_major_page_fault_count() -> Result<i64> {
    let stat = std::fs::read_to_string("/proc/self/stat")?;
    // Skip past the parenthesized comm field, which may contain spaces.
    let rest = stat
        .rfind(')')
        .map(|i| &stat[i + 2..])
        .ok_or_else(|| SlotError::Io("malformed /proc/self/stat".to_string()))?;
    rest.split_whitespace()
        .nth(9)
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| SlotError::Io("malformed /proc/self/stat".to_string()))
}

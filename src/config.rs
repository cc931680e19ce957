use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Static configuration of the slot manager, fixed at construction.
#[derive(Debug, Clone)]
pub struct SlotManagerConfig {
    /// Number of execution slots this node offers.
    pub slot_count: usize,
    /// Total CPU budget handed to the job environment.
    pub cpu_limit: f64,
    /// Disk locations that back job sandboxes.
    pub locations: Vec<LocationConfig>,
    pub job_environment: JobEnvironmentConfig,
    /// Mount tmpfs into sandbox directories where the environment supports it.
    pub enable_tmpfs: bool,
    pub numa_nodes: Vec<NumaNodeConfig>,
    /// Medium used for requests that do not name one explicitly.
    pub default_medium_name: String,
    pub max_consecutive_job_aborts: usize,
    pub max_consecutive_gpu_job_failures: usize,
    /// Base delay before an automatic reset of a consecutive-failure alert.
    pub disable_jobs_timeout: Duration,
    pub disable_jobs_on_gpu_check_failure: bool,
    /// Fraction of the CPU budget reserved for the idle pool.
    pub idle_cpu_fraction: f64,
    /// Root directory of the container volume store.
    pub volumes_path: PathBuf,
    pub node_tag_prefix: String,
    /// Port the node serves its API on; only used for the node tag and dashboard.
    pub port: u16,
    pub testing: TestingConfig,
}

impl Default for SlotManagerConfig {
    fn default() -> Self {
        Self {
            slot_count: 8,
            cpu_limit: 8.0,
            locations: Vec::new(),
            job_environment: JobEnvironmentConfig::default(),
            enable_tmpfs: false,
            numa_nodes: Vec::new(),
            default_medium_name: "default".to_string(),
            max_consecutive_job_aborts: 500,
            max_consecutive_gpu_job_failures: 50,
            disable_jobs_timeout: Duration::from_secs(600),
            disable_jobs_on_gpu_check_failure: false,
            idle_cpu_fraction: 0.0,
            volumes_path: PathBuf::from("volumes"),
            node_tag_prefix: "slotd".to_string(),
            port: 9090,
            testing: TestingConfig::default(),
        }
    }
}

impl SlotManagerConfig {
    /// Diagnostic tag identifying this node instance across restarts.
    pub fn node_tag(&self) -> String {
        format!("{}-{}-{}", self.node_tag_prefix, self.port, std::process::id())
    }
}

#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub path: PathBuf,
    pub medium_name: String,
    /// Overrides the disk limit derived from the filesystem.
    pub disk_quota: Option<i64>,
}

impl LocationConfig {
    pub fn new(path: impl Into<PathBuf>, medium_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            medium_name: medium_name.into(),
            disk_quota: None,
        }
    }

    pub fn with_disk_quota(mut self, quota: i64) -> Self {
        self.disk_quota = Some(quota);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumaNodeConfig {
    pub numa_node_id: i64,
    pub cpu_count: f64,
    /// Kernel cpuset string, e.g. "0-7,16-23".
    pub cpu_set: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEnvironmentKind {
    /// Jobs run as plain child processes.
    Process,
    /// Jobs run inside containers; enables the root volume manager.
    Container,
}

#[derive(Debug, Clone)]
pub struct JobEnvironmentConfig {
    pub kind: JobEnvironmentKind,
    /// Image used by the container environment.
    pub container_image: String,
    /// First uid of the per-slot uid range.
    pub start_uid: u32,
}

impl Default for JobEnvironmentConfig {
    fn default() -> Self {
        Self {
            kind: JobEnvironmentKind::Process,
            container_image: "ubuntu:24.04".to_string(),
            start_uid: 10000,
        }
    }
}

/// Dynamic overrides distributed at runtime. A `None` field falls back to the
/// static configuration value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicConfig {
    pub disable_jobs_on_gpu_check_failure: Option<bool>,
    pub idle_cpu_fraction: Option<f64>,
    pub enable_numa_node_scheduling: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TestingConfig {
    /// Suppresses the job-proxy-unavailable alert; used by integration tests
    /// that have no job proxy build to report.
    pub skip_job_proxy_unavailable_alert: bool,
}

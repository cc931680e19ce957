//! Test harness for slot manager integration tests.
//!
//! Provides a builder that brings up a fully initialized manager backed by
//! temporary location directories, plus wait utilities.

#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use tempfile::TempDir;

use slotd::config::{LocationConfig, NumaNodeConfig, SlotManagerConfig, TestingConfig};
use slotd::medium::MediumDirectory;
use slotd::slots::{CpuRequest, DiskRequest, SlotManager};

/// A slot manager plus the temporary directories backing its locations.
/// The directories live as long as this struct.
pub struct TestManager {
    pub manager: SlotManager,
    pub medium_directory: MediumDirectory,
    pub location_dirs: Vec<TempDir>,
}

pub struct TestManagerBuilder {
    slot_count: usize,
    cpu_limit: f64,
    idle_cpu_fraction: f64,
    /// One entry per location: medium name and optional disk quota.
    location_media: Vec<(String, Option<i64>)>,
    numa_nodes: Vec<NumaNodeConfig>,
    max_consecutive_job_aborts: usize,
    max_consecutive_gpu_job_failures: usize,
    disable_jobs_timeout: Duration,
    disable_jobs_on_gpu_check_failure: bool,
    default_medium: String,
    skip_job_proxy_unavailable_alert: bool,
    report_job_proxy: bool,
    run_init_media: bool,
}

impl TestManagerBuilder {
    pub fn new() -> Self {
        Self {
            slot_count: 2,
            cpu_limit: 8.0,
            idle_cpu_fraction: 0.0,
            location_media: Vec::new(),
            numa_nodes: Vec::new(),
            max_consecutive_job_aborts: 500,
            max_consecutive_gpu_job_failures: 50,
            // Short enough for recovery tests.
            disable_jobs_timeout: Duration::from_millis(50),
            disable_jobs_on_gpu_check_failure: false,
            default_medium: "ssd".to_string(),
            skip_job_proxy_unavailable_alert: false,
            report_job_proxy: true,
            run_init_media: true,
        }
    }

    pub fn slot_count(mut self, slot_count: usize) -> Self {
        self.slot_count = slot_count;
        self
    }

    pub fn cpu_limit(mut self, cpu_limit: f64) -> Self {
        self.cpu_limit = cpu_limit;
        self
    }

    pub fn idle_cpu_fraction(mut self, fraction: f64) -> Self {
        self.idle_cpu_fraction = fraction;
        self
    }

    pub fn location(mut self, medium: &str) -> Self {
        self.location_media.push((medium.to_string(), None));
        self
    }

    pub fn location_with_quota(mut self, medium: &str, quota: i64) -> Self {
        self.location_media.push((medium.to_string(), Some(quota)));
        self
    }

    pub fn numa_node(mut self, numa_node_id: i64, cpu_count: f64, cpu_set: &str) -> Self {
        self.numa_nodes.push(NumaNodeConfig {
            numa_node_id,
            cpu_count,
            cpu_set: cpu_set.to_string(),
        });
        self
    }

    pub fn max_consecutive_job_aborts(mut self, max: usize) -> Self {
        self.max_consecutive_job_aborts = max;
        self
    }

    pub fn max_consecutive_gpu_job_failures(mut self, max: usize) -> Self {
        self.max_consecutive_gpu_job_failures = max;
        self
    }

    pub fn disable_jobs_timeout(mut self, timeout: Duration) -> Self {
        self.disable_jobs_timeout = timeout;
        self
    }

    pub fn default_medium(mut self, medium: &str) -> Self {
        self.default_medium = medium.to_string();
        self
    }

    pub fn skip_job_proxy_unavailable_alert(mut self) -> Self {
        self.skip_job_proxy_unavailable_alert = true;
        self
    }

    /// Leave the job proxy unreported, so `is_enabled` stays false.
    pub fn without_job_proxy_report(mut self) -> Self {
        self.report_job_proxy = false;
        self
    }

    /// Leave media unbound, so the default medium index stays unresolved.
    pub fn without_init_media(mut self) -> Self {
        self.run_init_media = false;
        self
    }

    pub async fn build(self) -> TestManager {
        let media = if self.location_media.is_empty() {
            vec![("ssd".to_string(), None)]
        } else {
            self.location_media.clone()
        };

        let mut locations = Vec::new();
        let mut location_dirs = Vec::new();
        for (medium, quota) in &media {
            let dir = TempDir::new().unwrap();
            let mut location = LocationConfig::new(dir.path(), medium.clone());
            if let Some(quota) = quota {
                location = location.with_disk_quota(*quota);
            }
            locations.push(location);
            location_dirs.push(dir);
        }

        // Indices assigned from 1, in order of first appearance; the default
        // medium gets one too if no location uses it.
        let mut medium_directory = MediumDirectory::new();
        let mut next_index = 1;
        let mut seen = HashSet::new();
        for name in media
            .iter()
            .map(|(medium, _)| medium.as_str())
            .chain(std::iter::once(self.default_medium.as_str()))
        {
            if seen.insert(name.to_string()) {
                medium_directory.register(name, next_index);
                next_index += 1;
            }
        }

        let config = SlotManagerConfig {
            slot_count: self.slot_count,
            cpu_limit: self.cpu_limit,
            locations,
            numa_nodes: self.numa_nodes.clone(),
            default_medium_name: self.default_medium.clone(),
            max_consecutive_job_aborts: self.max_consecutive_job_aborts,
            max_consecutive_gpu_job_failures: self.max_consecutive_gpu_job_failures,
            disable_jobs_timeout: self.disable_jobs_timeout,
            disable_jobs_on_gpu_check_failure: self.disable_jobs_on_gpu_check_failure,
            idle_cpu_fraction: self.idle_cpu_fraction,
            testing: TestingConfig {
                skip_job_proxy_unavailable_alert: self.skip_job_proxy_unavailable_alert,
            },
            ..SlotManagerConfig::default()
        };

        let manager = SlotManager::new(config);
        manager.initialize().unwrap();

        {
            let manager = manager.clone();
            assert_eventually(
                move || {
                    let manager = manager.clone();
                    async move { manager.is_initialized() }
                },
                Duration::from_secs(5),
                "manager failed to initialize",
            )
            .await;
        }

        if self.run_init_media {
            manager.init_media(&medium_directory).unwrap();
        }
        if self.report_job_proxy {
            manager.on_job_proxy_build_info_updated(Ok(()));
        }

        TestManager {
            manager,
            medium_directory,
            location_dirs,
        }
    }
}

pub fn disk_request(disk_space: i64, medium_index: Option<i32>) -> DiskRequest {
    DiskRequest {
        disk_space,
        medium_index,
    }
}

pub fn cpu_request(cpu: f64, allow_cpu_idle_policy: bool) -> CpuRequest {
    CpuRequest {
        cpu,
        allow_cpu_idle_policy,
    }
}

/// Reads a counter from the manager's introspection document.
pub fn orchid_u64(manager: &SlotManager, key: &str) -> u64 {
    manager.build_orchid()[key].as_u64().unwrap()
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(10)).await;
    assert!(result, "{}", message);
}

//! The slot manager: decides whether this node can host an incoming job and,
//! if so, reserves the resources the job will consume (a slot index, a disk
//! location, a CPU pool budget, and optional NUMA affinity). It also operates
//! the node's health gate: a fixed set of named alerts whose state determines
//! whether the node advertises capacity.
//!
//! Allocator state is serialized: acquires mutate it under one mutex, and
//! releases are posted onto a queue drained by a single task that takes the
//! same mutex, so acquire/release pairs are totally ordered.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::alerts::{AlertBoard, AlertKind};
use crate::config::{DynamicConfig, JobEnvironmentKind, SlotManagerConfig};
use crate::environment::{create_job_environment, JobEnvironment};
use crate::error::{Result, SlotError};
use crate::job::{FinishedJob, JobKind, JobState};
use crate::medium::{MediumDirectory, GENERIC_MEDIUM_INDEX};
use crate::slots::location::{DiskResources, SlotLocation};
use crate::slots::numa::{NumaNodeInfo, NumaNodeState};
use crate::slots::slot::{create_slot, Slot};
use crate::slots::SlotType;
use crate::volume::VolumeManager;

/// Disk demand of an acquire request. Without an explicit medium the
/// default medium bound by `init_media` applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskRequest {
    pub disk_space: i64,
    pub medium_index: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
pub struct CpuRequest {
    pub cpu: f64,
    pub allow_cpu_idle_policy: bool,
}

/// Aggregated per-location disk accounting reported to the cluster.
#[derive(Debug, Clone, Serialize)]
pub struct NodeDiskResources {
    pub default_medium_index: Option<i32>,
    pub locations: Vec<DiskResources>,
}

struct AllocatorState {
    free_slots: BTreeSet<usize>,
    alive_locations: Vec<Arc<SlotLocation>>,
    numa_node_states: Vec<NumaNodeState>,
    used_idle_slot_count: usize,
    idle_policy_requested_cpu: f64,
    default_medium_index: Option<i32>,
}

/// Alert table plus the consecutive-failure counters it gates; one critical
/// section so threshold checks and alert transitions cannot tear.
struct AlertState {
    board: AlertBoard,
    consecutive_aborted_scheduler_job_count: usize,
    consecutive_failed_gpu_job_count: usize,
}

pub(crate) struct SlotRelease {
    slot_type: SlotType,
    slot_index: usize,
    requested_cpu: f64,
    numa_node_id: Option<i64>,
}

struct Inner {
    config: SlotManagerConfig,
    node_tag: String,
    environment: Arc<dyn JobEnvironment>,
    allocator: Mutex<AllocatorState>,
    alerts: Mutex<AlertState>,
    locations: RwLock<Vec<Arc<SlotLocation>>>,
    dynamic_config: RwLock<Arc<DynamicConfig>>,
    volume_manager: RwLock<Option<Arc<VolumeManager>>>,
    initialized: AtomicBool,
    job_proxy_ready: AtomicBool,
    release_tx: mpsc::UnboundedSender<SlotRelease>,
    release_rx: Mutex<Option<mpsc::UnboundedReceiver<SlotRelease>>>,
}

#[derive(Clone)]
pub struct SlotManager {
    inner: Arc<Inner>,
}

impl SlotManager {
    pub fn new(config: SlotManagerConfig) -> Self {
        let node_tag = config.node_tag();
        let environment = create_job_environment(&config.job_environment, &node_tag);
        Self::with_environment(config, environment)
    }

    /// Constructs the manager around a caller-provided environment
    /// implementation.
    pub fn with_environment(
        config: SlotManagerConfig,
        environment: Arc<dyn JobEnvironment>,
    ) -> Self {
        let node_tag = config.node_tag();
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                node_tag,
                environment,
                allocator: Mutex::new(AllocatorState {
                    free_slots: BTreeSet::new(),
                    alive_locations: Vec::new(),
                    numa_node_states: Vec::new(),
                    used_idle_slot_count: 0,
                    idle_policy_requested_cpu: 0.0,
                    default_medium_index: None,
                }),
                alerts: Mutex::new(AlertState {
                    board: AlertBoard::new(),
                    consecutive_aborted_scheduler_job_count: 0,
                    consecutive_failed_gpu_job_count: 0,
                }),
                locations: RwLock::new(Vec::new()),
                dynamic_config: RwLock::new(Arc::new(DynamicConfig::default())),
                volume_manager: RwLock::new(None),
                initialized: AtomicBool::new(false),
                job_proxy_ready: AtomicBool::new(false),
                release_tx,
                release_rx: Mutex::new(Some(release_rx)),
            }),
        }
    }

    /// Synchronous bring-up: seeds the free-slot pool, initializes the job
    /// environment, builds locations and the NUMA ledger, then hands off to
    /// asynchronous initialization. Call exactly once, inside the runtime.
    ///
    /// The environment must come up before locations are built: it removes
    /// leftover job processes that could still pin open files in sandboxes.
    pub fn initialize(&self) -> Result<()> {
        tracing::info!(
            slot_count = self.inner.config.slot_count,
            "Slot manager sync initialization started"
        );

        if let Some(rx) = self.inner.release_rx.lock().unwrap().take() {
            tokio::spawn(run_release_queue(Arc::downgrade(&self.inner), rx));
        }

        {
            let mut alloc = self.inner.allocator.lock().unwrap();
            alloc.free_slots = (0..self.inner.config.slot_count).collect();
        }

        self.inner.environment.init(
            self.inner.config.slot_count,
            self.inner.config.cpu_limit,
            self.idle_cpu_fraction(),
        )?;

        if !self.inner.environment.is_enabled() {
            tracing::info!("Job environment is disabled");
            return Ok(());
        }

        {
            let mut locations = self.inner.locations.write().unwrap();
            for (location_index, location_config) in
                self.inner.config.locations.iter().enumerate()
            {
                let directory_manager = self
                    .inner
                    .environment
                    .create_job_directory_manager(&location_config.path, location_index);
                locations.push(Arc::new(SlotLocation::new(
                    location_config.clone(),
                    format!("slot{location_index}"),
                    directory_manager,
                    self.inner.config.enable_tmpfs,
                    self.inner.config.slot_count,
                )));
            }
        }

        {
            let mut alloc = self.inner.allocator.lock().unwrap();
            alloc.numa_node_states = self
                .inner
                .config
                .numa_nodes
                .iter()
                .map(NumaNodeState::from_config)
                .collect();
        }

        tracing::info!("Slot manager sync initialization finished");

        let manager = self.clone();
        tokio::spawn(async move { manager.async_initialize().await });
        Ok(())
    }

    /// Initializes all locations concurrently, builds the root volume manager
    /// for the container environment, and refreshes the alive view. Marks the
    /// manager initialized at the end regardless of outcome; failures are
    /// recorded through [`SlotManager::disable`].
    async fn async_initialize(&self) {
        tracing::info!("Slot manager async initialization started");

        let locations = self.get_locations();
        let results =
            futures::future::join_all(locations.iter().map(|location| location.initialize()))
                .await;
        tracing::info!("Locations initialization finished");

        let failures: Vec<String> = results
            .iter()
            .filter_map(|result| result.as_ref().err())
            .map(|error| error.to_string())
            .collect();
        if !failures.is_empty() {
            self.disable(SlotError::LocationInit(failures.join("; ")));
        }

        if self.inner.environment.kind() == JobEnvironmentKind::Container {
            match VolumeManager::new(self.inner.config.volumes_path.clone()).await {
                Ok(volume_manager) => {
                    *self.inner.volume_manager.write().unwrap() = Some(volume_manager);
                }
                Err(error) => self.disable(error),
            }
        }

        self.update_alive_locations();

        tracing::info!("Slot manager async initialization finished");
        self.inner.initialized.store(true, Ordering::Release);
    }

    /// Recomputes the view of enabled locations used by the allocator.
    pub fn update_alive_locations(&self) {
        let alive: Vec<Arc<SlotLocation>> = self
            .get_locations()
            .into_iter()
            .filter(|location| location.is_enabled())
            .collect();
        self.inner.allocator.lock().unwrap().alive_locations = alive;
    }

    /// Reserves a slot for the given disk and CPU demand. On success the
    /// returned handle owns the slot index, the idle-pool budget, and the
    /// NUMA reservation; dropping it releases all three. On failure no state
    /// is mutated.
    pub fn acquire_slot(&self, disk_request: DiskRequest, cpu_request: CpuRequest) -> Result<Slot> {
        self.update_alive_locations();
        let mut alloc = self.inner.allocator.lock().unwrap();

        if alloc.free_slots.is_empty() {
            return Err(SlotError::SlotNotFound {
                alive_location_count: alloc.alive_locations.len(),
                feasible_location_count: 0,
                skipped_by_disk_space: 0,
                skipped_by_medium: 0,
            });
        }

        let mut feasible_location_count = 0;
        let mut skipped_by_disk_space = 0;
        let mut skipped_by_medium = 0;
        let mut best_location: Option<Arc<SlotLocation>> = None;
        for location in &alloc.alive_locations {
            let resources = location.disk_resources();
            if resources.usage + disk_request.disk_space > resources.limit {
                skipped_by_disk_space += 1;
                continue;
            }
            let wanted_medium = disk_request.medium_index.or(alloc.default_medium_index);
            if wanted_medium != Some(resources.medium_index) {
                skipped_by_medium += 1;
                continue;
            }
            feasible_location_count += 1;
            let better = match &best_location {
                Some(best) => best.session_count() > location.session_count(),
                None => true,
            };
            if better {
                best_location = Some(Arc::clone(location));
            }
        }

        let Some(location) = best_location else {
            return Err(SlotError::SlotNotFound {
                alive_location_count: alloc.alive_locations.len(),
                feasible_location_count,
                skipped_by_disk_space,
                skipped_by_medium,
            });
        };

        let mut slot_type = SlotType::Common;
        if cpu_request.allow_cpu_idle_policy {
            let idle_limit = self.inner.environment.cpu_limit(SlotType::Idle);
            if alloc.idle_policy_requested_cpu + cpu_request.cpu <= idle_limit {
                slot_type = SlotType::Idle;
                alloc.idle_policy_requested_cpu += cpu_request.cpu;
                alloc.used_idle_slot_count += 1;
            }
        }

        let mut numa_affinity: Option<NumaNodeInfo> = None;
        if self.enable_numa_node_scheduling() && !alloc.numa_node_states.is_empty() {
            if let Some(best) = alloc.numa_node_states.iter_mut().max_by(|a, b| {
                a.free_cpu_count
                    .partial_cmp(&b.free_cpu_count)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }) {
                if best.free_cpu_count >= cpu_request.cpu {
                    numa_affinity = Some(best.info.clone());
                    best.free_cpu_count -= cpu_request.cpu;
                }
            }
        }

        let slot_index = do_acquire_slot(&mut alloc, slot_type);
        let guard = SlotGuard {
            release_tx: self.inner.release_tx.clone(),
            slot_type,
            requested_cpu: cpu_request.cpu,
            numa_node_id: numa_affinity.as_ref().map(|info| info.numa_node_id),
            slot_index,
        };
        drop(alloc);

        Ok(create_slot(
            guard,
            location,
            Arc::clone(&self.inner.environment),
            self.inner.volume_manager.read().unwrap().clone(),
            self.inner.node_tag.clone(),
            slot_type,
            cpu_request.cpu,
            disk_request,
            numa_affinity,
        ))
    }

    pub fn get_slot_count(&self) -> usize {
        self.inner.config.slot_count
    }

    pub fn get_used_slot_count(&self) -> usize {
        let alloc = self.inner.allocator.lock().unwrap();
        self.inner.config.slot_count - alloc.free_slots.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    pub fn is_job_proxy_ready(&self) -> bool {
        self.inner.job_proxy_ready.load(Ordering::Acquire)
    }

    /// Whether this node currently advertises itself as willing to accept
    /// more work.
    pub fn is_enabled(&self) -> bool {
        let alive_locations_nonempty =
            !self.inner.allocator.lock().unwrap().alive_locations.is_empty();
        let enabled = self.inner.job_proxy_ready.load(Ordering::Acquire)
            && self.inner.initialized.load(Ordering::Acquire)
            && self.inner.config.slot_count > 0
            && alive_locations_nonempty
            && self.inner.environment.is_enabled();

        let alerts = self.inner.alerts.lock().unwrap();
        enabled
            && !alerts
                .board
                .has_disabling_alert(self.disable_jobs_on_gpu_check_failure())
    }

    pub fn has_fatal_alert(&self) -> bool {
        self.inner.alerts.lock().unwrap().board.has_fatal()
    }

    pub fn reset_alert(&self, kind: AlertKind) {
        self.inner.alerts.lock().unwrap().board.reset(kind);
    }

    pub fn populate_alerts(&self, out: &mut Vec<SlotError>) {
        self.inner.alerts.lock().unwrap().board.populate(out);
    }

    /// Snapshot of the location registry.
    pub fn get_locations(&self) -> Vec<Arc<SlotLocation>> {
        self.inner.locations.read().unwrap().clone()
    }

    pub fn environment(&self) -> Arc<dyn JobEnvironment> {
        Arc::clone(&self.inner.environment)
    }

    pub fn volume_manager(&self) -> Option<Arc<VolumeManager>> {
        self.inner.volume_manager.read().unwrap().clone()
    }

    pub fn get_major_page_fault_count(&self) -> Result<i64> {
        self.inner.environment.major_page_fault_count()
    }

    pub fn node_tag(&self) -> String {
        self.inner.node_tag.clone()
    }

    pub fn idle_cpu_fraction(&self) -> f64 {
        self.dynamic_config()
            .idle_cpu_fraction
            .unwrap_or(self.inner.config.idle_cpu_fraction)
    }

    pub fn disable_jobs_on_gpu_check_failure(&self) -> bool {
        self.dynamic_config()
            .disable_jobs_on_gpu_check_failure
            .unwrap_or(self.inner.config.disable_jobs_on_gpu_check_failure)
    }

    pub fn enable_numa_node_scheduling(&self) -> bool {
        self.dynamic_config().enable_numa_node_scheduling
    }

    fn dynamic_config(&self) -> Arc<DynamicConfig> {
        self.inner.dynamic_config.read().unwrap().clone()
    }

    /// Installs a new dynamic-config snapshot and pushes the derived effects
    /// down into the environment.
    pub fn update_dynamic_config(&self, new_config: DynamicConfig) {
        let new_config = Arc::new(new_config);
        let old_config = {
            let mut slot = self.inner.dynamic_config.write().unwrap();
            std::mem::replace(&mut *slot, Arc::clone(&new_config))
        };

        self.inner
            .environment
            .update_idle_cpu_fraction(self.idle_cpu_fraction());

        if old_config.enable_numa_node_scheduling && !new_config.enable_numa_node_scheduling {
            if let Err(error) = self
                .inner
                .environment
                .clear_slot_cpu_sets(self.inner.config.slot_count)
            {
                tracing::warn!(error = %error, "Failed to clear slot cpu sets");
            }
        }
    }

    /// Applies dynamic-config snapshots published on the given channel until
    /// the manager is dropped.
    pub fn subscribe_dynamic_config(&self, mut rx: watch::Receiver<DynamicConfig>) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(inner) = inner.upgrade() else { break };
                let config = rx.borrow_and_update().clone();
                SlotManager { inner }.update_dynamic_config(config);
            }
        });
    }

    pub fn on_jobs_cpu_limit_updated(&self, cpu_limit: f64) {
        if let Err(error) = self.inner.environment.update_cpu_limit(cpu_limit) {
            tracing::warn!(error = %error, "Error updating job environment CPU limit");
        }
    }

    /// Forwards CPU-limit updates from the node resource manager to the
    /// environment.
    pub fn subscribe_jobs_cpu_limit_updates(&self, mut rx: watch::Receiver<f64>) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(inner) = inner.upgrade() else { break };
                let cpu_limit = *rx.borrow_and_update();
                SlotManager { inner }.on_jobs_cpu_limit_updated(cpu_limit);
            }
        });
    }

    /// Installs a fatal alert. The first failure wins; later calls are
    /// ignored so the original cause is preserved.
    pub fn disable(&self, error: SlotError) {
        let mut alerts = self.inner.alerts.lock().unwrap();
        if alerts.board.get(AlertKind::GenericPersistentError).is_some() {
            return;
        }
        let wrapped = SlotError::SchedulerJobsDisabled(Box::new(error));
        tracing::warn!(error = %wrapped, "Disabling slot manager");
        alerts.board.set(AlertKind::GenericPersistentError, wrapped);
    }

    /// Feeds terminal job states into the consecutive-failure suppression
    /// policies.
    pub fn on_job_finished(&self, job: &FinishedJob) {
        let mut alerts = self.inner.alerts.lock().unwrap();

        if job.kind == JobKind::Scheduler && job.state == JobState::Aborted {
            alerts.consecutive_aborted_scheduler_job_count += 1;
        } else {
            alerts.consecutive_aborted_scheduler_job_count = 0;
        }

        if alerts.consecutive_aborted_scheduler_job_count
            > self.inner.config.max_consecutive_job_aborts
            && alerts
                .board
                .get(AlertKind::TooManyConsecutiveJobAbortions)
                .is_none()
        {
            let delay = self.jittered_disable_delay();
            let error = SlotError::TooManyConsecutiveJobAbortions {
                max: self.inner.config.max_consecutive_job_aborts,
            };
            tracing::warn!(
                error = %error,
                until = %disabled_until(delay),
                "Scheduler jobs disabled"
            );
            alerts
                .board
                .set(AlertKind::TooManyConsecutiveJobAbortions, error);
            self.schedule_alert_reset(delay, ResetTarget::AbortedJobs);
        }

        if job.gpu_requested {
            if job.state == JobState::Failed {
                alerts.consecutive_failed_gpu_job_count += 1;
            } else {
                alerts.consecutive_failed_gpu_job_count = 0;
            }

            if alerts.consecutive_failed_gpu_job_count
                > self.inner.config.max_consecutive_gpu_job_failures
                && alerts
                    .board
                    .get(AlertKind::TooManyConsecutiveGpuJobFailures)
                    .is_none()
            {
                let delay = self.jittered_disable_delay();
                let error = SlotError::TooManyConsecutiveGpuJobFailures {
                    max: self.inner.config.max_consecutive_gpu_job_failures,
                };
                tracing::warn!(
                    error = %error,
                    until = %disabled_until(delay),
                    "Scheduler jobs disabled"
                );
                alerts
                    .board
                    .set(AlertKind::TooManyConsecutiveGpuJobFailures, error);
                self.schedule_alert_reset(delay, ResetTarget::GpuJobs);
            }
        }
    }

    /// Latest job-proxy build status. An `Ok` clears the alert, an `Err`
    /// raises it. Also marks the job proxy as ready; that flag is sticky and
    /// never reverts, even if later updates carry errors.
    pub fn on_job_proxy_build_info_updated(&self, update: std::result::Result<(), SlotError>) {
        if !self.inner.config.testing.skip_job_proxy_unavailable_alert {
            let mut alerts = self.inner.alerts.lock().unwrap();
            let stored_ok = alerts.board.get(AlertKind::JobProxyUnavailable).is_none();
            match &update {
                Err(error) if stored_ok => {
                    tracing::info!(error = %error, "Disabling scheduler jobs due to job proxy unavailability");
                }
                Ok(()) if !stored_ok => {
                    tracing::info!("Enabling scheduler jobs as job proxy became available");
                }
                _ => {}
            }
            match update {
                Err(error) => alerts.board.set(
                    AlertKind::JobProxyUnavailable,
                    SlotError::JobProxyUnavailable(error.to_string()),
                ),
                Ok(()) => alerts.board.reset(AlertKind::JobProxyUnavailable),
            }
        }
        self.inner.job_proxy_ready.store(true, Ordering::Release);
    }

    pub fn on_gpu_check_command_failed(&self, error: SlotError) {
        tracing::warn!(
            error = %error,
            "GPU check failed alert set, jobs may be disabled if disable_jobs_on_gpu_check_failure is in effect"
        );
        self.inner
            .alerts
            .lock()
            .unwrap()
            .board
            .set(AlertKind::GpuCheckFailed, error);
    }

    pub fn reset_consecutive_aborted_job_count(&self) {
        let mut alerts = self.inner.alerts.lock().unwrap();
        alerts.board.reset(AlertKind::TooManyConsecutiveJobAbortions);
        alerts.consecutive_aborted_scheduler_job_count = 0;
    }

    pub fn reset_consecutive_failed_gpu_job_count(&self) {
        let mut alerts = self.inner.alerts.lock().unwrap();
        alerts
            .board
            .reset(AlertKind::TooManyConsecutiveGpuJobFailures);
        alerts.consecutive_failed_gpu_job_count = 0;
    }

    /// Binds media to locations and resolves the default medium index.
    /// A location's medium index may not change once assigned, other than
    /// from the generic placeholder.
    pub fn init_media(&self, directory: &MediumDirectory) -> Result<()> {
        for location in self.get_locations() {
            let old_descriptor = location.medium_descriptor();
            let new_descriptor = directory
                .find_by_name(location.medium_name())
                .ok_or_else(|| SlotError::UnknownMedium {
                    location_id: location.id().to_string(),
                    medium_name: location.medium_name().to_string(),
                })?;
            if old_descriptor.index != GENERIC_MEDIUM_INDEX
                && old_descriptor.index != new_descriptor.index
            {
                return Err(SlotError::MediumIndexChanged {
                    medium_name: location.medium_name().to_string(),
                    old_index: old_descriptor.index,
                    new_index: new_descriptor.index,
                });
            }
            location.set_medium_descriptor(new_descriptor.clone());
            if let Err(error) = location.update_disk_resources() {
                tracing::warn!(location = %location.id(), error = %error, "Failed to refresh location disk resources");
            }
        }

        let default_descriptor = directory
            .find_by_name(&self.inner.config.default_medium_name)
            .ok_or_else(|| SlotError::UnknownDefaultMedium {
                medium_name: self.inner.config.default_medium_name.clone(),
            })?;
        self.inner.allocator.lock().unwrap().default_medium_index =
            Some(default_descriptor.index);
        Ok(())
    }

    /// Per-location disk accounting over the alive view. A location that
    /// fails to report is disabled with the captured error and omitted.
    pub fn get_disk_resources(&self) -> NodeDiskResources {
        self.update_alive_locations();
        let (alive, default_medium_index) = {
            let alloc = self.inner.allocator.lock().unwrap();
            (alloc.alive_locations.clone(), alloc.default_medium_index)
        };

        let mut locations = Vec::new();
        for location in alive {
            match location.refreshed_disk_resources() {
                Ok(info) => locations.push(info),
                Err(error) => {
                    location.disable(SlotError::LocationDisabled {
                        location_id: location.id().to_string(),
                        reason: format!("Failed to get location disk info: {error}"),
                    });
                }
            }
        }

        NodeDiskResources {
            default_medium_index,
            locations,
        }
    }

    /// Structured introspection document. Map keys render in sorted order,
    /// so the output is stable for a given state.
    pub fn build_orchid(&self) -> serde_json::Value {
        let mut root = serde_json::Map::new();
        {
            let alloc = self.inner.allocator.lock().unwrap();
            let alerts = self.inner.alerts.lock().unwrap();

            root.insert("slot_count".into(), json!(self.inner.config.slot_count));
            root.insert("free_slot_count".into(), json!(alloc.free_slots.len()));
            root.insert(
                "used_idle_slot_count".into(),
                json!(alloc.used_idle_slot_count),
            );
            root.insert(
                "idle_policy_requested_cpu".into(),
                json!(alloc.idle_policy_requested_cpu),
            );

            let mut numa_node_states = serde_json::Map::new();
            for state in &alloc.numa_node_states {
                numa_node_states.insert(
                    format!("node_{}", state.info.numa_node_id),
                    json!({
                        "free_cpu_count": state.free_cpu_count,
                        "cpu_set": state.info.cpu_set,
                    }),
                );
            }
            root.insert(
                "numa_node_states".into(),
                serde_json::Value::Object(numa_node_states),
            );

            let mut alert_values = serde_json::Map::new();
            for kind in AlertKind::ALL {
                if let Some(error) = alerts.board.get(kind) {
                    alert_values.insert(kind.as_str().to_string(), json!(error.to_string()));
                }
            }
            root.insert("alerts".into(), serde_json::Value::Object(alert_values));
        }

        if let Some(volume_manager) = self.volume_manager() {
            root.insert("root_volume_manager".into(), volume_manager.build_orchid());
        }

        serde_json::Value::Object(root)
    }

    fn schedule_alert_reset(&self, delay: Duration, target: ResetTarget) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = inner.upgrade() else { return };
            let manager = SlotManager { inner };
            match target {
                ResetTarget::AbortedJobs => manager.reset_consecutive_aborted_job_count(),
                ResetTarget::GpuJobs => manager.reset_consecutive_failed_gpu_job_count(),
            }
        });
    }

    /// Base timeout plus a uniform random extra in `[0, timeout)`, so a fleet
    /// of nodes does not recover in lockstep.
    fn jittered_disable_delay(&self) -> Duration {
        let base = self.inner.config.disable_jobs_timeout;
        let base_ms = base.as_millis() as u64;
        let jitter_ms = if base_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..base_ms)
        };
        base + Duration::from_millis(jitter_ms)
    }
}

#[derive(Clone, Copy)]
enum ResetTarget {
    AbortedJobs,
    GpuJobs,
}

fn disabled_until(delay: Duration) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

fn do_acquire_slot(alloc: &mut AllocatorState, slot_type: SlotType) -> usize {
    let slot_index = *alloc
        .free_slots
        .iter()
        .next()
        .expect("free slot pool is empty");
    alloc.free_slots.remove(&slot_index);
    tracing::debug!(slot_type = %slot_type, slot_index, "Exec slot acquired");
    slot_index
}

/// Scoped ownership of one slot index plus its idle-pool and NUMA
/// reservations. Dropping the guard posts the release onto the job-control
/// queue; the bookkeeping runs there, serialized with acquires, so callers
/// observe release latency.
pub struct SlotGuard {
    release_tx: mpsc::UnboundedSender<SlotRelease>,
    slot_type: SlotType,
    requested_cpu: f64,
    numa_node_id: Option<i64>,
    slot_index: usize,
}

impl SlotGuard {
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    pub fn slot_type(&self) -> SlotType {
        self.slot_type
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // A send error means the queue was torn down at shutdown; the
        // release is dropped along with the rest of the process.
        let _ = self.release_tx.send(SlotRelease {
            slot_type: self.slot_type,
            slot_index: self.slot_index,
            requested_cpu: self.requested_cpu,
            numa_node_id: self.numa_node_id,
        });
    }
}

async fn run_release_queue(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<SlotRelease>) {
    while let Some(release) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        let mut alloc = inner.allocator.lock().unwrap();

        let inserted = alloc.free_slots.insert(release.slot_index);
        assert!(inserted, "slot {} released twice", release.slot_index);

        if release.slot_type == SlotType::Idle {
            alloc.used_idle_slot_count -= 1;
            alloc.idle_policy_requested_cpu -= release.requested_cpu;
        }

        if let Some(numa_node_id) = release.numa_node_id {
            // The node may have been removed by a reconfiguration; the
            // add-back is dropped in that case.
            if let Some(state) = alloc
                .numa_node_states
                .iter_mut()
                .find(|state| state.info.numa_node_id == numa_node_id)
            {
                state.free_cpu_count =
                    (state.free_cpu_count + release.requested_cpu).min(state.cpu_count);
            }
        }

        tracing::debug!(
            slot_type = %release.slot_type,
            slot_index = release.slot_index,
            requested_cpu = release.requested_cpu,
            "Exec slot released"
        );
    }
}

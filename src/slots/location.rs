use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::LocationConfig;
use crate::environment::JobDirectoryManager;
use crate::error::{Result, SlotError};
use crate::medium::MediumDescriptor;

/// Disk limit assumed for locations without a configured quota.
const DEFAULT_DISK_LIMIT: i64 = 10 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DiskResources {
    pub usage: i64,
    pub limit: i64,
    pub medium_index: i32,
}

#[derive(Debug)]
struct LocationState {
    medium_descriptor: MediumDescriptor,
    scanned_usage: i64,
    limit: i64,
    error: Option<SlotError>,
}

/// A filesystem mountpoint backing job sandboxes.
///
/// Created during the manager's synchronous initialization and initialized
/// asynchronously. A location may transition to disabled on its own (disk
/// fault) without affecting its siblings.
pub struct SlotLocation {
    id: String,
    config: LocationConfig,
    directory_manager: JobDirectoryManager,
    enabled: AtomicBool,
    state: Mutex<LocationState>,
    session_count: AtomicUsize,
    /// Disk space reserved by live sessions, counted into usage.
    reserved: AtomicI64,
    enable_tmpfs: bool,
    slot_count: usize,
}

impl SlotLocation {
    pub fn new(
        config: LocationConfig,
        id: String,
        directory_manager: JobDirectoryManager,
        enable_tmpfs: bool,
        slot_count: usize,
    ) -> Self {
        let limit = config.disk_quota.unwrap_or(DEFAULT_DISK_LIMIT);
        Self {
            id,
            config,
            directory_manager,
            enabled: AtomicBool::new(false),
            state: Mutex::new(LocationState {
                medium_descriptor: MediumDescriptor::generic(),
                scanned_usage: 0,
                limit,
                error: None,
            }),
            session_count: AtomicUsize::new(0),
            reserved: AtomicI64::new(0),
            enable_tmpfs,
            slot_count,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn medium_name(&self) -> &str {
        &self.config.medium_name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Creates the sandbox directory tree and takes the first disk
    /// measurement. Enables the location on success.
    pub async fn initialize(&self) -> Result<()> {
        tracing::info!(location = %self.id, path = %self.config.path.display(), "Location initialization started");

        let result = self.do_initialize().await;
        match result {
            Ok(()) => {
                self.enabled.store(true, Ordering::Release);
                tracing::info!(location = %self.id, "Location initialization finished");
                Ok(())
            }
            Err(e) => {
                self.disable(e.clone());
                Err(e)
            }
        }
    }

    async fn do_initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.path).await?;
        self.directory_manager.create_base()?;
        for slot_index in 0..self.slot_count {
            let sandbox = self.directory_manager.prepare_slot_dir(slot_index)?;
            if self.enable_tmpfs {
                // The tmp subtree is the mountpoint handed to the
                // environment's tmpfs setup.
                std::fs::create_dir_all(sandbox.join("tmp"))?;
            }
        }
        self.update_disk_resources()?;
        Ok(())
    }

    /// Takes the location out of rotation with the given cause. Keeps the
    /// first recorded error.
    pub fn disable(&self, error: SlotError) {
        let was_enabled = self.enabled.swap(false, Ordering::AcqRel);
        let mut state = self.state.lock().unwrap();
        if state.error.is_none() {
            state.error = Some(error.clone());
        }
        if was_enabled {
            tracing::warn!(location = %self.id, error = %error, "Location disabled");
        }
    }

    pub fn error(&self) -> Option<SlotError> {
        self.state.lock().unwrap().error.clone()
    }

    pub fn medium_descriptor(&self) -> MediumDescriptor {
        self.state.lock().unwrap().medium_descriptor.clone()
    }

    pub fn set_medium_descriptor(&self, descriptor: MediumDescriptor) {
        self.state.lock().unwrap().medium_descriptor = descriptor;
    }

    /// Rescans the location directory and refreshes the cached usage.
    pub fn update_disk_resources(&self) -> Result<()> {
        let scanned = scan_dir_size(&self.config.path)?;
        let mut state = self.state.lock().unwrap();
        state.scanned_usage = scanned;
        state.limit = self.config.disk_quota.unwrap_or(DEFAULT_DISK_LIMIT);
        Ok(())
    }

    /// Cached disk accounting; live session reservations count into usage.
    pub fn disk_resources(&self) -> DiskResources {
        let state = self.state.lock().unwrap();
        DiskResources {
            usage: state.scanned_usage + self.reserved.load(Ordering::Acquire),
            limit: state.limit,
            medium_index: state.medium_descriptor.index,
        }
    }

    /// Rescan-then-read variant used by disk reporting; the rescan may fail
    /// if the backing filesystem went away.
    pub fn refreshed_disk_resources(&self) -> Result<DiskResources> {
        self.update_disk_resources()?;
        Ok(self.disk_resources())
    }

    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Acquire)
    }

    pub(crate) fn begin_session(self: &Arc<Self>, disk_space: i64) -> LocationSession {
        self.session_count.fetch_add(1, Ordering::AcqRel);
        self.reserved.fetch_add(disk_space, Ordering::AcqRel);
        LocationSession {
            location: Arc::clone(self),
            disk_space,
        }
    }

    pub fn sandbox_path(&self, slot_index: usize) -> PathBuf {
        self.directory_manager.slot_path(slot_index)
    }

    pub fn prepare_sandbox(&self, slot_index: usize) -> Result<PathBuf> {
        self.directory_manager.prepare_slot_dir(slot_index)
    }
}

/// Scoped reservation of a sandbox session on a location.
pub struct LocationSession {
    location: Arc<SlotLocation>,
    disk_space: i64,
}

impl Drop for LocationSession {
    fn drop(&mut self) {
        self.location.session_count.fetch_sub(1, Ordering::AcqRel);
        self.location
            .reserved
            .fetch_sub(self.disk_space, Ordering::AcqRel);
    }
}

fn scan_dir_size(path: &Path) -> Result<i64> {
    let mut total = 0i64;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += scan_dir_size(&entry.path())?;
        } else {
            total += metadata.len() as i64;
        }
    }
    Ok(total)
}

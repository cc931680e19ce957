use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::environment::JobEnvironment;
use crate::error::Result;
use crate::slots::location::{LocationSession, SlotLocation};
use crate::slots::manager::{DiskRequest, SlotGuard};
use crate::slots::numa::NumaNodeInfo;
use crate::slots::SlotType;
use crate::volume::VolumeManager;

#[allow(clippy::too_many_arguments)]
pub(crate) fn create_slot(
    guard: SlotGuard,
    location: Arc<SlotLocation>,
    environment: Arc<dyn JobEnvironment>,
    volume_manager: Option<Arc<VolumeManager>>,
    node_tag: String,
    slot_type: SlotType,
    requested_cpu: f64,
    disk_request: DiskRequest,
    numa_affinity: Option<NumaNodeInfo>,
) -> Slot {
    let session = location.begin_session(disk_request.disk_space);
    let sandbox_path = location.sandbox_path(guard.slot_index());
    Slot {
        guard,
        _session: session,
        location,
        environment,
        volume_manager,
        node_tag,
        slot_type,
        requested_cpu,
        numa_affinity,
        sandbox_path,
    }
}

/// Handle to one reserved execution slot. Move-only; dropping it ends the
/// location session immediately and schedules the slot, idle-budget, and
/// NUMA release on the job-control queue.
pub struct Slot {
    guard: SlotGuard,
    _session: LocationSession,
    location: Arc<SlotLocation>,
    environment: Arc<dyn JobEnvironment>,
    volume_manager: Option<Arc<VolumeManager>>,
    node_tag: String,
    slot_type: SlotType,
    requested_cpu: f64,
    numa_affinity: Option<NumaNodeInfo>,
    sandbox_path: PathBuf,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("node_tag", &self.node_tag)
            .field("slot_type", &self.slot_type)
            .field("requested_cpu", &self.requested_cpu)
            .field("numa_affinity", &self.numa_affinity)
            .field("sandbox_path", &self.sandbox_path)
            .finish()
    }
}

impl Slot {
    pub fn slot_index(&self) -> usize {
        self.guard.slot_index()
    }

    pub fn slot_type(&self) -> SlotType {
        self.slot_type
    }

    pub fn requested_cpu(&self) -> f64 {
        self.requested_cpu
    }

    pub fn numa_affinity(&self) -> Option<&NumaNodeInfo> {
        self.numa_affinity.as_ref()
    }

    pub fn location(&self) -> &Arc<SlotLocation> {
        &self.location
    }

    pub fn environment(&self) -> &Arc<dyn JobEnvironment> {
        &self.environment
    }

    pub fn volume_manager(&self) -> Option<&Arc<VolumeManager>> {
        self.volume_manager.as_ref()
    }

    pub fn node_tag(&self) -> &str {
        &self.node_tag
    }

    pub fn sandbox_path(&self) -> &Path {
        &self.sandbox_path
    }

    /// Creates the sandbox directory tree for this slot.
    pub fn prepare_sandbox(&self) -> Result<PathBuf> {
        self.location.prepare_sandbox(self.slot_index())
    }

    /// Uid the job in this slot runs under.
    pub fn user_id(&self) -> u32 {
        self.environment.user_id(self.slot_index())
    }
}

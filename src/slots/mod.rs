pub mod location;
pub mod manager;
pub mod numa;
pub mod slot;

pub use location::{DiskResources, SlotLocation};
pub use manager::{CpuRequest, DiskRequest, NodeDiskResources, SlotManager};
pub use numa::{NumaNodeInfo, NumaNodeState};
pub use slot::Slot;

use serde::{Deserialize, Serialize};

/// Which CPU pool a slot draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotType {
    Common,
    Idle,
}

impl std::fmt::Display for SlotType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotType::Common => write!(f, "common"),
            SlotType::Idle => write!(f, "idle"),
        }
    }
}

use serde::{Deserialize, Serialize};

use crate::config::NumaNodeConfig;

/// Identity of a NUMA node a slot may be pinned to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumaNodeInfo {
    pub numa_node_id: i64,
    pub cpu_set: String,
}

/// Ledger entry: identity plus the CPU still available for new affinities.
/// `free_cpu_count` stays within `[0, cpu_count]`.
#[derive(Debug, Clone)]
pub struct NumaNodeState {
    pub info: NumaNodeInfo,
    pub cpu_count: f64,
    pub free_cpu_count: f64,
}

impl NumaNodeState {
    pub fn from_config(config: &NumaNodeConfig) -> Self {
        Self {
            info: NumaNodeInfo {
                numa_node_id: config.numa_node_id,
                cpu_set: config.cpu_set.clone(),
            },
            cpu_count: config.cpu_count,
            free_cpu_count: config.cpu_count,
        }
    }
}

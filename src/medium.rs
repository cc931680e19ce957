use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Index a location reports before media are bound. Real media never use it.
pub const GENERIC_MEDIUM_INDEX: i32 = 0;

/// A named storage tier (e.g. "ssd", "hdd") with its cluster-wide index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumDescriptor {
    pub name: String,
    pub index: i32,
}

impl MediumDescriptor {
    /// Placeholder descriptor carried by locations until `init_media` runs.
    pub fn generic() -> Self {
        Self {
            name: "generic".to_string(),
            index: GENERIC_MEDIUM_INDEX,
        }
    }
}

/// Resolves medium names to descriptors. Populated from cluster metadata by
/// the caller; the slot manager only consumes it.
#[derive(Debug, Default, Clone)]
pub struct MediumDirectory {
    by_name: HashMap<String, MediumDescriptor>,
}

impl MediumDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, index: i32) {
        let name = name.into();
        self.by_name.insert(
            name.clone(),
            MediumDescriptor { name, index },
        );
    }

    pub fn find_by_name(&self, name: &str) -> Option<&MediumDescriptor> {
        self.by_name.get(name)
    }
}

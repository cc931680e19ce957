use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;

use crate::error::{Result, SlotError};

/// Manages root filesystem volumes for the container job environment.
///
/// Constructed during the slot manager's asynchronous initialization, after
/// the environment has killed leftover processes, so stale volumes from a
/// previous incarnation can be removed safely. Opaque to callers afterwards,
/// apart from introspection.
pub struct VolumeManager {
    root: PathBuf,
    volume_count: AtomicUsize,
}

impl VolumeManager {
    pub async fn new(root: PathBuf) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| SlotError::VolumeManagerInit(e.to_string()))?;

        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| SlotError::VolumeManagerInit(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SlotError::VolumeManagerInit(e.to_string()))?
        {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                tokio::fs::remove_dir_all(entry.path())
                    .await
                    .map_err(|e| SlotError::VolumeManagerInit(e.to_string()))?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, root = %root.display(), "Removed stale root volumes");
        }

        Ok(Arc::new(Self {
            root,
            volume_count: AtomicUsize::new(0),
        }))
    }

    /// Allocates a fresh volume directory for a container root layer.
    pub fn create_volume(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        std::fs::create_dir_all(&path)?;
        self.volume_count.fetch_add(1, Ordering::Relaxed);
        Ok(path)
    }

    pub fn build_orchid(&self) -> serde_json::Value {
        json!({
            "root": self.root.display().to_string(),
            "volume_count": self.volume_count.load(Ordering::Relaxed),
        })
    }
}

pub mod models;
pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, warn};

impl Catalog {
    /// Load a persisted catalog; `None` when absent or unreadable
    pub fn load(path: &Path) -> Option<Catalog> {
        let data = std::fs::read(path).ok()?;
        match serde_json::from_slice::<Catalog>(&data) {
            Ok(catalog) => {
                debug!(
                    "Loaded catalog with {} records from {:?}",
                    catalog.record_count(),
                    path
                );
                Some(catalog)
            }
            Err(e) => {
                warn!("Ignoring unreadable catalog {:?}: {}", path, e);
                None
            }
        }
    }

    /// Persist via temp file and rename so a crash never leaves half a catalog
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("json.tmp");
        let data = serde_json::to_vec(self)?;
        std::fs::write(&temp_path, data)
            .with_context(|| format!("Failed to write {:?}", temp_path))?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

//! Persisted string-keyed boolean cache
//!
//! Used for dead links: ROM URLs that answered 404 are not requested again.

use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEAD_LINKS_FILE: &str = "deadLinks.json";

pub struct BoolCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, bool>>,
    dirty: Mutex<bool>,
}

impl BoolCache {
    /// Load from `path`; a missing or corrupt file yields an empty cache
    pub fn load(path: &Path) -> Self {
        let entries = match std::fs::read(path) {
            Ok(data) => match serde_json::from_slice::<HashMap<String, bool>>(&data) {
                Ok(entries) => {
                    debug!("Loaded {} cached flags from {:?}", entries.len(), path);
                    entries
                }
                Err(e) => {
                    warn!("Discarding corrupt cache {:?}: {}", path, e);
                    let _ = std::fs::remove_file(path);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
            dirty: Mutex::new(false),
        }
    }

    /// Dead-link cache under a cache root
    pub fn dead_links(root: &Path) -> Self {
        Self::load(&root.join(DEAD_LINKS_FILE))
    }

    pub fn get(&self, key: &str) -> Option<bool> {
        self.entries.lock().ok()?.get(key).copied()
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.get(key).unwrap_or(false)
    }

    pub fn set(&self, key: &str, value: bool) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.insert(key.to_string(), value) != Some(value) {
                if let Ok(mut dirty) = self.dirty.lock() {
                    *dirty = true;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write back if anything changed since load or the last save
    pub fn save(&self) -> Result<()> {
        let mut dirty = self
            .dirty
            .lock()
            .map_err(|_| anyhow::anyhow!("cache lock poisoned"))?;
        if !*dirty {
            return Ok(());
        }
        let data = {
            let entries = self
                .entries
                .lock()
                .map_err(|_| anyhow::anyhow!("cache lock poisoned"))?;
            serde_json::to_vec_pretty(&*entries)?
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, data)?;
        *dirty = false;
        info!("Saved {} cached flags to {:?}", self.len(), self.path);
        Ok(())
    }
}

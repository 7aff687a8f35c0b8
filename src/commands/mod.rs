//! Command handlers behind the `arcadesync` binary

pub mod audit;
pub mod export;
pub mod log;
pub mod plan;
pub mod update;

use crate::config::UpdateSettings;
use crate::core::CacheStore;
use crate::db::Catalog;
use crate::AppContext;
use anyhow::Result;

/// Cache store for the configured (or default) cache root
pub fn cache_store(ctx: &AppContext, settings: &UpdateSettings) -> CacheStore {
    let root = settings
        .cache_root
        .clone()
        .unwrap_or_else(|| ctx.default_cache_root());
    CacheStore::new(root)
}

/// Catalog persisted by the last successful update
pub fn load_catalog(store: &CacheStore) -> Result<Catalog> {
    Catalog::load(&store.catalog_path())
        .ok_or_else(|| anyhow::anyhow!("No catalog found, run `arcadesync update` first"))
}

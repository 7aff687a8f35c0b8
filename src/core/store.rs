//! On-disk cache layout and verification

use crate::core::plan::{Plan, PlanNode};
use crate::db::{CacheEntry, CacheStatus, Catalog};
use crate::error::SyncError;
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

pub const CACHE_DIR: &str = "gameCache";
pub const CATALOG_FILE: &str = "catalog.json";
pub const WARNING_FILE: &str = "DO_NOT_EDIT.txt";

const WARNING_TEXT: &str = "This directory is managed by arcadesync.\n\
Files here are verified against their source databases and replaced when they change.\n\
Edits will be overwritten or flagged as corrupt.\n";

/// `<root>/gameCache/<sourceId>/<relativePath>`
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

/// Result of checking a plan against the cache
#[derive(Debug, Clone)]
pub struct AuditReport {
    /// Copy of the plan with missing leaves and their ancestors marked
    pub plan: Plan,
    /// Entries that were `Ok` but have vanished from disk
    pub unexpectedly_missing: Vec<CacheEntry>,
    pub missing_leaves: usize,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_FILE)
    }

    pub fn path_for(&self, source_id: &str, relative_path: &str) -> PathBuf {
        relative_path
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.cache_dir().join(source_id), |acc, part| acc.join(part))
    }

    pub fn entry_path(&self, entry: &CacheEntry) -> PathBuf {
        self.path_for(&entry.source_id, &entry.relative_path)
    }

    /// Resolve a diff `src` (`<sourceId>/<relativePath>`)
    pub fn resolve(&self, cache_path: &str) -> PathBuf {
        match cache_path.split_once('/') {
            Some((source_id, relative)) => self.path_for(source_id, relative),
            None => self.cache_dir().join(cache_path),
        }
    }

    /// Create the cache directory and its warning marker. Returns true when the
    /// cache root did not exist before.
    pub async fn ensure_root(&self) -> Result<bool, SyncError> {
        let fresh = !fs::try_exists(&self.root).await?;
        fs::create_dir_all(self.cache_dir()).await?;
        let marker = self.cache_dir().join(WARNING_FILE);
        if !fs::try_exists(&marker).await? {
            fs::write(&marker, WARNING_TEXT).await?;
            debug!("Wrote cache marker {:?}", marker);
        }
        Ok(fresh)
    }

    pub async fn exists(&self, entry: &CacheEntry) -> bool {
        fs::try_exists(self.entry_path(entry)).await.unwrap_or(false)
    }

    /// Check the file on disk. Hashed kinds are compared by md5, ROMs by presence.
    pub async fn verify(&self, entry: &CacheEntry) -> CacheStatus {
        let path = self.entry_path(entry);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return CacheStatus::Missing;
        }
        let expected = match (&entry.content_hash, entry.kind.is_hashed()) {
            (Some(hash), true) => hash.to_lowercase(),
            _ => return CacheStatus::Ok,
        };
        match file_md5(&path).await {
            Ok(actual) if actual == expected => CacheStatus::Ok,
            Ok(actual) => {
                debug!(
                    "Hash mismatch for {}: expected {}, found {}",
                    entry.cache_key(),
                    expected,
                    actual
                );
                CacheStatus::Corrupt
            }
            Err(e) => {
                warn!("Failed to hash {:?}: {}", path, e);
                CacheStatus::Corrupt
            }
        }
    }

    /// Confirm every plan leaf still has its metadata file on disk
    pub async fn audit(&self, plan: &Plan, catalog: &Catalog) -> AuditReport {
        let mut missing: HashSet<(String, String)> = HashSet::new();
        let mut unexpectedly_missing = Vec::new();

        for leaf in plan.leaves() {
            let Some(record) = catalog.record(&leaf.source_id, &leaf.path) else {
                missing.insert((leaf.source_id, leaf.path));
                continue;
            };
            if self.exists(&record.mra).await {
                continue;
            }
            if record.mra.is_ok() {
                let mut entry = record.mra.clone();
                entry.status = CacheStatus::UnexpectedlyMissing;
                unexpectedly_missing.push(entry);
            }
            missing.insert((leaf.source_id, leaf.path));
        }

        let (children, _) = mark_nodes(&plan.children, &missing);
        if !missing.is_empty() {
            info!(
                "Audit of {}: {} missing leaves, {} vanished cache files",
                plan.name,
                missing.len(),
                unexpectedly_missing.len()
            );
        }
        AuditReport {
            plan: Plan {
                name: plan.name.clone(),
                children,
            },
            unexpectedly_missing,
            missing_leaves: missing.len(),
        }
    }
}

/// Rebuild nodes with leaf variants and `invalid_descendant` flags from `missing`
fn mark_nodes(nodes: &[PlanNode], missing: &HashSet<(String, String)>) -> (Vec<PlanNode>, bool) {
    let mut any_missing = false;
    let marked = nodes
        .iter()
        .map(|node| match node {
            PlanNode::Directory { name, children, .. } => {
                let (children, invalid) = mark_nodes(children, missing);
                any_missing |= invalid;
                PlanNode::Directory {
                    name: name.clone(),
                    children,
                    invalid_descendant: invalid,
                }
            }
            PlanNode::Leaf { source_id, path } | PlanNode::MissingLeaf { source_id, path } => {
                if missing.contains(&(source_id.clone(), path.clone())) {
                    any_missing = true;
                    PlanNode::MissingLeaf {
                        source_id: source_id.clone(),
                        path: path.clone(),
                    }
                } else {
                    PlanNode::leaf(source_id.clone(), path.clone())
                }
            }
        })
        .collect();
    (marked, any_missing)
}

/// Lowercase hex md5 of a file, hashed off the async runtime
pub async fn file_md5(path: &Path) -> Result<String, SyncError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String, SyncError> {
        let mut file = std::fs::File::open(&path)?;
        let mut context = md5::Context::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            context.consume(&buffer[..n]);
        }
        Ok(format!("{:x}", context.compute()))
    })
    .await
    .map_err(|e| SyncError::unknown(e.to_string()))?
}

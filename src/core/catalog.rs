//! Catalog builder: reconciles remote manifests into verified cache entries

use crate::config::UpdateSettings;
use crate::core::cache::BoolCache;
use crate::core::classifier::{classify, FileOperationKey};
use crate::core::fetcher::{Download, Downloader};
use crate::core::manifest::{DatabaseManifest, ManifestFetcher, MetadataTable};
use crate::core::mra::{read_mra, MraInfo};
use crate::core::store::CacheStore;
use crate::db::{
    CacheEntry, CacheStatus, Catalog, FileKind, FileUpdate, GameCatalogRecord, SourceRecords,
    UpdatePhase, UpdateReason, UpdateStatus,
};
use crate::error::{RunOutcome, SyncError};
use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Concurrent ROM downloads per window
pub const ROM_BATCH_SIZE: usize = 4;

/// Source id for ROMs fetched from the archive URL instead of a database
pub const ARCHIVE_SOURCE_ID: &str = "archive";

/// MRA slugs that do not match their metadata-table key
pub const SLUG_PATCHES: &[(&str, &str)] = &[
    ("1942-revision-b", "1942"),
    ("pac-man-midway", "puckman"),
    ("ms-pac-man", "mspacman"),
    ("donkey-kong-us-set-1", "dkong"),
    ("galaga-namco-rev-b", "galaga"),
    ("street-fighter-ii-the-world-warrior-world-910522", "sf2"),
];

/// Lowercase, non-alphanumeric runs collapsed to `-`
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Slug of an MRA path with the patch table applied
pub fn mra_slug(mra_path: &str) -> String {
    let file_name = mra_path.rsplit('/').next().unwrap_or(mra_path);
    let stem = match file_name.rsplit_once('.') {
        Some((stem, ext)) if ext.eq_ignore_ascii_case("mra") => stem,
        _ => file_name,
    };
    let slug = slugify(stem);
    SLUG_PATCHES
        .iter()
        .find(|(from, _)| *from == slug)
        .map(|(_, to)| to.to_string())
        .unwrap_or(slug)
}

struct SourceManifest {
    source_id: String,
    manifest: DatabaseManifest,
}

/// A file a record wants in the cache
struct FileRef {
    source_id: String,
    kind: FileKind,
    relative_path: String,
    hash: Option<String>,
    url: Option<String>,
}

impl FileRef {
    fn listed(source: &SourceManifest, kind: FileKind, path: &str) -> Self {
        let hash = match kind {
            FileKind::Rom => None,
            _ => source.manifest.file(path).map(|f| f.hash.to_lowercase()),
        };
        Self {
            source_id: source.source_id.clone(),
            kind,
            relative_path: path.to_string(),
            hash,
            url: Some(source.manifest.file_url(path)),
        }
    }

    fn entry(&self) -> CacheEntry {
        CacheEntry::new(
            &self.source_id,
            self.kind,
            &self.relative_path,
            self.hash.clone(),
            CacheStatus::Missing,
        )
    }
}

/// Per-run bookkeeping
struct RunState<'a> {
    fresh: bool,
    prior: Option<&'a Catalog>,
    progress: &'a Option<mpsc::Sender<UpdateStatus>>,
    cancel: &'a CancellationToken,
    updates: Vec<FileUpdate>,
    /// Status of every cache key already resolved in this run
    checked: HashMap<String, CacheStatus>,
    /// Cache keys downloaded in this run
    downloaded: HashSet<String>,
}

impl RunState<'_> {
    fn checkpoint(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        Ok(())
    }

    async fn send(&self, phase: UpdatePhase, message: impl Into<String>) {
        if let Some(tx) = self.progress {
            let _ = tx
                .send(UpdateStatus::progress(phase, message, self.fresh))
                .await;
        }
    }

    fn record_update(&mut self, entry: &CacheEntry, reason: UpdateReason) {
        self.updates.push(FileUpdate {
            source_id: entry.source_id.clone(),
            relative_path: entry.relative_path.clone(),
            kind: entry.kind,
            reason,
        });
    }

    /// Reuse a status resolved earlier in this run
    fn reuse(&mut self, entry: &mut CacheEntry) -> bool {
        let key = entry.cache_key();
        let Some(status) = self.checked.get(&key).copied() else {
            return false;
        };
        entry.status = status;
        if status == CacheStatus::Ok && self.downloaded.contains(&key) {
            self.record_update(entry, UpdateReason::Fulfilled);
        }
        true
    }

    fn mark(&mut self, entry: &CacheEntry) {
        self.checked.insert(entry.cache_key(), entry.status);
    }
}

/// Owns the current catalog. One builder per cache root; runs must not overlap.
pub struct CatalogBuilder {
    settings: UpdateSettings,
    store: CacheStore,
    downloader: Arc<dyn Downloader>,
    dead_links: BoolCache,
    current: watch::Sender<Option<Arc<Catalog>>>,
}

impl CatalogBuilder {
    /// Picks up the catalog persisted by a previous run, if any
    pub fn new(settings: UpdateSettings, store: CacheStore, downloader: Arc<dyn Downloader>) -> Self {
        let prior = Catalog::load(&store.catalog_path()).map(Arc::new);
        let dead_links = BoolCache::dead_links(store.root());
        let (current, _) = watch::channel(prior);
        Self {
            settings,
            store,
            downloader,
            dead_links,
            current,
        }
    }

    pub fn current(&self) -> Option<Arc<Catalog>> {
        self.current.borrow().clone()
    }

    /// Receiver that observes every published catalog
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Catalog>>> {
        self.current.subscribe()
    }

    /// Run one update cycle. Exactly one terminal status is sent on `progress`.
    pub async fn run_update(
        &self,
        progress: Option<mpsc::Sender<UpdateStatus>>,
        cancel: CancellationToken,
    ) -> RunOutcome<Arc<Catalog>> {
        let start = Instant::now();
        let prior = self.current();
        info!("Catalog update started");

        let mut run = RunState {
            fresh: prior.is_none(),
            prior: prior.as_deref(),
            progress: &progress,
            cancel: &cancel,
            updates: Vec::new(),
            checked: HashMap::new(),
            downloaded: HashSet::new(),
        };
        let result = self.build(&mut run).await;
        let fresh = run.fresh;
        let updates = std::mem::take(&mut run.updates);
        drop(run);

        if let Err(e) = self.dead_links.save() {
            warn!("Failed to save dead links: {}", e);
        }

        let duration = start.elapsed().as_secs_f64();
        let outcome: RunOutcome<(Arc<Catalog>, String)> = result.into();
        let mut status = UpdateStatus::progress(UpdatePhase::Complete, "", fresh);
        status.complete = true;
        status.duration = Some(duration);

        let outcome = match outcome {
            RunOutcome::Ok((catalog, message)) => {
                self.current.send_replace(Some(catalog.clone()));
                info!(
                    "Catalog update finished in {:.1}s: {} records, {} file updates",
                    duration,
                    catalog.record_count(),
                    updates.len()
                );
                status.message = message;
                status.catalog = Some(catalog.clone());
                status.updates = Some(updates);
                RunOutcome::Ok(catalog)
            }
            RunOutcome::Canceled => {
                info!("Catalog update canceled after {:.1}s", duration);
                status.phase = UpdatePhase::Canceled;
                status.message = "Update canceled".to_string();
                status.canceled = true;
                RunOutcome::Canceled
            }
            RunOutcome::Failed(e) => {
                error!("Catalog update failed: {}", e);
                status.phase = UpdatePhase::Failed;
                status.complete = false;
                status.message = e.to_string();
                status.error = Some((e.kind(), e.to_string()));
                RunOutcome::Failed(e)
            }
        };

        if let Some(tx) = &progress {
            let _ = tx.send(status).await;
        }
        outcome
    }

    async fn build(&self, run: &mut RunState<'_>) -> Result<(Arc<Catalog>, String), SyncError> {
        let root_fresh = self.store.ensure_root().await?;
        run.fresh = run.fresh && root_fresh;
        run.checkpoint()?;

        let sources: Vec<_> = self.settings.enabled_sources().cloned().collect();
        if sources.is_empty() {
            return Err(SyncError::unknown("No enabled sources"));
        }

        // manifests
        let fetcher = ManifestFetcher::new()?;
        let mut manifests = Vec::new();
        let mut failures: Vec<(String, SyncError)> = Vec::new();
        for source in &sources {
            run.send(
                UpdatePhase::FetchingManifest,
                format!("Fetching {} manifest", source.id),
            )
            .await;
            match fetcher
                .fetch_manifest(self.downloader.as_ref(), &source.id, &source.url)
                .await
            {
                Ok(manifest) => manifests.push(SourceManifest {
                    source_id: source.id.clone(),
                    manifest,
                }),
                Err(e) => {
                    warn!("Skipping source {}: {}", source.id, e);
                    failures.push((source.id.clone(), e));
                }
            }
            run.checkpoint()?;
        }
        if manifests.is_empty() {
            let message = failures
                .iter()
                .map(|(id, e)| format!("{}: {}", id, e))
                .collect::<Vec<_>>()
                .join("; ");
            let kind = failures.first().map(|(_, e)| e.clone());
            return Err(match kind {
                Some(SyncError::Network(_)) => SyncError::network(message),
                Some(SyncError::Format(_)) => SyncError::format(message),
                _ => SyncError::unknown(message),
            });
        }

        let metadata = match &self.settings.metadata_url {
            Some(url) => {
                run.send(UpdatePhase::FetchingManifest, "Fetching game metadata")
                    .await;
                fetcher
                    .fetch_metadata(self.downloader.as_ref(), url)
                    .await
                    .unwrap_or_else(|e| {
                        warn!("Metadata table unavailable, using MRA fields only: {}", e);
                        MetadataTable::new()
                    })
            }
            None => MetadataTable::new(),
        };
        run.checkpoint()?;

        // records, in configured source order
        let mut catalog_sources = Vec::with_capacity(sources.len());
        for source in &sources {
            match manifests.iter().find(|m| m.source_id == source.id) {
                Some(manifest) => {
                    let records = self.build_source(run, manifest, &manifests, &metadata).await?;
                    catalog_sources.push(SourceRecords {
                        source_id: source.id.clone(),
                        records,
                    });
                }
                None => {
                    let carried = run
                        .prior
                        .and_then(|p| p.source(&source.id))
                        .cloned()
                        .unwrap_or_else(|| SourceRecords {
                            source_id: source.id.clone(),
                            records: BTreeMap::new(),
                        });
                    debug!(
                        "Carrying forward {} records of {}",
                        carried.records.len(),
                        source.id
                    );
                    catalog_sources.push(carried);
                }
            }
        }

        run.send(UpdatePhase::Auditing, "Saving catalog").await;
        let catalog = Catalog {
            updated_at: Utc::now(),
            sources: catalog_sources,
        };
        log_summary(&catalog);
        catalog
            .save(&self.store.catalog_path())
            .map_err(|e| SyncError::file(format!("Failed to persist catalog: {:#}", e)))?;

        let mut message = format!(
            "{} games, {} files updated",
            catalog.record_count(),
            run.updates
                .iter()
                .filter(|u| u.reason != UpdateReason::Fulfilled)
                .count()
        );
        for (id, e) in &failures {
            message.push_str(&format!("; source {} failed: {}", id, e));
        }
        Ok((Arc::new(catalog), message))
    }

    async fn build_source(
        &self,
        run: &mut RunState<'_>,
        source: &SourceManifest,
        all: &[SourceManifest],
        metadata: &MetadataTable,
    ) -> Result<BTreeMap<String, GameCatalogRecord>, SyncError> {
        let mra_paths: Vec<&str> = source.manifest.mra_paths().collect();
        run.send(
            UpdatePhase::Reconciling,
            format!("{}: reconciling {} games", source.source_id, mra_paths.len()),
        )
        .await;

        let mut records = BTreeMap::new();
        let mut rom_requests: Vec<(String, Vec<FileRef>)> = Vec::new();
        for (index, mra_path) in mra_paths.iter().enumerate() {
            let mra_ref = FileRef::listed(source, FileKind::Metadata, mra_path);
            let mra = self.ensure_file(run, mra_ref).await?;

            let info = if mra.is_ok() {
                match read_mra(&self.store.entry_path(&mra)).await {
                    Ok(info) => info,
                    Err(e) => {
                        warn!("Unreadable MRA {}: {}", mra.cache_key(), e);
                        MraInfo::default()
                    }
                }
            } else {
                MraInfo::default()
            };

            let slug = mra_slug(mra_path);
            let mut record = GameCatalogRecord::new(slug.clone(), mra);
            let joined = metadata.get(&slug).or_else(|| {
                info.setname
                    .as_ref()
                    .and_then(|s| metadata.get(&s.to_lowercase()))
            });
            match joined {
                Some(found) => {
                    record.matched = true;
                    record.metadata = found.clone();
                    record.metadata.merge_missing(&info.metadata());
                }
                None => record.metadata = info.metadata(),
            }

            if let Some(rbf) = &info.rbf {
                match find_core(rbf, &source.source_id, all) {
                    Some(core_ref) => record.core = Some(self.ensure_file(run, core_ref).await?),
                    None => debug!("No core {} listed for {}", rbf, mra_path),
                }
            }

            let rom_refs = info
                .rom_zips
                .iter()
                .map(|zip| self.rom_ref(zip, &source.source_id, all))
                .collect();
            rom_requests.push((mra_path.to_string(), rom_refs));

            records.insert(mra_path.to_string(), record);
            run.checkpoint()?;

            if (index + 1) % 100 == 0 {
                run.send(
                    UpdatePhase::Reconciling,
                    format!(
                        "{}: {}/{} games",
                        source.source_id,
                        index + 1,
                        mra_paths.len()
                    ),
                )
                .await;
            }
        }

        self.ensure_roms(run, &mut records, rom_requests).await?;
        Ok(records)
    }

    /// Verify a hashed file and download it when absent or mismatched
    async fn ensure_file(&self, run: &mut RunState<'_>, file: FileRef) -> Result<CacheEntry, SyncError> {
        let mut entry = file.entry();
        if run.reuse(&mut entry) {
            return Ok(entry);
        }

        let local = self.store.verify(&entry).await;
        entry.status = local;
        if local == CacheStatus::Ok {
            run.mark(&entry);
            return Ok(entry);
        }

        let reason = match local {
            CacheStatus::Missing => UpdateReason::Missing,
            _ => {
                let known = run
                    .prior
                    .and_then(|p| p.known_hash(&entry.source_id, &entry.relative_path))
                    .map(str::to_lowercase);
                if known.is_some() && known != entry.content_hash {
                    UpdateReason::Updated
                } else {
                    UpdateReason::Corrupt
                }
            }
        };

        if let Some(url) = &file.url {
            run.send(
                UpdatePhase::Downloading,
                format!("Downloading {}", entry.relative_path),
            )
            .await;
            let path = self.store.entry_path(&entry);
            match self.downloader.download_to(url, &path).await {
                Ok(Download::Saved(bytes)) => {
                    entry.status = self.store.verify(&entry).await;
                    if entry.is_ok() {
                        debug!("{} ({} bytes, {:?})", entry.cache_key(), bytes, reason);
                        run.downloaded.insert(entry.cache_key());
                        run.record_update(&entry, reason);
                    } else {
                        warn!("{} does not match its manifest hash", entry.cache_key());
                    }
                }
                Ok(Download::NotFound) => warn!("{} not found at {}", entry.cache_key(), url),
                Err(e) => warn!("Failed to download {}: {}", entry.cache_key(), e),
            }
            run.checkpoint()?;
        }

        run.mark(&entry);
        Ok(entry)
    }

    fn rom_ref(&self, zip: &str, own: &str, all: &[SourceManifest]) -> FileRef {
        for source in ordered_sources(own, all) {
            if let Some(path) = source.manifest.rom_path(zip) {
                return FileRef::listed(source, FileKind::Rom, path);
            }
        }
        let url = self.settings.rom_archive_url.as_ref().map(|base| {
            format!(
                "{}/{}",
                base.trim_end_matches('/'),
                urlencoding::encode(zip)
            )
        });
        FileRef {
            source_id: ARCHIVE_SOURCE_ID.to_string(),
            kind: FileKind::Rom,
            relative_path: format!("games/mame/{}", zip),
            hash: None,
            url,
        }
    }

    /// Fill in every record's ROMs. ROMs are checked by presence; missing ones from
    /// all records of the source are downloaded together in windows of
    /// `ROM_BATCH_SIZE`, each cache key once.
    async fn ensure_roms(
        &self,
        run: &mut RunState<'_>,
        records: &mut BTreeMap<String, GameCatalogRecord>,
        requests: Vec<(String, Vec<FileRef>)>,
    ) -> Result<(), SyncError> {
        let mut pending: Vec<PendingRom> = Vec::new();
        let mut pending_by_key: HashMap<String, usize> = HashMap::new();

        for (mra_path, refs) in requests {
            let mut roms = Vec::with_capacity(refs.len());
            for file in refs {
                let mut entry = file.entry();
                let slot = (mra_path.clone(), roms.len());
                if let Some(&index) = pending_by_key.get(&entry.cache_key()) {
                    pending[index].slots.push(slot);
                } else if !run.reuse(&mut entry) {
                    if self.store.exists(&entry).await {
                        entry.status = CacheStatus::Ok;
                        run.mark(&entry);
                    } else {
                        match file.url {
                            Some(url) if self.settings.download_roms && !self.dead_links.is_set(&url) => {
                                pending_by_key.insert(entry.cache_key(), pending.len());
                                pending.push(PendingRom {
                                    path: self.store.entry_path(&entry),
                                    url,
                                    slots: vec![slot],
                                });
                            }
                            _ => run.mark(&entry),
                        }
                    }
                }
                roms.push(entry);
            }
            if let Some(record) = records.get_mut(&mra_path) {
                record.roms = roms;
            }
        }

        for window in pending.chunks(ROM_BATCH_SIZE) {
            run.checkpoint()?;
            run.send(
                UpdatePhase::Downloading,
                format!("Downloading {} ROM archives", window.len()),
            )
            .await;

            let downloads = window
                .iter()
                .map(|rom| self.downloader.download_to(&rom.url, &rom.path));
            let results = join_all(downloads).await;

            for (rom, result) in window.iter().zip(results) {
                let status = match result {
                    Ok(Download::Saved(_)) => CacheStatus::Ok,
                    Ok(Download::NotFound) => {
                        debug!("Remembering dead link {}", rom.url);
                        self.dead_links.set(&rom.url, true);
                        CacheStatus::Missing
                    }
                    Err(e) => {
                        warn!("Failed to download {}: {}", rom.url, e);
                        CacheStatus::Missing
                    }
                };
                for (n, (mra_path, slot)) in rom.slots.iter().enumerate() {
                    let Some(entry) = records.get_mut(mra_path).and_then(|r| r.roms.get_mut(*slot)) else {
                        continue;
                    };
                    entry.status = status;
                    if status == CacheStatus::Ok {
                        run.downloaded.insert(entry.cache_key());
                        let reason = if n == 0 {
                            UpdateReason::Missing
                        } else {
                            UpdateReason::Fulfilled
                        };
                        run.record_update(entry, reason);
                    }
                    run.mark(entry);
                }
            }
        }
        run.checkpoint()
    }
}

/// A ROM download shared by every record slot that references it
struct PendingRom {
    url: String,
    path: PathBuf,
    /// `(mra path, index into roms)`
    slots: Vec<(String, usize)>,
}

/// Own source first, then the others in configured order
fn ordered_sources<'a>(own: &'a str, all: &'a [SourceManifest]) -> impl Iterator<Item = &'a SourceManifest> {
    all.iter()
        .filter(move |s| s.source_id == own)
        .chain(all.iter().filter(move |s| s.source_id != own))
}

/// Newest `_Arcade/cores` file whose undated name matches `rbf`
fn find_core(rbf: &str, own: &str, all: &[SourceManifest]) -> Option<FileRef> {
    for source in ordered_sources(own, all) {
        let mut best: Option<(Option<NaiveDate>, &str)> = None;
        for path in source.manifest.core_paths() {
            let date = match classify(path) {
                FileOperationKey::Dated { base, date, .. } if base.eq_ignore_ascii_case(rbf) => {
                    Some(date)
                }
                FileOperationKey::Exact { .. } if crate::core::mra::normalize_rbf(path) == rbf => None,
                _ => continue,
            };
            if best.map_or(true, |(current, _)| date > current) {
                best = Some((date, path));
            }
        }
        if let Some((_, path)) = best {
            return Some(FileRef::listed(source, FileKind::Core, path));
        }
    }
    None
}

fn log_summary(catalog: &Catalog) {
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for entry in catalog.records().flat_map(|r| r.entries()) {
        let key = match entry.status {
            CacheStatus::Ok => "ok",
            CacheStatus::Corrupt => "corrupt",
            CacheStatus::Missing => "missing",
            CacheStatus::UnexpectedlyMissing => "unexpectedly-missing",
        };
        *counts.entry(key).or_default() += 1;
    }
    info!(
        "Catalog: {} records, entries {:?}",
        catalog.record_count(),
        counts
    );
}

use crate::core::classifier::{classify_source, SourceKey};
use crate::core::comparator::{build_file_operations, summarize_operations, DiffPolicy, FileOperation};
use crate::core::oplog::OpLog;
use crate::core::plan::Plan;
use crate::core::scanner::{is_kept_dir, DestinationListing, DestinationScanner, MANAGED_ROOTS};
use crate::core::store::CacheStore;
use crate::db::{CacheEntry, Catalog, ExportMode, ExportPhase, ExportStatus};
use crate::error::{RunOutcome, SyncError};
use crate::transport::{file_stream, parent_dir, Transport};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const ARCADE_DIR: &str = "_Arcade";
pub const CORES_DIR: &str = "_Arcade/cores";
pub const ROMS_DIR: &str = "games/mame";

/// Export settings for one coordinator
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub mode: ExportMode,
    pub policy: DiffPolicy,
    /// Recorded in the operation log file name
    pub initiator: String,
    /// Where operation logs go; `None` disables them
    pub log_dir: Option<PathBuf>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            mode: ExportMode::default(),
            policy: DiffPolicy::default(),
            initiator: "cli".to_string(),
            log_dir: None,
        }
    }
}

/// Export report
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReport {
    pub run_id: String,
    pub destination: String,
    pub files_copied: usize,
    pub files_deleted: usize,
    pub dirs_removed: usize,
    pub bytes_transferred: u64,
    /// Plan entries left out because their cache files are not usable
    pub skipped: Vec<String>,
    pub log_path: Option<PathBuf>,
    /// Seconds
    pub duration: f64,
}

/// Files an export wants at the destination
#[derive(Debug, Clone, Default)]
pub struct DesiredLayout {
    pub sources: Vec<SourceKey>,
    pub skipped: Vec<String>,
}

/// Plan directory names become `_Name`; separators are not allowed inside a name
fn plan_dir_name(name: &str) -> String {
    let cleaned = name.replace(['/', '\\'], "-");
    if cleaned.starts_with('_') {
        cleaned
    } else {
        format!("_{}", cleaned)
    }
}

fn desired_key(entry: &CacheEntry, dest: String) -> SourceKey {
    classify_source(&entry.source_id, &entry.relative_path, &dest)
}

/// Map a plan onto destination paths: metadata under `_Arcade/` mirroring the
/// plan directories, cores in `_Arcade/cores`, ROMs in `games/mame`.
pub fn desired_layout(plan: &Plan, catalog: &Catalog, mode: ExportMode) -> DesiredLayout {
    let mut layout = DesiredLayout::default();

    let include = |layout: &mut DesiredLayout, entry: &CacheEntry, dest: String| {
        if entry.is_ok() {
            layout.sources.push(desired_key(entry, dest));
        } else {
            warn!("Skipping {} ({:?})", entry.cache_key(), entry.status);
            layout.skipped.push(entry.cache_key());
        }
    };

    for leaf in plan.leaves() {
        let Some(record) = catalog.record(&leaf.source_id, &leaf.path) else {
            warn!("Plan entry {}/{} is not in the catalog", leaf.source_id, leaf.path);
            layout.skipped.push(format!("{}/{}", leaf.source_id, leaf.path));
            continue;
        };

        let mut dest = ARCADE_DIR.to_string();
        for dir in &leaf.dirs {
            dest.push('/');
            dest.push_str(&plan_dir_name(dir));
        }
        dest.push('/');
        dest.push_str(&record.mra.file_name);
        include(&mut layout, &record.mra, dest);

        if let Some(core) = &record.core {
            include(&mut layout, core, format!("{}/{}", CORES_DIR, core.file_name));
        }
        for rom in &record.roms {
            include(&mut layout, rom, format!("{}/{}", ROMS_DIR, rom.file_name));
        }
    }

    if mode == ExportMode::Speed {
        let cores = catalog
            .records()
            .filter_map(|r| r.core.as_ref())
            .filter(|c| c.is_ok());
        for core in cores {
            layout
                .sources
                .push(desired_key(core, format!("{}/{}", CORES_DIR, core.file_name)));
        }
    }
    layout
}

/// State of one export run
struct ExportRun<'a> {
    progress: &'a Option<mpsc::Sender<ExportStatus>>,
    cancel: &'a CancellationToken,
    report: ExportReport,
    /// Operation that halted the run
    failed: Option<FileOperation>,
}

impl ExportRun<'_> {
    fn checkpoint(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        Ok(())
    }

    async fn send(&self, status: ExportStatus) {
        if let Some(tx) = self.progress {
            let _ = tx.send(status).await;
        }
    }

    async fn phase(&self, phase: ExportPhase, message: impl Into<String>) {
        self.send(ExportStatus::progress(phase, message)).await;
    }
}

/// Export coordinator
pub struct ExportEngine {
    store: CacheStore,
    options: ExportOptions,
}

impl ExportEngine {
    pub fn new(store: CacheStore, options: ExportOptions) -> Self {
        Self { store, options }
    }

    /// Converge `transport` on the layout `plan` describes. The transport is
    /// connected here and always disconnected before returning.
    pub async fn run_export(
        &self,
        plan: &Plan,
        catalog: &Catalog,
        transport: &mut dyn Transport,
        progress: Option<mpsc::Sender<ExportStatus>>,
        cancel: CancellationToken,
    ) -> RunOutcome<ExportReport> {
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Export {} of plan {} to {}", run_id, plan.name, transport.name());

        let oplog = match &self.options.log_dir {
            Some(dir) => match OpLog::create(dir, &self.options.initiator) {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!("Export log disabled: {:#}", e);
                    None
                }
            },
            None => None,
        };
        // flushed however the run ends
        let mut oplog = scopeguard::guard(oplog, |log| {
            if let Some(mut log) = log {
                if let Err(e) = log.flush() {
                    warn!("Failed to flush export log: {:#}", e);
                }
            }
        });

        let mut run = ExportRun {
            progress: &progress,
            cancel: &cancel,
            report: ExportReport {
                run_id,
                destination: transport.name().to_string(),
                log_path: (*oplog).as_ref().map(|l| l.path().to_path_buf()),
                ..Default::default()
            },
            failed: None,
        };

        let result = self
            .execute(&mut run, plan, catalog, &mut *transport, &mut *oplog)
            .await;

        run.phase(ExportPhase::Disconnecting, format!("Disconnecting from {}", transport.name()))
            .await;
        if let Err(e) = transport.disconnect().await {
            warn!("Disconnect from {} failed: {}", transport.name(), e);
        }
        drop(oplog);

        run.report.duration = start.elapsed().as_secs_f64();
        let total = run.report.files_copied + run.report.files_deleted;
        let mut status = ExportStatus::progress(ExportPhase::Complete, "");
        status.complete = true;
        status.done = total;
        status.total = total;

        let outcome: RunOutcome<()> = result.into();
        let outcome = match outcome {
            RunOutcome::Ok(()) => {
                info!(
                    "Export finished in {:.1}s: {} copied, {} deleted, {} directories removed",
                    run.report.duration,
                    run.report.files_copied,
                    run.report.files_deleted,
                    run.report.dirs_removed
                );
                status.message = format!(
                    "{} copied, {} deleted",
                    run.report.files_copied, run.report.files_deleted
                );
                RunOutcome::Ok(run.report.clone())
            }
            RunOutcome::Canceled => {
                info!("Export canceled");
                status.phase = ExportPhase::Canceled;
                status.canceled = true;
                status.message = "Export canceled".to_string();
                RunOutcome::Canceled
            }
            RunOutcome::Failed(e) => {
                error!("Export failed: {}", e);
                status.phase = ExportPhase::Failed;
                status.complete = false;
                status.message = e.to_string();
                status.error = Some((e.kind(), e.to_string()));
                status.operation = run.failed.clone();
                RunOutcome::Failed(e)
            }
        };
        run.send(status).await;
        outcome
    }

    async fn execute(
        &self,
        run: &mut ExportRun<'_>,
        plan: &Plan,
        catalog: &Catalog,
        transport: &mut dyn Transport,
        oplog: &mut Option<OpLog>,
    ) -> Result<(), SyncError> {
        run.phase(ExportPhase::Connecting, format!("Connecting to {}", transport.name()))
            .await;
        transport
            .connect()
            .await
            .map_err(|e| SyncError::file(format!("Failed to connect to {}: {}", transport.name(), e)))?;
        run.checkpoint()?;

        run.phase(ExportPhase::Enumerating, "Listing destination").await;
        let layout = desired_layout(plan, catalog, self.options.mode);
        run.report.skipped = layout.skipped;
        let transport: &dyn Transport = transport;
        let listing = DestinationScanner::new(transport)
            .with_cancel(run.cancel.clone())
            .scan()
            .await?;

        run.phase(ExportPhase::Comparing, "Comparing").await;
        let operations = build_file_operations(&layout.sources, &listing.keys(), &self.options.policy)?;
        let summary = summarize_operations(&operations);
        info!(
            "{} operations: {} copies, {} deletes",
            summary.total(),
            summary.copy_count,
            summary.delete_count
        );
        run.checkpoint()?;

        let mut known_dirs: HashSet<String> = listing.dirs.iter().map(|d| d.to_lowercase()).collect();
        let mut created_dirs: Vec<String> = Vec::new();
        for (index, op) in operations.iter().enumerate() {
            run.checkpoint()?;
            let mut status = ExportStatus::progress(ExportPhase::Transferring, op.dest());
            status.operation = Some(op.clone());
            status.done = index;
            status.total = operations.len();
            run.send(status).await;

            let result = self
                .apply(transport, op, &mut known_dirs, &mut created_dirs)
                .await;
            if let Some(log) = oplog.as_mut() {
                let error = result.as_ref().err().map(|e| e.to_string());
                if let Err(e) = log.record(op, error) {
                    warn!("Failed to write export log: {:#}", e);
                }
            }
            match result {
                Ok(bytes) => match op {
                    FileOperation::Copy { .. } => {
                        run.report.files_copied += 1;
                        run.report.bytes_transferred += bytes;
                    }
                    FileOperation::Delete { .. } => run.report.files_deleted += 1,
                },
                Err(e) => {
                    run.failed = Some(op.clone());
                    return Err(SyncError::file(format!("{}: {}", op.dest(), e)));
                }
            }
        }

        run.checkpoint()?;
        run.phase(ExportPhase::Cleaning, "Removing empty directories").await;
        run.report.dirs_removed = remove_empty_dirs(transport, &listing, &created_dirs, oplog).await;
        Ok(())
    }

    async fn apply(
        &self,
        transport: &dyn Transport,
        op: &FileOperation,
        known_dirs: &mut HashSet<String>,
        created_dirs: &mut Vec<String>,
    ) -> anyhow::Result<u64> {
        match op {
            FileOperation::Copy { src, dest } => {
                if let Some(parent) = parent_dir(dest) {
                    if !known_dirs.contains(&parent.to_lowercase()) {
                        transport.mk_dir(parent, true).await?;
                        let mut dir = Some(parent);
                        while let Some(d) = dir {
                            if known_dirs.insert(d.to_lowercase()) {
                                created_dirs.push(d.to_string());
                            }
                            dir = parent_dir(d);
                        }
                    }
                }
                let local = self.store.resolve(src);
                let stream = file_stream(&local).await?;
                let bytes = transport.put_file(stream, dest).await?;
                debug!("{} -> {} ({} bytes)", src, dest, bytes);
                Ok(bytes)
            }
            FileOperation::Delete { dest } => {
                transport.delete_file(dest).await?;
                debug!("Deleted {}", dest);
                Ok(0)
            }
        }
    }
}

fn is_managed(dir: &str) -> bool {
    let dir = dir.to_lowercase();
    MANAGED_ROOTS
        .iter()
        .any(|root| dir.starts_with(&format!("{}/", root.to_lowercase())))
}

/// Remove directories under the managed roots that are now empty, deepest first
async fn remove_empty_dirs(
    transport: &dyn Transport,
    listing: &DestinationListing,
    created: &[String],
    oplog: &mut Option<OpLog>,
) -> usize {
    let mut candidates: Vec<&String> = listing
        .dirs
        .iter()
        .chain(created.iter())
        .filter(|d| is_managed(d) && !is_kept_dir(d))
        .collect();
    candidates.sort_by(|a, b| {
        b.matches('/')
            .count()
            .cmp(&a.matches('/').count())
            .then_with(|| a.cmp(b))
    });
    candidates.dedup();

    let mut removed = 0;
    for dir in candidates {
        let empty = match transport.list_dir(dir).await {
            Ok(entries) => entries.is_empty(),
            Err(e) => {
                debug!("Skipping cleanup of {}: {}", dir, e);
                false
            }
        };
        if !empty {
            continue;
        }
        let result = transport.rm_dir(dir).await;
        if let Some(log) = oplog.as_mut() {
            let error = result.as_ref().err().map(|e| e.to_string());
            if let Err(e) = log.record_rmdir(dir, error) {
                warn!("Failed to write export log: {:#}", e);
            }
        }
        match result {
            Ok(()) => {
                debug!("Removed empty directory {}", dir);
                removed += 1;
            }
            Err(e) => warn!("Failed to remove {}: {}", dir, e),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::oplog::OpLogEntry;
    use crate::db::{CacheStatus, FileKind, GameCatalogRecord, SourceRecords};
    use crate::transport::LocalTransport;
    use std::collections::BTreeMap;
    use std::path::Path;

    struct Fixture {
        _dirs: (tempfile::TempDir, tempfile::TempDir),
        cache: PathBuf,
        dest: PathBuf,
        catalog: Catalog,
    }

    fn entry(kind: FileKind, path: &str, status: CacheStatus) -> CacheEntry {
        CacheEntry::new("mockdb", kind, path, None, status)
    }

    fn write(root: &Path, path: &str, data: &[u8]) {
        let full = root.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, data).unwrap();
    }

    impl Fixture {
        fn new() -> Self {
            let cache_dir = tempfile::tempdir().unwrap();
            let dest_dir = tempfile::tempdir().unwrap();
            let store = CacheStore::new(cache_dir.path());
            let cache_root = store.path_for("mockdb", "");

            let mut records = BTreeMap::new();
            let mut add = |mra: &str, core: Option<&str>, roms: &[&str], rom_status: CacheStatus| {
                write(&cache_root, mra, mra.as_bytes());
                let mut record = GameCatalogRecord::new(
                    mra.to_string(),
                    entry(FileKind::Metadata, mra, CacheStatus::Ok),
                );
                if let Some(core) = core {
                    write(&cache_root, core, core.as_bytes());
                    record.core = Some(entry(FileKind::Core, core, CacheStatus::Ok));
                }
                for rom in roms {
                    if rom_status == CacheStatus::Ok {
                        write(&cache_root, rom, rom.as_bytes());
                    }
                    record.roms.push(entry(FileKind::Rom, rom, rom_status));
                }
                records.insert(mra.to_string(), record);
            };
            add(
                "_Arcade/1942.mra",
                Some("_Arcade/cores/jt1942_20230601.rbf"),
                &["games/mame/1942.zip"],
                CacheStatus::Ok,
            );
            add(
                "_Arcade/pang.mra",
                Some("_Arcade/cores/jtcps1_20230301.rbf"),
                &["games/mame/pang.zip"],
                CacheStatus::Missing,
            );
            add("_Arcade/galaga.mra", Some("_Arcade/cores/galaga_20220101.rbf"), &[], CacheStatus::Ok);

            let catalog = Catalog {
                updated_at: chrono::Utc::now(),
                sources: vec![SourceRecords {
                    source_id: "mockdb".into(),
                    records,
                }],
            };
            Self {
                cache: cache_dir.path().to_path_buf(),
                dest: dest_dir.path().to_path_buf(),
                _dirs: (cache_dir, dest_dir),
                catalog,
            }
        }

        fn engine(&self, mode: ExportMode, recopy_metadata: bool) -> ExportEngine {
            ExportEngine::new(
                CacheStore::new(&self.cache),
                ExportOptions {
                    mode,
                    policy: DiffPolicy { recopy_metadata },
                    initiator: "test".into(),
                    log_dir: Some(self.cache.join("logs")),
                },
            )
        }

        fn transport(&self) -> LocalTransport {
            LocalTransport::new(self.dest.to_str().unwrap())
        }

        fn dest_files(&self) -> Vec<String> {
            let mut files: Vec<String> = walkdir::WalkDir::new(&self.dest)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| {
                    e.path()
                        .strip_prefix(&self.dest)
                        .unwrap()
                        .to_string_lossy()
                        .replace('\\', "/")
                })
                .collect();
            files.sort();
            files
        }
    }

    fn plan() -> Plan {
        let mut plan = Plan::new("test");
        plan.add_leaf(&["Shooters"], "mockdb", "_Arcade/1942.mra");
        plan.add_leaf(&[], "mockdb", "_Arcade/pang.mra");
        plan
    }

    async fn export(
        fixture: &Fixture,
        engine: &ExportEngine,
        plan: &Plan,
        cancel: CancellationToken,
    ) -> (RunOutcome<ExportReport>, Vec<ExportStatus>) {
        let (tx, mut rx) = mpsc::channel(1024);
        let mut transport = fixture.transport();
        let outcome = engine
            .run_export(plan, &fixture.catalog, &mut transport, Some(tx), cancel)
            .await;
        let mut statuses = Vec::new();
        while let Ok(status) = rx.try_recv() {
            statuses.push(status);
        }
        (outcome, statuses)
    }

    #[test]
    fn layout_mirrors_plan_directories() {
        let fixture = Fixture::new();
        let layout = desired_layout(&plan(), &fixture.catalog, ExportMode::Space);
        let dests: Vec<&str> = layout.sources.iter().map(|s| s.key.path()).collect();
        assert!(dests.contains(&"_Arcade/_Shooters/1942.mra"));
        assert!(dests.contains(&"_Arcade/cores/jt1942_20230601.rbf"));
        assert!(dests.contains(&"games/mame/1942.zip"));
        assert!(dests.contains(&"_Arcade/pang.mra"));
        assert!(!dests.contains(&"games/mame/pang.zip"));
        assert_eq!(layout.skipped, vec!["mockdb/games/mame/pang.zip"]);
        assert!(!dests.contains(&"_Arcade/cores/galaga_20220101.rbf"));
    }

    #[test]
    fn speed_mode_stages_every_core() {
        let fixture = Fixture::new();
        let layout = desired_layout(&plan(), &fixture.catalog, ExportMode::Speed);
        assert!(layout
            .sources
            .iter()
            .any(|s| s.key.path() == "_Arcade/cores/galaga_20220101.rbf"));
    }

    #[tokio::test]
    async fn export_converges_and_reruns_clean() {
        let fixture = Fixture::new();
        write(&fixture.dest, "_Arcade/cores/jt1942_20230101.rbf", b"old core");
        write(&fixture.dest, "_Arcade/_Old/stale.mra", b"stale");
        write(&fixture.dest, "games/NES/keep.nes", b"not ours");

        let engine = fixture.engine(ExportMode::Space, false);
        let (outcome, statuses) = export(&fixture, &engine, &plan(), CancellationToken::new()).await;
        let report = outcome.ok().unwrap();

        assert_eq!(
            fixture.dest_files(),
            vec![
                "_Arcade/_Shooters/1942.mra",
                "_Arcade/cores/jt1942_20230601.rbf",
                "_Arcade/cores/jtcps1_20230301.rbf",
                "_Arcade/pang.mra",
                "games/NES/keep.nes",
                "games/mame/1942.zip",
            ]
        );
        assert_eq!(report.files_copied, 5);
        assert_eq!(report.files_deleted, 2);
        assert_eq!(report.dirs_removed, 1);
        assert!(!fixture.dest.join("_Arcade/_Old").exists());

        let terminal = statuses.last().unwrap();
        assert!(terminal.complete && !terminal.canceled && terminal.error.is_none());
        let phases: Vec<ExportPhase> = statuses.iter().map(|s| s.phase).collect();
        assert_eq!(phases.first(), Some(&ExportPhase::Connecting));
        assert!(phases.contains(&ExportPhase::Disconnecting));

        let log: Vec<OpLogEntry> =
            serde_json::from_slice(&std::fs::read(report.log_path.unwrap()).unwrap()).unwrap();
        assert_eq!(log.len(), 8);
        assert!(log.iter().all(|e| e.ok));

        let (again, _) = export(&fixture, &engine, &plan(), CancellationToken::new()).await;
        let again = again.ok().unwrap();
        assert_eq!(again.files_copied + again.files_deleted, 0);
    }

    #[tokio::test]
    async fn metadata_is_recopied_by_default() {
        let fixture = Fixture::new();
        let engine = fixture.engine(ExportMode::Space, true);
        export(&fixture, &engine, &plan(), CancellationToken::new()).await;
        let (again, _) = export(&fixture, &engine, &plan(), CancellationToken::new()).await;
        let again = again.ok().unwrap();
        assert_eq!(again.files_copied, 2);
        assert_eq!(again.files_deleted, 0);
    }

    #[tokio::test]
    async fn canceled_export_leaves_destination_untouched() {
        let fixture = Fixture::new();
        write(&fixture.dest, "_Arcade/_Old/stale.mra", b"stale");
        let before = fixture.dest_files();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let engine = fixture.engine(ExportMode::Space, true);
        let (outcome, statuses) = export(&fixture, &engine, &plan(), cancel).await;

        assert!(outcome.is_canceled());
        let terminal = statuses.last().unwrap();
        assert!(terminal.canceled && terminal.complete);
        assert_eq!(fixture.dest_files(), before);
    }

    #[tokio::test]
    async fn first_failing_operation_halts_the_export() {
        let fixture = Fixture::new();
        // the cached core vanished after the catalog was built
        std::fs::remove_file(
            CacheStore::new(&fixture.cache).path_for("mockdb", "_Arcade/cores/jt1942_20230601.rbf"),
        )
        .unwrap();

        let engine = fixture.engine(ExportMode::Space, true);
        let (outcome, statuses) = export(&fixture, &engine, &plan(), CancellationToken::new()).await;

        let err = outcome.error().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::File);
        let terminal = statuses.last().unwrap();
        assert_eq!(terminal.phase, ExportPhase::Failed);
        assert_eq!(
            terminal.operation.as_ref().map(|op| op.dest().to_string()),
            Some("_Arcade/cores/jt1942_20230601.rbf".to_string())
        );
        // copies sort by destination, so the metadata files before it were written
        assert!(fixture.dest.join("_Arcade/_Shooters/1942.mra").exists());
        assert!(!fixture.dest.join("games/mame/1942.zip").exists());
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let fixture = Fixture::new();
        let engine = fixture.engine(ExportMode::Space, true);
        let mut transport = LocalTransport::new(fixture.dest.join("missing").to_str().unwrap());
        let outcome = engine
            .run_export(&plan(), &fixture.catalog, &mut transport, None, CancellationToken::new())
            .await;
        assert_eq!(
            outcome.error().map(|e| e.kind()),
            Some(crate::error::ErrorKind::File)
        );
    }
}

use crate::error::ErrorKind;
use crate::core::comparator::FileOperation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Kind of file tracked in the cache
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// `.mra` XML description
    Metadata,
    /// `.rbf` FPGA image
    Core,
    /// ROM zip archive
    Rom,
}

impl FileKind {
    /// ROM sources publish inconsistent hashes, so only metadata and cores are verified
    pub fn is_hashed(&self) -> bool {
        !matches!(self, FileKind::Rom)
    }
}

/// Cache entry status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStatus {
    Ok,
    Corrupt,
    /// Never successfully obtained
    Missing,
    /// Was `Ok`, then vanished from disk (set by the audit pass only)
    UnexpectedlyMissing,
}

/// One local file tracked against a manifest entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub source_id: String,
    pub kind: FileKind,
    pub relative_path: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub status: CacheStatus,
}

impl CacheEntry {
    pub fn new(
        source_id: &str,
        kind: FileKind,
        relative_path: &str,
        content_hash: Option<String>,
        status: CacheStatus,
    ) -> Self {
        let file_name = relative_path
            .rsplit('/')
            .next()
            .unwrap_or(relative_path)
            .to_string();
        Self {
            source_id: source_id.to_string(),
            kind,
            relative_path: relative_path.to_string(),
            file_name,
            content_hash,
            status,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == CacheStatus::Ok
    }

    /// `<sourceId>/<relativePath>`, the key used for cache-side copies
    pub fn cache_key(&self) -> String {
        format!("{}/{}", self.source_id, self.relative_path)
    }
}

/// Game fields from the metadata table (and the MRA itself when unmatched)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GameMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub players: Option<String>,
    #[serde(default, alias = "control", skip_serializing_if = "Option::is_none")]
    pub controls: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub rotation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl GameMetadata {
    /// Fill gaps from a lower-priority source
    pub fn merge_missing(&mut self, other: &GameMetadata) {
        fn fill(dst: &mut Option<String>, src: &Option<String>) {
            if dst.is_none() {
                dst.clone_from(src);
            }
        }
        fill(&mut self.name, &other.name);
        fill(&mut self.setname, &other.setname);
        fill(&mut self.manufacturer, &other.manufacturer);
        fill(&mut self.year, &other.year);
        fill(&mut self.category, &other.category);
        fill(&mut self.players, &other.players);
        fill(&mut self.controls, &other.controls);
        fill(&mut self.rotation, &other.rotation);
        fill(&mut self.region, &other.region);
    }
}

/// Metadata tables mix `"1984"` and `1984`
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// One playable unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GameCatalogRecord {
    pub slug: String,
    /// Whether the metadata table had an entry for this game
    pub matched: bool,
    pub metadata: GameMetadata,
    pub mra: CacheEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core: Option<CacheEntry>,
    #[serde(default)]
    pub roms: Vec<CacheEntry>,
}

impl GameCatalogRecord {
    /// Records are only built once the metadata entry exists
    pub fn new(slug: String, mra: CacheEntry) -> Self {
        Self {
            slug,
            matched: false,
            metadata: GameMetadata::default(),
            mra,
            core: None,
            roms: Vec::new(),
        }
    }

    /// Metadata first, then core, then roms
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        std::iter::once(&self.mra)
            .chain(self.core.iter())
            .chain(self.roms.iter())
    }
}

/// All records of one database, keyed by MRA relative path
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecords {
    pub source_id: String,
    pub records: BTreeMap<String, GameCatalogRecord>,
}

/// Reconciled view of every source, in configured order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    pub updated_at: DateTime<Utc>,
    pub sources: Vec<SourceRecords>,
}

impl Catalog {
    pub fn source(&self, source_id: &str) -> Option<&SourceRecords> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn record(&self, source_id: &str, mra_path: &str) -> Option<&GameCatalogRecord> {
        self.source(source_id)?.records.get(mra_path)
    }

    pub fn records(&self) -> impl Iterator<Item = &GameCatalogRecord> {
        self.sources.iter().flat_map(|s| s.records.values())
    }

    pub fn record_count(&self) -> usize {
        self.sources.iter().map(|s| s.records.len()).sum()
    }

    /// Look up the manifest hash a cached file had in this catalog
    pub fn known_hash(&self, source_id: &str, relative_path: &str) -> Option<&str> {
        self.source(source_id)?
            .records
            .values()
            .flat_map(|r| r.entries())
            .find(|e| e.relative_path == relative_path)
            .and_then(|e| e.content_hash.as_deref())
    }
}

/// Why a file was touched during an update
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpdateReason {
    Missing,
    Updated,
    Corrupt,
    /// Another record already materialized this exact file in the same run
    Fulfilled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdate {
    pub source_id: String,
    pub relative_path: String,
    pub kind: FileKind,
    pub reason: UpdateReason,
}

/// Catalog update run state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePhase {
    Idle,
    FetchingManifest,
    Reconciling,
    Downloading,
    Auditing,
    Complete,
    Canceled,
    Failed,
}

/// Progress snapshot sent by the catalog builder
#[derive(Debug, Clone)]
pub struct UpdateStatus {
    pub phase: UpdatePhase,
    pub message: String,
    /// First run ever, expect it to be slow
    pub fresh: bool,
    pub complete: bool,
    pub canceled: bool,
    pub catalog: Option<Arc<Catalog>>,
    pub updates: Option<Vec<FileUpdate>>,
    pub error: Option<(ErrorKind, String)>,
    /// Seconds
    pub duration: Option<f64>,
}

impl UpdateStatus {
    pub fn progress(phase: UpdatePhase, message: impl Into<String>, fresh: bool) -> Self {
        Self {
            phase,
            message: message.into(),
            fresh,
            complete: false,
            canceled: false,
            catalog: None,
            updates: None,
            error: None,
            duration: None,
        }
    }
}

/// Export run state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExportPhase {
    Connecting,
    Enumerating,
    Comparing,
    Transferring,
    Cleaning,
    Disconnecting,
    Complete,
    Canceled,
    Failed,
}

/// Progress snapshot sent by the export coordinator
#[derive(Debug, Clone)]
pub struct ExportStatus {
    pub phase: ExportPhase,
    pub message: String,
    pub complete: bool,
    pub canceled: bool,
    pub error: Option<(ErrorKind, String)>,
    /// Operation being executed, or the one that failed
    pub operation: Option<FileOperation>,
    pub done: usize,
    pub total: usize,
}

impl ExportStatus {
    pub fn progress(phase: ExportPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            complete: false,
            canceled: false,
            error: None,
            operation: None,
            done: 0,
            total: 0,
        }
    }
}

/// Destination type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    #[default]
    Local,
    Ftp,
    Sftp,
}

/// Destination settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    #[serde(rename = "type")]
    pub typ: TransportType,
    /// Local destination directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// SFTP private key path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Remote root, `/media/fat` on a MiSTer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

/// Which files an export stages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    /// Only files the plan references
    #[default]
    Space,
    /// Plan files plus every cataloged core, so later exports never re-stage cores
    Speed,
}

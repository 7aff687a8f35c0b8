//! Remote database manifests and the metadata-join table

use crate::core::fetcher::Downloader;
use crate::db::GameMetadata;
use crate::error::SyncError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// One file listed by a database
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestFile {
    pub hash: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub tags: Vec<serde_json::Value>,
    /// Absolute URL overriding `base_files_url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A remote database document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseManifest {
    #[serde(default)]
    pub db_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_url: Option<String>,
    #[serde(default)]
    pub base_files_url: String,
    #[serde(default)]
    pub files: BTreeMap<String, ManifestFile>,
}

impl DatabaseManifest {
    pub fn file(&self, relative_path: &str) -> Option<&ManifestFile> {
        self.files.get(relative_path)
    }

    /// Download URL of a listed file, path segments percent-encoded
    pub fn file_url(&self, relative_path: &str) -> String {
        if let Some(url) = self.file(relative_path).and_then(|f| f.url.clone()) {
            return url;
        }
        let encoded: Vec<String> = relative_path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!(
            "{}/{}",
            self.base_files_url.trim_end_matches('/'),
            encoded.join("/")
        )
    }

    /// Paths of `.mra` files anywhere under `_Arcade/`, `_alternatives` sets included
    pub fn mra_paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str).filter(|path| {
            let lower = path.to_lowercase();
            lower.starts_with("_arcade/") && lower.ends_with(".mra")
        })
    }

    /// Paths of `.rbf` files under `_Arcade/cores/`
    pub fn core_paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str).filter(|path| {
            let lower = path.to_lowercase();
            lower.starts_with("_arcade/cores/") && lower.ends_with(".rbf")
        })
    }

    /// Listed ROM archive for a zip name, matched case-insensitively under `games/mame/`
    pub fn rom_path(&self, zip_name: &str) -> Option<&str> {
        let wanted = format!("games/mame/{}", zip_name.to_lowercase());
        self.files
            .keys()
            .find(|path| path.to_lowercase() == wanted)
            .map(String::as_str)
    }
}

/// Game metadata keyed by slug
pub type MetadataTable = HashMap<String, GameMetadata>;

/// Downloads JSON documents, unpacking zip payloads into a scratch directory
pub struct ManifestFetcher {
    scratch: TempDir,
}

impl ManifestFetcher {
    pub fn new() -> Result<Self, SyncError> {
        let scratch = tempfile::Builder::new().prefix("arcadesync").tempdir()?;
        debug!("Manifest scratch directory {:?}", scratch.path());
        Ok(Self { scratch })
    }

    pub async fn fetch_manifest(
        &self,
        downloader: &dyn Downloader,
        source_id: &str,
        url: &str,
    ) -> Result<DatabaseManifest, SyncError> {
        let manifest: DatabaseManifest = self.fetch_json(downloader, url).await?;
        if !manifest.db_id.is_empty() && manifest.db_id != source_id {
            warn!(
                "Manifest at {} declares db_id {}, using configured id {}",
                url, manifest.db_id, source_id
            );
        }
        info!("{}: {} files listed", source_id, manifest.files.len());
        Ok(manifest)
    }

    /// Entries that are not objects are skipped
    pub async fn fetch_metadata(
        &self,
        downloader: &dyn Downloader,
        url: &str,
    ) -> Result<MetadataTable, SyncError> {
        let raw: HashMap<String, serde_json::Value> = self.fetch_json(downloader, url).await?;
        let total = raw.len();
        let table: MetadataTable = raw
            .into_iter()
            .filter_map(|(slug, value)| {
                let metadata = serde_json::from_value::<GameMetadata>(value).ok()?;
                Some((slug.to_lowercase(), metadata))
            })
            .collect();
        if table.len() < total {
            debug!("Skipped {} malformed metadata entries", total - table.len());
        }
        info!("Metadata table: {} games", table.len());
        Ok(table)
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        downloader: &dyn Downloader,
        url: &str,
    ) -> Result<T, SyncError> {
        let data = downloader.fetch(url).await?;
        let is_zip = data.starts_with(ZIP_MAGIC) || url.to_lowercase().ends_with(".zip");
        if !is_zip {
            return serde_json::from_slice(&data)
                .map_err(|e| SyncError::format(format!("{}: {}", url, e)));
        }

        let extract_dir = tempfile::Builder::new()
            .prefix("manifest")
            .tempdir_in(self.scratch.path())?;
        let target = extract_dir.path().to_path_buf();
        let json_path = tokio::task::spawn_blocking(move || extract_json(&data, &target))
            .await
            .map_err(|e| SyncError::unknown(e.to_string()))??;

        let content = tokio::fs::read(&json_path).await?;
        serde_json::from_slice(&content).map_err(|e| SyncError::format(format!("{}: {}", url, e)))
    }
}

/// Unpack an archive and return the first JSON file in it
fn extract_json(data: &[u8], target: &Path) -> Result<PathBuf, SyncError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    archive.extract(target)?;

    let mut candidates: Vec<PathBuf> = WalkDir::new(target)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        })
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| SyncError::format("archive contains no JSON manifest"))
}

//! Settings stored as sections of `config.json`

use crate::db::{ExportMode, TransportConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";

fn read_config(config_dir: &Path) -> Option<serde_json::Value> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

/// Load one section, falling back to defaults when absent or invalid
pub fn load_section<T: DeserializeOwned + Default>(config_dir: &Path, key: &str) -> T {
    read_config(config_dir)
        .and_then(|config| config.get(key).cloned())
        .and_then(|section| serde_json::from_value(section).ok())
        .unwrap_or_default()
}

/// Replace one section, keeping the others untouched
pub fn save_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> io::Result<()> {
    fs::create_dir_all(config_dir)?;
    let mut config = read_config(config_dir).unwrap_or_else(|| serde_json::json!({}));
    if !config.is_object() {
        config = serde_json::json!({});
    }
    config[key] = serde_json::to_value(value).map_err(io::Error::other)?;
    let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
    fs::write(config_dir.join(CONFIG_FILE), content)
}

/// Custom data directory, if configured and present on disk
pub fn data_path_override(config_dir: &Path) -> Option<PathBuf> {
    read_config(config_dir)?
        .get("data_path")?
        .as_str()
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
}

/// One remote database
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub id: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// `update` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettings {
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
    #[serde(default = "default_metadata_url")]
    pub metadata_url: Option<String>,
    #[serde(default)]
    pub download_roms: bool,
    #[serde(default)]
    pub rom_archive_url: Option<String>,
    /// Defaults to `<data dir>/cache`
    #[serde(default)]
    pub cache_root: Option<PathBuf>,
}

fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig {
            id: "distribution_mister".to_string(),
            url: "https://raw.githubusercontent.com/MiSTer-devel/Distribution_MiSTer/main/db.json.zip"
                .to_string(),
            enabled: true,
        },
        SourceConfig {
            id: "jtcores".to_string(),
            url: "https://raw.githubusercontent.com/jotego/jtcores_mister/main/jtbindb.json.zip"
                .to_string(),
            enabled: true,
        },
    ]
}

fn default_metadata_url() -> Option<String> {
    Some(
        "https://raw.githubusercontent.com/MiSTer-devel/ArcadeDatabase_MiSTer/db/mad_db.json.zip"
            .to_string(),
    )
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            metadata_url: default_metadata_url(),
            download_roms: false,
            rom_archive_url: None,
            cache_root: None,
        }
    }
}

impl UpdateSettings {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "update")
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "update", self)
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// `export` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSettings {
    #[serde(default)]
    pub mode: ExportMode,
    #[serde(default = "default_true")]
    pub recopy_metadata: bool,
    #[serde(default)]
    pub transport: TransportConfig,
    /// Who started the export; part of the operation log file name
    #[serde(default = "default_initiator")]
    pub initiator: String,
}

fn default_initiator() -> String {
    "cli".to_string()
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            mode: ExportMode::default(),
            recopy_metadata: true,
            transport: TransportConfig::default(),
            initiator: default_initiator(),
        }
    }
}

impl ExportSettings {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "export")
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "export", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TransportType;

    #[test]
    fn sections_are_saved_independently() {
        let dir = tempfile::tempdir().unwrap();

        let mut update = UpdateSettings::default();
        update.download_roms = true;
        update.save(dir.path()).unwrap();

        let mut export = ExportSettings::default();
        export.transport.typ = TransportType::Sftp;
        export.transport.host = Some("mister.local".into());
        export.save(dir.path()).unwrap();

        assert!(UpdateSettings::load(dir.path()).download_roms);
        let loaded = ExportSettings::load(dir.path());
        assert_eq!(loaded.transport.typ, TransportType::Sftp);
        assert_eq!(loaded.transport.host.as_deref(), Some("mister.local"));
    }

    #[test]
    fn missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let update = UpdateSettings::load(dir.path());
        assert_eq!(update.enabled_sources().count(), 2);
        assert!(!update.download_roms);
        assert_eq!(ExportSettings::load(dir.path()).mode, ExportMode::Space);
    }
}

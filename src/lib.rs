use std::path::PathBuf;

pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;
pub mod transport;

pub use crate::core::{CatalogBuilder, ExportEngine, ExportReport, Plan};
pub use error::{RunOutcome, SyncError};

/// Paths shared by every command
#[derive(Debug, Clone)]
pub struct AppContext {
    /// Holds `config.json`
    pub config_dir: PathBuf,
    /// Logs, plans and the default cache root; the config's `data_path` when set
    pub data_dir: PathBuf,
}

impl AppContext {
    pub fn new() -> anyhow::Result<Self> {
        let config_dir = dirs::config_dir()
            .map(|p| p.join("arcadesync"))
            .unwrap_or_else(|| PathBuf::from(".arcadesync"));
        std::fs::create_dir_all(&config_dir)?;

        let data_dir = config::data_path_override(&config_dir)
            .inspect(|p| tracing::debug!("Using custom data path {:?}", p))
            .unwrap_or_else(|| config_dir.clone());
        std::fs::create_dir_all(&data_dir)?;

        Ok(Self {
            config_dir,
            data_dir,
        })
    }

    /// Context rooted in one directory, for tests and portable installs
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            config_dir: dir.clone(),
            data_dir: dir,
        }
    }

    pub fn default_cache_root(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.data_dir.join("plans")
    }

    /// `<data>/logs/exports`
    pub fn export_log_dir(&self) -> PathBuf {
        logging::get_log_dir(&self.data_dir).join("exports")
    }
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}

use crate::core::classifier::{classify_dest, FileOperationKey};
use crate::error::SyncError;
use crate::transport::{is_hidden, DirEntry, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Destination trees the exporter owns; anything else on the target is left alone
pub const MANAGED_ROOTS: [&str; 2] = ["_Arcade", "games/mame"];

/// Directories never removed by empty-directory cleanup
pub const KEEP_DIRS: [&str; 3] = ["_Arcade", "_Arcade/cores", "games/mame"];

pub fn is_kept_dir(path: &str) -> bool {
    let path = path.trim_matches('/');
    KEEP_DIRS.iter().any(|keep| keep.eq_ignore_ascii_case(path))
}

/// Snapshot of the managed part of a destination
#[derive(Debug, Clone, Default)]
pub struct DestinationListing {
    pub files: Vec<DirEntry>,
    /// Directory paths below the managed roots
    pub dirs: Vec<String>,
}

impl DestinationListing {
    pub fn keys(&self) -> Vec<FileOperationKey> {
        self.files.iter().map(|f| classify_dest(&f.path)).collect()
    }
}

/// Walks the managed roots of a destination through its transport
pub struct DestinationScanner<'a> {
    transport: &'a dyn Transport,
    cancel: Option<CancellationToken>,
}

impl<'a> DestinationScanner<'a> {
    pub fn new(transport: &'a dyn Transport) -> Self {
        Self {
            transport,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|c| c.is_cancelled())
            .unwrap_or(false)
    }

    /// Hidden entries and partial uploads are not ours to diff. `walk` already
    /// prunes hidden directories.
    fn should_skip(entry: &DirEntry) -> bool {
        is_hidden(&entry.name) || entry.name.ends_with(".part")
    }

    pub async fn scan(&self) -> Result<DestinationListing, SyncError> {
        let mut listing = DestinationListing::default();

        for root in MANAGED_ROOTS {
            if self.is_cancelled() {
                return Err(SyncError::Canceled);
            }
            let present = self
                .transport
                .is_dir(root)
                .await
                .map_err(|e| SyncError::file(format!("Failed to stat {}: {}", root, e)))?;
            if !present {
                debug!("{} has no {}", self.transport.name(), root);
                continue;
            }

            let entries = self
                .transport
                .walk(root)
                .await
                .map_err(|e| SyncError::file(format!("Failed to list {}: {}", root, e)))?;
            for entry in entries {
                if Self::should_skip(&entry) {
                    continue;
                }
                if entry.is_dir {
                    listing.dirs.push(entry.path);
                } else {
                    listing.files.push(entry);
                }
            }
        }

        if self.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        info!(
            "{}: {} files in {} directories",
            self.transport.name(),
            listing.files.len(),
            listing.dirs.len()
        );
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;

    fn touch(root: &std::path::Path, path: &str) {
        let full = root.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, b"x").unwrap();
    }

    #[tokio::test]
    async fn only_managed_roots_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "_Arcade/_Shooters/1942.mra");
        touch(dir.path(), "_Arcade/cores/jt1942_20230101.rbf");
        touch(dir.path(), "_Arcade/.hidden");
        touch(dir.path(), "games/mame/1942.zip");
        touch(dir.path(), "games/NES/mario.nes");
        touch(dir.path(), "menu.rbf");

        let transport = LocalTransport::new(dir.path().to_str().unwrap());
        let listing = DestinationScanner::new(&transport).scan().await.unwrap();

        let mut files: Vec<_> = listing.files.iter().map(|f| f.path.clone()).collect();
        files.sort();
        assert_eq!(
            files,
            vec![
                "_Arcade/_Shooters/1942.mra",
                "_Arcade/cores/jt1942_20230101.rbf",
                "games/mame/1942.zip",
            ]
        );
        assert!(listing.dirs.contains(&"_Arcade/_Shooters".to_string()));
        assert_eq!(listing.keys().iter().filter(|k| k.is_dated()).count(), 1);
    }

    #[tokio::test]
    async fn hidden_directories_are_not_entered() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "_Arcade/1942.mra");
        touch(dir.path(), "_Arcade/.Trash/_Shooters/1942.mra");
        touch(dir.path(), "games/mame/.Trash-1000/files/1942.zip");
        touch(dir.path(), "games/mame/1942.zip.part");

        let transport = LocalTransport::new(dir.path().to_str().unwrap());
        let listing = DestinationScanner::new(&transport).scan().await.unwrap();

        let files: Vec<_> = listing.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(files, vec!["_Arcade/1942.mra"]);
        assert!(listing.dirs.is_empty());
    }

    #[tokio::test]
    async fn empty_destination_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalTransport::new(dir.path().to_str().unwrap());
        let listing = DestinationScanner::new(&transport).scan().await.unwrap();
        assert!(listing.files.is_empty());
    }

    #[tokio::test]
    async fn canceled_scan_stops() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalTransport::new(dir.path().to_str().unwrap());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = DestinationScanner::new(&transport)
            .with_cancel(cancel)
            .scan()
            .await;
        assert!(matches!(result, Err(SyncError::Canceled)));
    }

    #[test]
    fn kept_directories() {
        assert!(is_kept_dir("_Arcade/cores"));
        assert!(is_kept_dir("/games/mame/"));
        assert!(!is_kept_dir("_Arcade/_Shooters"));
    }
}

pub mod ftp;
pub mod local;
pub mod remote;
pub mod sftp;
pub mod ssh;

use crate::db::{TransportConfig, TransportType};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;
use tracing::{info, warn};

pub use ftp::FtpTransport;
pub use local::LocalTransport;
pub use sftp::SftpTransport;

/// Byte stream handed to `put_file`
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// One directory listing entry, path relative to the transport root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: String,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Destination filesystem contract shared by local, FTP and SFTP targets.
///
/// All paths are relative to the transport root and use `/` separators.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Immediate children of `path`
    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>>;

    async fn is_dir(&self, path: &str) -> Result<bool>;

    async fn mk_dir(&self, path: &str, recursive: bool) -> Result<()>;

    /// Remove an empty directory
    async fn rm_dir(&self, path: &str) -> Result<()>;

    /// Whole-file overwrite of `dest_path`, returns bytes written
    async fn put_file(&self, stream: ByteStream, dest_path: &str) -> Result<u64>;

    async fn delete_file(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Join a child onto a destination path: host-native for local targets,
    /// forward slashes for remote mounts
    fn join_path(&self, base: &str, child: &str) -> String;

    /// Recursive listing below `path` (files and directories). Hidden entries are
    /// left out and hidden directories are not descended into.
    async fn walk(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut pending = vec![path.to_string()];
        let mut entries = Vec::new();
        while let Some(dir) = pending.pop() {
            for entry in self.list_dir(&dir).await? {
                if is_hidden(&entry.name) {
                    continue;
                }
                if entry.is_dir {
                    pending.push(entry.path.clone());
                }
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Display name for logs
    fn name(&self) -> &str;
}

/// Dot-files such as `.Trash` or upload temporaries
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Forward-slash join used by every remote target
pub fn join_remote(base: &str, child: &str) -> String {
    let base = base.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    match (base.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{}/{}", base, child),
    }
}

/// Parent of a `/` separated relative path, `None` at the root
pub fn parent_dir(path: &str) -> Option<&str> {
    path.trim_end_matches('/')
        .rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|p| !p.is_empty())
}

/// Stream a local file in chunks
pub async fn file_stream(path: &Path) -> Result<ByteStream> {
    let file = tokio::fs::File::open(path).await?;
    let stream = tokio_util::io::ReaderStream::new(file).map(|chunk| chunk.map_err(Into::into));
    Ok(Box::pin(stream))
}

/// Backoff schedule for flaky connects
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial_delay: Duration,
    pub factor: u32,
}

/// Embedded targets are slow to accept connections right after boot
pub const SFTP_CONNECT_RETRY: RetryPolicy = RetryPolicy {
    retries: 2,
    initial_delay: Duration::from_secs(2),
    factor: 2,
};

/// Run `op`, retrying with exponential backoff on failure
pub async fn retry_with_backoff<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.retries => {
                attempt += 1;
                warn!(
                    "{} failed, retrying in {:?} ({}/{}): {}",
                    what, delay, attempt, policy.retries, e
                );
                tokio::time::sleep(delay).await;
                delay *= policy.factor;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Build the transport for a destination config. The result is not yet connected.
pub fn create_transport(config: &TransportConfig) -> Result<Box<dyn Transport>> {
    match config.typ {
        TransportType::Local => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Local destination requires path"))?;
            info!("Local destination: {}", path);
            Ok(Box::new(LocalTransport::new(path)))
        }
        TransportType::Ftp => {
            let host = config
                .host
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("FTP destination requires host"))?;
            info!("FTP destination: {}:{}", host, config.port.unwrap_or(21));
            Ok(Box::new(FtpTransport::new(config.clone())))
        }
        TransportType::Sftp => {
            let host = config
                .host
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("SFTP destination requires host"))?;
            info!("SFTP destination: {}:{}", host, config.port.unwrap_or(22));
            Ok(Box::new(SftpTransport::new(config.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn remote_join_uses_forward_slashes() {
        assert_eq!(join_remote("_Arcade/", "/cores"), "_Arcade/cores");
        assert_eq!(join_remote("", "games"), "games");
        assert_eq!(join_remote("games", ""), "games");
    }

    #[test]
    fn parent_of_relative_paths() {
        assert_eq!(parent_dir("_Arcade/cores/a.rbf"), Some("_Arcade/cores"));
        assert_eq!(parent_dir("a.mra"), None);
    }

    /// Local listing without the walkdir override, so the default `walk` runs
    struct ListOnly(LocalTransport);

    #[async_trait]
    impl Transport for ListOnly {
        async fn connect(&mut self) -> Result<()> {
            self.0.connect().await
        }
        async fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }
        async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
            self.0.list_dir(path).await
        }
        async fn is_dir(&self, path: &str) -> Result<bool> {
            self.0.is_dir(path).await
        }
        async fn mk_dir(&self, path: &str, recursive: bool) -> Result<()> {
            self.0.mk_dir(path, recursive).await
        }
        async fn rm_dir(&self, path: &str) -> Result<()> {
            self.0.rm_dir(path).await
        }
        async fn put_file(&self, stream: ByteStream, dest_path: &str) -> Result<u64> {
            self.0.put_file(stream, dest_path).await
        }
        async fn delete_file(&self, path: &str) -> Result<()> {
            self.0.delete_file(path).await
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            self.0.exists(path).await
        }
        fn join_path(&self, base: &str, child: &str) -> String {
            self.0.join_path(base, child)
        }
        fn name(&self) -> &str {
            "list-only"
        }
    }

    #[tokio::test]
    async fn default_walk_prunes_hidden_directories() {
        let dir = tempfile::tempdir().unwrap();
        for path in ["_Arcade/1942.mra", "_Arcade/.Trash/old/x.mra", "_Arcade/_Alt/.keep"] {
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, b"x").unwrap();
        }
        let transport = ListOnly(LocalTransport::new(dir.path().to_str().unwrap()));

        let mut walked: Vec<String> = transport
            .walk("_Arcade")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        walked.sort();
        assert_eq!(walked, vec!["_Arcade/1942.mra", "_Arcade/_Alt"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_policy_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(SFTP_CONNECT_RETRY, "connect", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("refused")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(SFTP_CONNECT_RETRY, "connect", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(anyhow::anyhow!("not yet"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 1);
    }
}

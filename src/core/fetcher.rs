//! HTTP downloads behind a trait so the catalog builder can be tested offline

use crate::error::SyncError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Result of saving a remote file to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Download {
    /// Bytes written
    Saved(u64),
    /// The server answered 404
    NotFound,
}

/// `<file>.part` next to the final path
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Write `data` to `<dest>.part`, then rename over `dest`
pub async fn write_atomic(dest: &Path, data: &[u8]) -> Result<(), SyncError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp = part_path(dest);
    fs::write(&temp, data).await?;
    fs::rename(&temp, dest).await?;
    Ok(())
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Whole body in memory; non-success statuses are network errors
    async fn fetch(&self, url: &str) -> Result<Bytes, SyncError>;

    /// Save the body to `dest` through a `.part` file
    async fn download_to(&self, url: &str, dest: &Path) -> Result<Download, SyncError> {
        let data = self.fetch(url).await?;
        write_atomic(dest, &data).await?;
        Ok(Download::Saved(data.len() as u64))
    }
}

pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, SyncError> {
        let client = Client::builder()
            .user_agent(concat!("arcadesync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, url: &str) -> Result<Bytes, SyncError> {
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(SyncError::network(format!(
                "HTTP {} for {}",
                response.status(),
                url
            )));
        }
        Ok(response.bytes().await?)
    }

    async fn download_to(&self, url: &str, dest: &Path) -> Result<Download, SyncError> {
        debug!("GET {} -> {:?}", url, dest);
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Download::NotFound);
        }
        if !response.status().is_success() {
            return Err(SyncError::network(format!(
                "HTTP {} for {}",
                response.status(),
                url
            )));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp = part_path(dest);
        let mut file = fs::File::create(&temp).await?;
        let mut written = 0u64;
        let mut body = response.bytes_stream();
        let copied: Result<(), SyncError> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(e) = copied {
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }
        fs::rename(&temp, dest).await?;
        Ok(Download::Saved(written))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves canned bodies and records every request
    #[derive(Default)]
    pub struct MemoryDownloader {
        files: Mutex<HashMap<String, Bytes>>,
        requests: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MemoryDownloader {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, url: &str, body: impl Into<Bytes>) {
            self.files
                .lock()
                .unwrap()
                .insert(url.to_string(), body.into());
        }

        pub fn remove(&self, url: &str) {
            self.files.lock().unwrap().remove(url);
        }

        /// Most `download_to` calls that were running at once
        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        pub fn request_count(&self, url: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|u| u.as_str() == url)
                .count()
        }

        pub fn clear_requests(&self) {
            self.requests.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl Downloader for MemoryDownloader {
        async fn fetch(&self, url: &str) -> Result<Bytes, SyncError> {
            self.requests.lock().unwrap().push(url.to_string());
            self.files
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| SyncError::network(format!("HTTP 404 Not Found for {}", url)))
        }

        async fn download_to(&self, url: &str, dest: &Path) -> Result<Download, SyncError> {
            self.requests.lock().unwrap().push(url.to_string());
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            // let concurrently polled downloads overlap
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let body = self.files.lock().unwrap().get(url).cloned();
            match body {
                Some(data) => {
                    write_atomic(dest, &data).await?;
                    Ok(Download::Saved(data.len() as u64))
                }
                None => Ok(Download::NotFound),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryDownloader;
    use super::*;

    #[test]
    fn part_file_sits_next_to_target() {
        let part = part_path(Path::new("/cache/gameCache/db/_Arcade/a.mra"));
        assert_eq!(part, PathBuf::from("/cache/gameCache/db/_Arcade/a.mra.part"));
    }

    #[tokio::test]
    async fn download_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested/a.zip");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, b"old contents that are longer").unwrap();

        let downloader = MemoryDownloader::new();
        downloader.insert("http://h/a.zip", Bytes::from_static(b"new"));
        let result = downloader.download_to("http://h/a.zip", &dest).await.unwrap();

        assert_eq!(result, Download::Saved(3));
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn missing_url_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = MemoryDownloader::new();
        let result = downloader
            .download_to("http://h/gone.zip", &dir.path().join("gone.zip"))
            .await
            .unwrap();
        assert_eq!(result, Download::NotFound);
        assert!(downloader.fetch("http://h/gone.zip").await.is_err());
    }
}

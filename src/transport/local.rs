use super::{is_hidden, ByteStream, DirEntry, Transport};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

/// Export into a directory on this machine (SD card reader, mounted share)
pub struct LocalTransport {
    base_path: PathBuf,
    name: String,
}

impl LocalTransport {
    pub fn new(path: &str) -> Self {
        Self {
            base_path: PathBuf::from(path),
            name: format!("local:{}", path),
        }
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let base = self.base_path.to_string_lossy().into_owned();
        let joined = path
            .trim_start_matches('\\')
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(base, |acc, part| self.join_path(&acc, part));
        PathBuf::from(joined)
    }

    fn relative(base: &Path, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(base).ok()?.to_str()?;
        Some(rel.replace('\\', "/"))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&mut self) -> Result<()> {
        if !self.base_path.is_dir() {
            anyhow::bail!("Destination {:?} is not a directory", self.base_path);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = self.resolve_path(path);
        let mut reader = fs::read_dir(&dir).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let metadata = entry.metadata().await?;
            let Some(rel) = Self::relative(&self.base_path, &entry.path()) else {
                continue;
            };
            entries.push(DirEntry {
                path: rel,
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }
        Ok(entries)
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        match fs::metadata(self.resolve_path(path)).await {
            Ok(m) => Ok(m.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn mk_dir(&self, path: &str, recursive: bool) -> Result<()> {
        let full_path = self.resolve_path(path);
        if recursive {
            fs::create_dir_all(&full_path).await?;
        } else if !full_path.is_dir() {
            fs::create_dir(&full_path).await?;
        }
        Ok(())
    }

    async fn rm_dir(&self, path: &str) -> Result<()> {
        fs::remove_dir(self.resolve_path(path)).await?;
        Ok(())
    }

    async fn put_file(&self, mut stream: ByteStream, dest_path: &str) -> Result<u64> {
        let full_path = self.resolve_path(dest_path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // write next to the target, then rename over it
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = full_path.with_file_name(format!(".{}.part", file_name));
        let mut file = fs::File::create(&temp_path).await?;
        let mut written = 0u64;
        let copied: Result<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(e) = copied {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        fs::rename(&temp_path, &full_path).await?;
        Ok(written)
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.resolve_path(path)).await?)
    }

    fn join_path(&self, base: &str, child: &str) -> String {
        Path::new(base)
            .join(child.trim_start_matches('/'))
            .to_string_lossy()
            .into_owned()
    }

    async fn walk(&self, path: &str) -> Result<Vec<DirEntry>> {
        let root = self.resolve_path(path);
        if !root.exists() {
            return Ok(Vec::new());
        }
        let base_path = self.base_path.clone();

        // walkdir is blocking
        let entries = tokio::task::spawn_blocking(move || {
            WalkDir::new(&root)
                .min_depth(1)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !is_hidden(&e.file_name().to_string_lossy()))
                .filter_map(|e| e.ok())
                .filter_map(|entry| {
                    let metadata = entry.metadata().ok()?;
                    Some(DirEntry {
                        path: Self::relative(&base_path, entry.path())?,
                        name: entry.file_name().to_string_lossy().into_owned(),
                        is_dir: metadata.is_dir(),
                        size: if metadata.is_dir() { 0 } else { metadata.len() },
                    })
                })
                .collect::<Vec<_>>()
        })
        .await?;

        Ok(entries)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn bytes_stream(data: &'static [u8]) -> ByteStream {
        Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(data))]))
    }

    #[tokio::test]
    async fn put_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = LocalTransport::new(dir.path().to_str().unwrap());
        transport.connect().await.unwrap();

        transport.mk_dir("_Arcade/cores", true).await.unwrap();
        let written = transport
            .put_file(bytes_stream(b"core"), "_Arcade/cores/foo_20230101.rbf")
            .await
            .unwrap();
        assert_eq!(written, 4);
        assert!(transport.exists("_Arcade/cores/foo_20230101.rbf").await.unwrap());
        assert!(transport.is_dir("_Arcade").await.unwrap());

        let listing = transport.list_dir("_Arcade/cores").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].path, "_Arcade/cores/foo_20230101.rbf");

        transport.mk_dir("_Arcade/.Trash/old", true).await.unwrap();
        transport
            .put_file(bytes_stream(b"gone"), "_Arcade/.Trash/old/x.mra")
            .await
            .unwrap();
        let walked = transport.walk("_Arcade").await.unwrap();
        let mut paths: Vec<_> = walked.iter().map(|e| e.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["_Arcade/cores", "_Arcade/cores/foo_20230101.rbf"]);
        transport.delete_file("_Arcade/.Trash/old/x.mra").await.unwrap();
        transport.rm_dir("_Arcade/.Trash/old").await.unwrap();
        transport.rm_dir("_Arcade/.Trash").await.unwrap();

        transport
            .delete_file("_Arcade/cores/foo_20230101.rbf")
            .await
            .unwrap();
        transport.rm_dir("_Arcade/cores").await.unwrap();
        assert!(!transport.exists("_Arcade/cores").await.unwrap());
    }

    #[test]
    fn local_paths_join_host_native() {
        let transport = LocalTransport::new("/mnt/sd");
        let expected = Path::new("/mnt/sd").join("_Arcade").join("cores");
        assert_eq!(transport.resolve_path("/_Arcade/cores/"), expected);
        assert_eq!(transport.resolve_path(""), PathBuf::from("/mnt/sd"));
        assert_eq!(
            transport.join_path("/mnt/sd/_Arcade", "/cores"),
            expected.to_string_lossy()
        );
    }

    #[tokio::test]
    async fn put_overwrites_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalTransport::new(dir.path().to_str().unwrap());
        transport
            .put_file(bytes_stream(b"a much longer first version"), "a.mra")
            .await
            .unwrap();
        transport.put_file(bytes_stream(b"short"), "a.mra").await.unwrap();
        let content = std::fs::read(dir.path().join("a.mra")).unwrap();
        assert_eq!(content, b"short");
    }

    #[tokio::test]
    async fn connect_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let mut transport = LocalTransport::new(missing.to_str().unwrap());
        assert!(transport.connect().await.is_err());
    }
}

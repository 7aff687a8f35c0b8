//! opendal-backed operations shared by the FTP and SFTP transports

use super::{join_remote, ByteStream, DirEntry};
use anyhow::Result;
use futures::StreamExt;
use opendal::{ErrorKind, Operator};

pub struct RemoteOps {
    operator: Operator,
}

fn dir_path(path: &str) -> String {
    let path = path.trim_matches('/');
    if path.is_empty() {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

fn file_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

impl RemoteOps {
    pub fn new(operator: Operator) -> Self {
        Self { operator }
    }

    /// Round-trip to the server so a bad host or login fails at connect time
    pub async fn check(&self) -> Result<()> {
        self.operator.check().await?;
        Ok(())
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = dir_path(path);
        let entries = self.operator.list(&dir).await?;
        let parent = path.trim_matches('/');
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let name = entry.name().trim_end_matches('/').to_string();
                let is_dir = entry.metadata().is_dir();
                // opendal lists the directory itself as well
                if name.is_empty() || entry.path().trim_end_matches('/') == parent {
                    return None;
                }
                Some(DirEntry {
                    path: join_remote(parent, &name),
                    name,
                    is_dir,
                    size: entry.metadata().content_length(),
                })
            })
            .collect())
    }

    pub async fn is_dir(&self, path: &str) -> Result<bool> {
        match self.operator.stat(&dir_path(path)).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn mk_dir(&self, path: &str, recursive: bool) -> Result<()> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Ok(());
        }
        if !recursive {
            if let Some(parent) = super::parent_dir(path) {
                if !self.is_dir(parent).await? {
                    anyhow::bail!("Parent directory {} does not exist", parent);
                }
            }
            self.operator.create_dir(&dir_path(path)).await?;
            return Ok(());
        }
        // some servers refuse nested creates, walk down one level at a time
        let mut current = String::new();
        for part in path.split('/').filter(|s| !s.is_empty()) {
            current = join_remote(&current, part);
            if !self.is_dir(&current).await? {
                self.operator.create_dir(&dir_path(&current)).await?;
            }
        }
        Ok(())
    }

    pub async fn rm_dir(&self, path: &str) -> Result<()> {
        self.operator.delete(&dir_path(path)).await?;
        Ok(())
    }

    pub async fn put_file(&self, mut stream: ByteStream, dest_path: &str) -> Result<u64> {
        let mut writer = self.operator.writer(&file_path(dest_path)).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e);
                }
            };
            written += chunk.len() as u64;
            writer.write(chunk).await?;
        }
        writer.close().await?;
        Ok(written)
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        match self.operator.delete(&file_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.operator.stat(&file_path(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(self.is_dir(path).await?),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_paths_end_with_slash() {
        assert_eq!(dir_path("_Arcade/cores"), "_Arcade/cores/");
        assert_eq!(dir_path("/"), "/");
        assert_eq!(file_path("/games\\mame/a.zip"), "games/mame/a.zip");
    }
}

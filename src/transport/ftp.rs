use super::remote::RemoteOps;
use super::{join_remote, ByteStream, DirEntry, Transport};
use crate::db::TransportConfig;
use anyhow::Result;
use async_trait::async_trait;
use opendal::Operator;
use tracing::debug;

/// Plain FTP target, the MiSTer ships with an FTP daemon enabled
pub struct FtpTransport {
    config: TransportConfig,
    ops: Option<RemoteOps>,
    name: String,
}

impl FtpTransport {
    pub fn new(config: TransportConfig) -> Self {
        let name = format!(
            "ftp://{}:{}{}",
            config.host.as_deref().unwrap_or_default(),
            config.port.unwrap_or(21),
            config.root.as_deref().unwrap_or("/")
        );
        Self {
            config,
            ops: None,
            name,
        }
    }

    fn build_operator(&self) -> Result<Operator> {
        use opendal::services::Ftp;

        let host = self
            .config
            .host
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("FTP destination requires host"))?;
        let endpoint = format!("ftp://{}:{}", host, self.config.port.unwrap_or(21));

        let mut builder = Ftp::default()
            .endpoint(&endpoint)
            .root(self.config.root.as_deref().unwrap_or("/"));
        if let Some(user) = &self.config.user {
            builder = builder.user(user);
        }
        if let Some(password) = &self.config.password {
            builder = builder.password(password);
        }
        Ok(Operator::new(builder)?.finish())
    }

    fn ops(&self) -> Result<&RemoteOps> {
        self.ops
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("{} is not connected", self.name))
    }
}

#[async_trait]
impl Transport for FtpTransport {
    async fn connect(&mut self) -> Result<()> {
        let ops = RemoteOps::new(self.build_operator()?);
        ops.check().await?;
        debug!("Connected to {}", self.name);
        self.ops = Some(ops);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.ops.take().is_some() {
            debug!("Disconnected from {}", self.name);
        }
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.ops()?.list_dir(path).await
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        self.ops()?.is_dir(path).await
    }

    async fn mk_dir(&self, path: &str, recursive: bool) -> Result<()> {
        self.ops()?.mk_dir(path, recursive).await
    }

    async fn rm_dir(&self, path: &str) -> Result<()> {
        self.ops()?.rm_dir(path).await
    }

    async fn put_file(&self, stream: ByteStream, dest_path: &str) -> Result<u64> {
        self.ops()?.put_file(stream, dest_path).await
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.ops()?.delete_file(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.ops()?.exists(path).await
    }

    fn join_path(&self, base: &str, child: &str) -> String {
        join_remote(base, child)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_paths_join_with_forward_slashes() {
        let transport = FtpTransport::new(TransportConfig::default());
        assert_eq!(transport.join_path("_Arcade", "cores"), "_Arcade/cores");
        assert_eq!(transport.join_path("games/mame/", "/1942.zip"), "games/mame/1942.zip");
    }
}

use super::remote::RemoteOps;
use super::ssh::{PasswordLogin, PasswordSftp};
use super::{join_remote, retry_with_backoff, ByteStream, DirEntry, Transport, SFTP_CONNECT_RETRY};
use crate::db::TransportConfig;
use anyhow::Result;
use async_trait::async_trait;
use opendal::Operator;
use tracing::debug;

/// How an SFTP session logs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SftpAuth {
    /// libssh2 session with `user`/`password`
    Password,
    /// opendal's sftp service, through `key` or the ssh agent
    KeyOrAgent,
}

impl SftpAuth {
    /// A configured key wins over a password
    pub fn for_config(config: &TransportConfig) -> Self {
        let has_password = config.password.as_deref().is_some_and(|p| !p.is_empty());
        if has_password && config.key.is_none() {
            SftpAuth::Password
        } else {
            SftpAuth::KeyOrAgent
        }
    }
}

enum Session {
    Agent(RemoteOps),
    Password(PasswordSftp),
}

/// SFTP target
pub struct SftpTransport {
    config: TransportConfig,
    session: Option<Session>,
    name: String,
}

impl SftpTransport {
    pub fn new(config: TransportConfig) -> Self {
        let name = format!(
            "sftp://{}@{}:{}{}",
            config.user.as_deref().unwrap_or("root"),
            config.host.as_deref().unwrap_or_default(),
            config.port.unwrap_or(22),
            config.root.as_deref().unwrap_or("/")
        );
        Self {
            config,
            session: None,
            name,
        }
    }

    fn host(&self) -> Result<&str> {
        self.config
            .host
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("SFTP destination requires host"))
    }

    fn build_operator(&self) -> Result<Operator> {
        use opendal::services::Sftp;

        let endpoint = format!("ssh://{}:{}", self.host()?, self.config.port.unwrap_or(22));
        let mut builder = Sftp::default()
            .endpoint(&endpoint)
            .user(self.config.user.as_deref().unwrap_or("root"))
            .root(self.config.root.as_deref().unwrap_or("/"))
            // embedded targets regenerate host keys on reflash
            .known_hosts_strategy("accept");
        if let Some(key) = &self.config.key {
            builder = builder.key(key);
        }
        Ok(Operator::new(builder)?.finish())
    }

    fn password_login(&self) -> Result<PasswordLogin> {
        Ok(PasswordLogin {
            host: self.host()?.to_string(),
            port: self.config.port.unwrap_or(22),
            user: self.config.user.clone().unwrap_or_else(|| "root".to_string()),
            password: self.config.password.clone().unwrap_or_default(),
            root: self.config.root.clone().unwrap_or_else(|| "/".to_string()),
        })
    }

    async fn open(&self) -> Result<Session> {
        match SftpAuth::for_config(&self.config) {
            SftpAuth::Password => Ok(Session::Password(
                PasswordSftp::connect(self.password_login()?).await?,
            )),
            SftpAuth::KeyOrAgent => {
                let ops = RemoteOps::new(self.build_operator()?);
                ops.check().await?;
                Ok(Session::Agent(ops))
            }
        }
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("{} is not connected", self.name))
    }
}

#[async_trait]
impl Transport for SftpTransport {
    async fn connect(&mut self) -> Result<()> {
        let this = &*self;
        let auth = SftpAuth::for_config(&self.config);
        let session = retry_with_backoff(SFTP_CONNECT_RETRY, "SFTP connect", move || this.open()).await?;
        debug!("Connected to {} ({:?})", self.name, auth);
        self.session = Some(session);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.session.take().is_some() {
            debug!("Disconnected from {}", self.name);
        }
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        match self.session()? {
            Session::Agent(ops) => ops.list_dir(path).await,
            Session::Password(sftp) => sftp.list_dir(path).await,
        }
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        match self.session()? {
            Session::Agent(ops) => ops.is_dir(path).await,
            Session::Password(sftp) => sftp.is_dir(path).await,
        }
    }

    async fn mk_dir(&self, path: &str, recursive: bool) -> Result<()> {
        match self.session()? {
            Session::Agent(ops) => ops.mk_dir(path, recursive).await,
            Session::Password(sftp) => sftp.mk_dir(path, recursive).await,
        }
    }

    async fn rm_dir(&self, path: &str) -> Result<()> {
        match self.session()? {
            Session::Agent(ops) => ops.rm_dir(path).await,
            Session::Password(sftp) => sftp.rm_dir(path).await,
        }
    }

    async fn put_file(&self, stream: ByteStream, dest_path: &str) -> Result<u64> {
        match self.session()? {
            Session::Agent(ops) => ops.put_file(stream, dest_path).await,
            Session::Password(sftp) => sftp.put_file(stream, dest_path).await,
        }
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        match self.session()? {
            Session::Agent(ops) => ops.delete_file(path).await,
            Session::Password(sftp) => sftp.delete_file(path).await,
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.session()? {
            Session::Agent(ops) => ops.exists(path).await,
            Session::Password(sftp) => sftp.exists(path).await,
        }
    }

    fn join_path(&self, base: &str, child: &str) -> String {
        join_remote(base, child)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

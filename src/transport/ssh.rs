//! Password-authenticated SFTP over libssh2. The session is blocking, so every
//! call runs on the blocking pool.

use super::{join_remote, ByteStream, DirEntry};
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use ssh2::{ErrorCode, RenameFlags, Session, Sftp};
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// `LIBSSH2_FX_NO_SUCH_FILE`
const NO_SUCH_FILE: i32 = 2;
const IO_TIMEOUT: Duration = Duration::from_secs(30);
const DIR_MODE: i32 = 0o755;

#[derive(Debug, Clone)]
pub struct PasswordLogin {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub root: String,
}

pub struct PasswordSftp {
    sftp: Arc<Mutex<Sftp>>,
    _session: Session,
    root: String,
}

fn is_not_found(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::SFTP(NO_SUCH_FILE))
}

/// Server-side path of a transport-relative path
fn remote_path(root: &str, path: &str) -> String {
    let root = root.trim_end_matches('/');
    let path = path.trim_matches('/');
    match (root.is_empty(), path.is_empty()) {
        (true, true) => "/".to_string(),
        (false, true) => root.to_string(),
        _ => format!("{}/{}", root, path),
    }
}

impl PasswordSftp {
    pub async fn connect(login: PasswordLogin) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::connect_blocking(login)).await?
    }

    fn connect_blocking(login: PasswordLogin) -> Result<Self> {
        let addr = (login.host.as_str(), login.port)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}", login.host))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("No address for {}", login.host))?;
        let tcp = TcpStream::connect_timeout(&addr, IO_TIMEOUT)
            .with_context(|| format!("Failed to reach {}:{}", login.host, login.port))?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(IO_TIMEOUT.as_millis() as u32);
        session
            .handshake()
            .with_context(|| format!("SSH handshake with {} failed", login.host))?;
        session
            .userauth_password(&login.user, &login.password)
            .with_context(|| format!("Password login rejected for {}", login.user))?;
        let sftp = session.sftp()?;

        Ok(Self {
            sftp: Arc::new(Mutex::new(sftp)),
            _session: session,
            root: login.root,
        })
    }

    /// Start `op` on the blocking pool right away, holding the session lock
    fn spawn<T, F>(&self, op: F) -> JoinHandle<Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
    {
        let sftp = self.sftp.clone();
        tokio::task::spawn_blocking(move || {
            let sftp = sftp
                .lock()
                .map_err(|_| anyhow::anyhow!("SFTP session poisoned"))?;
            op(&sftp)
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
    {
        self.spawn(op).await?
    }

    fn path(&self, path: &str) -> PathBuf {
        PathBuf::from(remote_path(&self.root, path))
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = self.path(path);
        let parent = path.trim_matches('/').to_string();
        self.run(move |sftp| {
            let listing = sftp.readdir(&dir)?;
            Ok(listing
                .into_iter()
                .filter_map(|(full, stat)| {
                    let name = full.file_name()?.to_string_lossy().into_owned();
                    if name == "." || name == ".." {
                        return None;
                    }
                    let is_dir = stat.is_dir();
                    Some(DirEntry {
                        path: join_remote(&parent, &name),
                        name,
                        is_dir,
                        size: if is_dir { 0 } else { stat.size.unwrap_or(0) },
                    })
                })
                .collect())
        })
        .await
    }

    pub async fn is_dir(&self, path: &str) -> Result<bool> {
        let target = self.path(path);
        self.run(move |sftp| match sftp.stat(&target) {
            Ok(stat) => Ok(stat.is_dir()),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        let target = self.path(path);
        self.run(move |sftp| match sftp.stat(&target) {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }

    pub async fn mk_dir(&self, path: &str, recursive: bool) -> Result<()> {
        let path = path.trim_matches('/').to_string();
        if path.is_empty() {
            return Ok(());
        }
        let mut levels = Vec::new();
        if recursive {
            let mut current = String::new();
            for part in path.split('/').filter(|s| !s.is_empty()) {
                current = join_remote(&current, part);
                levels.push(self.path(&current));
            }
        } else {
            levels.push(self.path(&path));
        }

        self.run(move |sftp| {
            for dir in levels {
                match sftp.stat(&dir) {
                    Ok(stat) if stat.is_dir() => {}
                    Ok(_) => anyhow::bail!("{:?} exists and is not a directory", dir),
                    Err(e) if is_not_found(&e) => sftp.mkdir(&dir, DIR_MODE)?,
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn rm_dir(&self, path: &str) -> Result<()> {
        let target = self.path(path);
        self.run(move |sftp| Ok(sftp.rmdir(&target)?)).await
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let target = self.path(path);
        self.run(move |sftp| match sftp.unlink(&target) {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }

    /// Upload next to the target, then rename over it
    pub async fn put_file(&self, mut stream: ByteStream, dest_path: &str) -> Result<u64> {
        let dest = self.path(dest_path);
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = dest.with_file_name(format!(".{}.part", file_name));

        // `None` commits the upload; a dropped sender aborts it
        let (tx, rx) = mpsc::channel::<Option<Bytes>>(8);
        let upload = self.spawn(move |sftp| upload_blocking(sftp, &temp, &dest, rx));

        let mut sent: Result<()> = Ok(());
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    // the writer stopped; its error is returned below
                    if tx.send(Some(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    sent = Err(e);
                    break;
                }
            }
        }
        if sent.is_ok() {
            let _ = tx.send(None).await;
        }
        drop(tx);

        let written = upload.await?;
        sent?;
        written
    }
}

fn upload_blocking(
    sftp: &Sftp,
    temp: &Path,
    dest: &Path,
    mut rx: mpsc::Receiver<Option<Bytes>>,
) -> Result<u64> {
    let mut file = sftp.create(temp)?;
    let mut written = 0u64;
    let copied = (|| -> Result<bool> {
        while let Some(message) = rx.blocking_recv() {
            match message {
                Some(chunk) => {
                    file.write_all(&chunk)?;
                    written += chunk.len() as u64;
                }
                None => return Ok(true),
            }
        }
        Ok(false)
    })();
    drop(file);

    match copied {
        Ok(true) => {}
        Ok(false) => {
            let _ = sftp.unlink(temp);
            anyhow::bail!("Upload of {:?} aborted", dest);
        }
        Err(e) => {
            let _ = sftp.unlink(temp);
            return Err(e);
        }
    }

    let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
    if sftp.rename(temp, dest, Some(flags)).is_err() {
        // SFTP v3 servers refuse to rename over an existing file
        let _ = sftp.unlink(dest);
        sftp.rename(temp, dest, None)
            .with_context(|| format!("Failed to move upload into {:?}", dest))?;
    }
    Ok(written)
}

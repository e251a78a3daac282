//! Public FTP client facade.
//!
//! Owns the connection pool and the transfer engine. All operations take
//! `&self`, so one client can be shared (e.g. behind an `Arc`) and used
//! concurrently; each call checks out its own control channel.

use crate::ftp::config::{FtpOptions, SessionConfig};
use crate::ftp::engine::{Operation, TransferEngine};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::pool::ConnectionPool;
use crate::ftp::types::{FileMetadata, PoolStats};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// A pooled FTP/FTPS client bound to one server.
pub struct FtpClient {
    config: Arc<SessionConfig>,
    engine: TransferEngine,
}

impl FtpClient {
    /// Connect to `ftp[s]://user:password@host:port`.
    ///
    /// The first control channel is opened eagerly so that an unreachable
    /// server or bad credentials fail here rather than on first use.
    pub async fn connect(url: &str, options: Option<FtpOptions>) -> FtpResult<Self> {
        let config = Arc::new(SessionConfig::from_url(url, options.unwrap_or_default())?);
        let pool = ConnectionPool::new(Arc::clone(&config))?;

        pool.acquire().await?.release(true);
        log::info!(
            "FTP client connected to {} as {} (max {} channels)",
            config.address(),
            config.user,
            config.connections_per_host
        );

        Ok(Self {
            config,
            engine: TransferEngine::new(pool),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ─── Directories ─────────────────────────────────────────────

    /// Create a directory; returns the path reported by the server.
    pub async fn mkdir(&self, path: &str) -> FtpResult<String> {
        self.engine
            .run(&mut Operation::Mkdir { path })
            .await?
            .into_path()
    }

    /// List a directory (MLSD when available, LIST otherwise).
    pub async fn read_dir(&self, path: &str) -> FtpResult<Vec<FileMetadata>> {
        self.engine
            .run(&mut Operation::List { path })
            .await?
            .into_listing()
    }

    /// Current working directory of a pooled session.
    pub async fn working_directory(&self) -> FtpResult<String> {
        self.engine.run(&mut Operation::Pwd).await?.into_path()
    }

    // ─── Entries ─────────────────────────────────────────────────

    pub async fn stat(&self, path: &str) -> FtpResult<FileMetadata> {
        self.engine
            .run(&mut Operation::Stat { path })
            .await?
            .into_metadata()
    }

    /// Delete a file, or remove an (empty) directory.
    pub async fn delete(&self, path: &str) -> FtpResult<()> {
        self.engine.run(&mut Operation::Delete { path }).await?;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> FtpResult<()> {
        self.engine
            .run(&mut Operation::Rename { from, to })
            .await?;
        Ok(())
    }

    // ─── Transfers ───────────────────────────────────────────────

    /// Download `remote_path` into a local file (created or truncated).
    ///
    /// Data lands in `<name>.part` next to the target and is renamed over
    /// it only once the transfer completed, so a failed download leaves an
    /// existing local file untouched.
    pub async fn download(&self, remote_path: &str, local_path: impl AsRef<Path>) -> FtpResult<u64> {
        let local_path = local_path.as_ref();
        let partial = partial_path(local_path);
        let mut file = fs::File::create(&partial).await.map_err(|e| {
            FtpError::transfer_failed(format!("Cannot create {}: {}", partial.display(), e))
        })?;

        let outcome = match self.download_to(remote_path, &mut file).await {
            Ok(bytes) => file.flush().await.map(|_| bytes).map_err(|e| {
                FtpError::transfer_failed(format!("Writing {}: {}", partial.display(), e))
            }),
            Err(e) => Err(e),
        };
        drop(file);

        match outcome {
            Ok(bytes) => {
                fs::rename(&partial, local_path).await.map_err(|e| {
                    FtpError::transfer_failed(format!(
                        "Cannot move {} to {}: {}",
                        partial.display(),
                        local_path.display(),
                        e
                    ))
                })?;
                Ok(bytes)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&partial).await {
                    log::warn!("Could not remove partial download {}: {}", partial.display(), rm);
                }
                Err(e)
            }
        }
    }

    /// Download `remote_path` into any async sink.
    pub async fn download_to<W>(&self, remote_path: &str, sink: &mut W) -> FtpResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut op = Operation::Retrieve {
            path: remote_path,
            sink,
            written: 0,
        };
        self.engine.run(&mut op).await?.into_bytes()
    }

    /// Upload a local file to `remote_path`.
    pub async fn upload(&self, local_path: impl AsRef<Path>, remote_path: &str) -> FtpResult<u64> {
        let local_path = local_path.as_ref();
        let mut file = fs::File::open(local_path).await.map_err(|e| {
            FtpError::transfer_failed(format!("Cannot open {}: {}", local_path.display(), e))
        })?;
        self.upload_from(&mut file, remote_path).await
    }

    /// Upload everything `source` yields to `remote_path`.
    pub async fn upload_from<R>(&self, source: &mut R, remote_path: &str) -> FtpResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut op = Operation::Store {
            path: remote_path,
            source,
            consumed: 0,
        };
        self.engine.run(&mut op).await?.into_bytes()
    }

    // ─── Pool ────────────────────────────────────────────────────

    pub fn pool_stats(&self) -> PoolStats {
        self.engine.pool().stats()
    }

    /// QUIT idle channels; further operations fail with `NotReady`.
    pub async fn close(&self) {
        self.engine.pool().close().await;
    }
}

impl std::fmt::Debug for FtpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpClient")
            .field("config", &self.config)
            .field("pool", &self.pool_stats())
            .finish()
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

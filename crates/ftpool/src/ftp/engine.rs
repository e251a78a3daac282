//! Transfer engine — runs one operation on a pooled channel.
//!
//! Every operation goes through [`TransferEngine::run`]: acquire a channel,
//! perform the exchange, release the channel (retiring it after a fatal
//! error), and retry transient failures on another channel when the
//! operation allows it.

use crate::ftp::channel::ControlChannel;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::parser::ListingParser;
use crate::ftp::pool::{ConnectionPool, PooledChannel};
use crate::ftp::types::FileMetadata;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// One logical operation.
pub enum Operation<'a> {
    /// STOR from a byte source. `consumed` counts bytes taken from it.
    Store {
        path: &'a str,
        source: &'a mut (dyn AsyncRead + Unpin + Send),
        consumed: u64,
    },
    /// RETR into a byte sink. `written` counts bytes delivered to it and is
    /// the REST offset of a resumed attempt.
    Retrieve {
        path: &'a str,
        sink: &'a mut (dyn AsyncWrite + Unpin + Send),
        written: u64,
    },
    List { path: &'a str },
    Stat { path: &'a str },
    /// Stat, then RMD for directories or DELE otherwise.
    Delete { path: &'a str },
    Rename { from: &'a str, to: &'a str },
    Mkdir { path: &'a str },
    Pwd,
}

impl Operation<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Store { .. } => "upload",
            Self::Retrieve { .. } => "download",
            Self::List { .. } => "list",
            Self::Stat { .. } => "stat",
            Self::Delete { .. } => "delete",
            Self::Rename { .. } => "rename",
            Self::Mkdir { .. } => "mkdir",
            Self::Pwd => "pwd",
        }
    }

    fn path(&self) -> Option<&str> {
        match self {
            Self::Store { path, .. }
            | Self::Retrieve { path, .. }
            | Self::List { path }
            | Self::Stat { path }
            | Self::Delete { path }
            | Self::Mkdir { path } => Some(*path),
            Self::Rename { from, .. } => Some(*from),
            Self::Pwd => None,
        }
    }

    /// Whether another attempt is safe after a transient failure.
    fn can_retry(&self, rest_stream: bool) -> bool {
        match self {
            Self::Store { consumed, .. } => *consumed == 0,
            Self::Retrieve { written, .. } => *written == 0 || rest_stream,
            Self::List { .. } | Self::Stat { .. } | Self::Pwd => true,
            Self::Delete { .. } | Self::Rename { .. } | Self::Mkdir { .. } => false,
        }
    }
}

/// Result of an operation.
#[derive(Debug)]
pub enum Outcome {
    /// Bytes moved by a STOR or RETR (across all attempts).
    Transferred(u64),
    Listing(Vec<FileMetadata>),
    Metadata(FileMetadata),
    /// Path reported by MKD or PWD.
    Path(String),
    Done,
}

impl Outcome {
    pub fn into_bytes(self) -> FtpResult<u64> {
        match self {
            Self::Transferred(n) => Ok(n),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_listing(self) -> FtpResult<Vec<FileMetadata>> {
        match self {
            Self::Listing(entries) => Ok(entries),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_metadata(self) -> FtpResult<FileMetadata> {
        match self {
            Self::Metadata(meta) => Ok(meta),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_path(self) -> FtpResult<String> {
        match self {
            Self::Path(path) => Ok(path),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(outcome: &Outcome) -> FtpError {
    FtpError::protocol_error(format!("Unexpected operation outcome: {:?}", outcome))
}

/// Runs operations against a [`ConnectionPool`].
#[derive(Clone)]
pub struct TransferEngine {
    pool: Arc<ConnectionPool>,
}

impl TransferEngine {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// acquire → exchange → release, retrying transient failures.
    pub async fn run(&self, op: &mut Operation<'_>) -> FtpResult<Outcome> {
        let config = self.pool.config();
        let max_retries = config.transfer_retries;
        let mut attempt = 0u32;

        loop {
            let mut rest_stream = false;
            let result = match self.pool.acquire().await {
                Ok(pooled) => self.attempt(pooled, op, &mut rest_stream).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < max_retries && e.is_transient() && op.can_retry(rest_stream) => {
                    attempt += 1;
                    log::warn!(
                        "FTP {} on {} failed ({}); retrying ({}/{})",
                        op.name(),
                        config.address(),
                        e,
                        attempt,
                        max_retries
                    );
                }
                Err(e) => {
                    let e = match op.path() {
                        Some(path) => e.with_path(path),
                        None => e,
                    };
                    return Err(e.with_host(config.address()));
                }
            }
        }
    }

    async fn attempt(
        &self,
        mut pooled: PooledChannel,
        op: &mut Operation<'_>,
        rest_stream: &mut bool,
    ) -> FtpResult<Outcome> {
        let result = match pooled.channel() {
            Ok(channel) => {
                *rest_stream = channel.features().rest_stream;
                exchange(channel, op).await
            }
            Err(e) => Err(e),
        };

        let poisoned = pooled
            .channel()
            .map(|c| c.is_poisoned())
            .unwrap_or(true);
        let healthy = !poisoned
            && match &result {
                Ok(_) => true,
                Err(e) => !e.retires_channel(),
            };
        pooled.release(healthy);
        result
    }
}

/// The protocol exchange for one operation on one channel.
async fn exchange(channel: &mut ControlChannel, op: &mut Operation<'_>) -> FtpResult<Outcome> {
    let parser = ListingParser::new(channel.config().server_location);

    match op {
        Operation::Store {
            path,
            source,
            consumed,
        } => {
            let sent = channel.store(path, &mut **source, consumed).await?;
            Ok(Outcome::Transferred(sent))
        }
        Operation::Retrieve {
            path,
            sink,
            written,
        } => {
            let offset = *written;
            channel.retrieve(path, &mut **sink, offset, written).await?;
            Ok(Outcome::Transferred(*written))
        }
        Operation::List { path } => Ok(Outcome::Listing(channel.list(path, &parser).await?)),
        Operation::Stat { path } => Ok(Outcome::Metadata(channel.stat(path, &parser).await?)),
        Operation::Delete { path } => {
            let meta = channel.stat(path, &parser).await?;
            if meta.is_dir() {
                channel.remove_dir(path).await?;
            } else {
                channel.delete_file(path).await?;
            }
            Ok(Outcome::Done)
        }
        Operation::Rename { from, to } => {
            channel.rename(from, to).await?;
            Ok(Outcome::Done)
        }
        Operation::Mkdir { path } => Ok(Outcome::Path(channel.make_dir(path).await?)),
        Operation::Pwd => Ok(Outcome::Path(channel.working_directory().await?)),
    }
}

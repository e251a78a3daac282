//! File-level exchanges on a single control channel — STOR, RETR, SIZE,
//! MDTM.
//!
//! Each data transfer follows the same shape: negotiate the data
//! connection, send the command, wait for 1xx, complete the data
//! connection, stream, close it, then read the 226/250 completion.

use crate::ftp::channel::ControlChannel;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::parser::parse_timestamp;
use crate::ftp::transfer::{self, DataStream};
use crate::ftp::types::FtpResponse;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};

impl ControlChannel {
    // ─── UPLOAD (STOR) ───────────────────────────────────────────

    /// Upload everything `source` yields to `remote_path`.
    ///
    /// `consumed` counts bytes taken from `source`, including on failure,
    /// so callers can tell whether a retry is still possible.
    pub async fn store<R>(
        &mut self,
        remote_path: &str,
        source: &mut R,
        consumed: &mut u64,
    ) -> FtpResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.begin_transfer()?;
        let result = async {
            let cmd = format!("STOR {}", remote_path);
            let mut data = self.open_data(&cmd, 0).await?;
            let sent = data.copy_from(source, consumed).await?;
            data.finish().await?;
            self.complete_transfer(&cmd).await?;
            Ok::<_, FtpError>(sent)
        }
        .await;
        self.settle_transfer(result.is_ok());

        let sent = result.map_err(|e| e.with_path(remote_path))?;
        log::debug!("[{}] stored {} bytes to {}", self.id(), sent, remote_path);
        Ok(sent)
    }

    // ─── DOWNLOAD (RETR) ─────────────────────────────────────────

    /// Download `remote_path` into `sink`, starting at `offset` (REST).
    ///
    /// `written` counts bytes delivered to `sink`, including on failure.
    pub async fn retrieve<W>(
        &mut self,
        remote_path: &str,
        sink: &mut W,
        offset: u64,
        written: &mut u64,
    ) -> FtpResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.begin_transfer()?;
        let result = async {
            let cmd = format!("RETR {}", remote_path);
            let mut data = self.open_data(&cmd, offset).await?;
            let received = data.copy_to(sink, written).await?;
            drop(data);
            self.complete_transfer(&cmd).await?;
            Ok::<_, FtpError>(received)
        }
        .await;
        self.settle_transfer(result.is_ok());

        let received = result.map_err(|e| e.with_path(remote_path))?;
        log::debug!(
            "[{}] retrieved {} bytes from {} (offset {})",
            self.id(),
            received,
            remote_path,
            offset
        );
        Ok(received)
    }

    /// Run a data command whose whole payload is read into memory
    /// (LIST, MLSD).
    pub(crate) async fn read_data_command(&mut self, cmd: &str) -> FtpResult<Vec<u8>> {
        self.begin_transfer()?;
        let result = async {
            let mut data = self.open_data(cmd, 0).await?;
            let body = data.read_all().await?;
            drop(data);
            self.complete_transfer(cmd).await?;
            Ok::<_, FtpError>(body)
        }
        .await;
        self.settle_transfer(result.is_ok());
        result
    }

    // ─── Transfer plumbing ───────────────────────────────────────

    /// Leave the Busy state. After a failed transfer the server may still
    /// owe a reply, so the channel cannot be trusted any more.
    fn settle_transfer(&mut self, ok: bool) {
        if !ok {
            self.poison();
        }
        self.end_transfer();
    }

    /// Negotiate, optionally `REST`, send `cmd`, expect 1xx, then complete
    /// the data connection.
    async fn open_data(&mut self, cmd: &str, offset: u64) -> FtpResult<DataStream> {
        let pending = transfer::negotiate(self).await?;

        if offset > 0 {
            self.expect_raw(&format!("REST {}", offset), |c| c == 350)
                .await?;
        }

        let resp = self.raw(cmd).await?;
        if !resp.is_preliminary() {
            return Err(FtpError::from_reply(cmd, resp.code, resp.message()));
        }
        transfer::establish(self, pending).await
    }

    /// Read the reply that closes a transfer.
    async fn complete_transfer(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        let resp = self.read_reply().await?;
        match resp.code {
            226 | 250 => Ok(resp),
            code => Err(FtpError::from_reply(cmd, code, resp.message())),
        }
    }

    // ─── SIZE / MDTM ────────────────────────────────────────────

    /// Size of a remote file (RFC 3659 SIZE); `None` when refused.
    pub async fn size(&mut self, path: &str) -> FtpResult<Option<u64>> {
        let resp = self.execute(&format!("SIZE {}", path)).await?;
        if resp.code != 213 {
            return Ok(None);
        }
        resp.message()
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| FtpError::protocol_error(format!("Cannot parse SIZE: {}", resp.text())))
    }

    /// Modification time of a remote file (RFC 3659 MDTM); `None` when
    /// refused or unparseable.
    pub async fn modified_time(&mut self, path: &str) -> FtpResult<Option<DateTime<Utc>>> {
        let resp = self.execute(&format!("MDTM {}", path)).await?;
        if resp.code != 213 {
            return Ok(None);
        }
        Ok(parse_timestamp(resp.message()))
    }
}

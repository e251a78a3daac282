//! Control channel — one authenticated FTP session.
//!
//! Lifecycle: `connect()` → optional AUTH TLS upgrade → USER/PASS →
//! PBSZ/PROT (FTPS) → FEAT → OPTS UTF8 → TYPE I → Ready.
//!
//! The channel exposes low-level command helpers used by `transfer.rs`,
//! `file_ops.rs` and `directory.rs` for higher-level exchanges. It is owned
//! by exactly one holder at a time (the pool, or the caller that acquired
//! it), so nothing here is synchronised.

use crate::ftp::config::{SessionConfig, TlsMode};
use crate::ftp::connection;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::{mask_secret, FtpCodec};
use crate::ftp::tls;
use crate::ftp::types::{ChannelState, FtpResponse, ServerFeatures};
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// A connected FTP control channel.
pub struct ControlChannel {
    id: String,
    codec: FtpCodec,
    config: Arc<SessionConfig>,
    tls: Option<Arc<ClientConfig>>,
    state: ChannelState,
    features: ServerFeatures,
    last_response: Option<FtpResponse>,
    /// EPSV was rejected once; use PASV for the rest of this channel's life.
    epsv_failed: bool,
    /// A fatal error was observed; the channel must not be reused.
    poisoned: bool,
}

impl ControlChannel {
    /// Open, secure and log in a new control channel.
    pub async fn connect(
        config: Arc<SessionConfig>,
        tls_config: Option<Arc<ClientConfig>>,
    ) -> FtpResult<Self> {
        let host = config.address();
        Self::establish(config, tls_config)
            .await
            .map_err(|e| e.with_host(host))
    }

    async fn establish(
        config: Arc<SessionConfig>,
        tls_config: Option<Arc<ClientConfig>>,
    ) -> FtpResult<Self> {
        let id = Uuid::new_v4().to_string();
        let (mut codec, banner) = connection::connect(&config, tls_config.as_ref()).await?;
        log::debug!("[{}] greeting: {}", id, banner.message());

        // ── Explicit FTPS: AUTH TLS before any credentials ───────
        if let (Some(tls_cfg), TlsMode::Explicit) = (tls_config.as_ref(), config.tls_mode) {
            let resp = codec.execute("AUTH TLS").await?;
            if resp.code != 234 {
                return Err(FtpError::from_reply("AUTH TLS", resp.code, resp.message()));
            }
            codec = tls::upgrade_to_tls(codec, tls_cfg, &config).await?;
        }

        let mut channel = Self {
            id,
            codec,
            config,
            tls: tls_config,
            state: ChannelState::Connected,
            features: ServerFeatures::default(),
            last_response: Some(banner),
            epsv_failed: false,
            poisoned: false,
        };

        channel.login().await?;
        channel.negotiate().await?;
        channel.state = ChannelState::Ready;
        log::info!(
            "[{}] FTP channel ready on {} (tls: {})",
            channel.id,
            channel.config.address(),
            channel.codec.is_tls()
        );
        Ok(channel)
    }

    // ─── Login ───────────────────────────────────────────────────

    async fn login(&mut self) -> FtpResult<()> {
        let user_cmd = format!("USER {}", self.config.user);
        let resp = self.raw(&user_cmd).await?;
        match resp.code {
            230 => {}
            331 => {
                let pass_cmd = format!("PASS {}", self.config.password);
                let resp = self.raw(&pass_cmd).await?;
                match resp.code {
                    230 | 202 => {}
                    332 => {
                        return Err(FtpError::auth_failed("Server requires an account (ACCT)")
                            .with_code(332))
                    }
                    code if code >= 500 => {
                        return Err(FtpError::auth_failed(format!(
                            "Login failed: {}",
                            resp.message()
                        ))
                        .with_code(code))
                    }
                    code => return Err(FtpError::from_reply("PASS", code, resp.message())),
                }
            }
            code if code >= 500 => {
                return Err(
                    FtpError::auth_failed(format!("USER rejected: {}", resp.message()))
                        .with_code(code),
                )
            }
            code => return Err(FtpError::from_reply("USER", code, resp.message())),
        }

        self.state = ChannelState::Authenticated;
        log::debug!("[{}] logged in as {}", self.id, self.config.user);
        Ok(())
    }

    // ─── Post-login negotiation ──────────────────────────────────

    async fn negotiate(&mut self) -> FtpResult<()> {
        if self.tls.is_some() {
            self.expect_raw("PBSZ 0", |c| c == 200).await?;
            self.expect_raw("PROT P", |c| c == 200).await?;
        }

        let feat = self.raw("FEAT").await?;
        if feat.code == 211 {
            self.features = ServerFeatures::from_feat_lines(feat.lines.iter().map(String::as_str));
        }
        log::debug!("[{}] server features: {:?}", self.id, self.features.raw_features);

        if self.features.utf8 {
            // Many servers reply 202 (already on); a refusal is harmless.
            let _ = self.raw("OPTS UTF8 ON").await?;
        }

        self.expect_raw("TYPE I", |c| c == 200).await?;
        Ok(())
    }

    // ─── Command helpers ─────────────────────────────────────────

    /// Send a command and return the reply. Requires the channel to be Ready.
    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        self.ensure_ready()?;
        self.raw(cmd).await
    }

    /// Send a command and fail with `ProtocolError` unless `ok(code)` holds.
    pub async fn expect(
        &mut self,
        cmd: &str,
        ok: impl Fn(u16) -> bool,
    ) -> FtpResult<FtpResponse> {
        self.ensure_ready()?;
        self.expect_raw(cmd, ok).await
    }

    /// Send without the Ready check (login, and commands during a transfer).
    pub(crate) async fn raw(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        if self.poisoned || self.state == ChannelState::Closed {
            return Err(FtpError::not_ready(format!(
                "Channel {} is closed; cannot send {}",
                self.id,
                mask_secret(cmd)
            )));
        }
        let result = self.codec.execute(cmd).await;
        self.observe(result)
    }

    pub(crate) async fn expect_raw(
        &mut self,
        cmd: &str,
        ok: impl Fn(u16) -> bool,
    ) -> FtpResult<FtpResponse> {
        let resp = self.raw(cmd).await?;
        if ok(resp.code) {
            Ok(resp)
        } else {
            Err(FtpError::from_reply(cmd, resp.code, resp.message()))
        }
    }

    /// Read one more reply (e.g. the 226 after a data transfer).
    pub(crate) async fn read_reply(&mut self) -> FtpResult<FtpResponse> {
        if self.poisoned {
            return Err(FtpError::not_ready(format!("Channel {} is closed", self.id)));
        }
        let result = self.codec.read_response().await;
        self.observe(result)
    }

    fn observe(&mut self, result: FtpResult<FtpResponse>) -> FtpResult<FtpResponse> {
        match result {
            Ok(resp) => {
                if resp.code == 421 {
                    // Service closing the control connection.
                    self.poison();
                }
                self.last_response = Some(resp.clone());
                Ok(resp)
            }
            Err(e) => {
                if e.retires_channel() {
                    self.poison();
                }
                Err(e)
            }
        }
    }

    fn ensure_ready(&self) -> FtpResult<()> {
        match self.state {
            ChannelState::Ready if !self.poisoned => Ok(()),
            state => Err(FtpError::not_ready(format!(
                "Channel {} is {:?}, not Ready",
                self.id,
                if self.poisoned { ChannelState::Closed } else { state }
            ))),
        }
    }

    // ─── Transfer bracketing ─────────────────────────────────────

    /// Mark the channel Busy for the duration of a data transfer.
    pub(crate) fn begin_transfer(&mut self) -> FtpResult<()> {
        self.ensure_ready()?;
        self.state = ChannelState::Busy;
        Ok(())
    }

    pub(crate) fn end_transfer(&mut self) {
        if self.state == ChannelState::Busy {
            self.state = if self.poisoned {
                ChannelState::Closed
            } else {
                ChannelState::Ready
            };
        }
    }

    // ─── Teardown ────────────────────────────────────────────────

    /// Mark the channel unusable after a fatal error.
    pub fn poison(&mut self) {
        if !self.poisoned {
            log::debug!("[{}] channel poisoned", self.id);
        }
        self.poisoned = true;
        self.state = ChannelState::Closed;
    }

    /// Gracefully close the session with QUIT.
    pub async fn quit(mut self) {
        if !self.poisoned && self.state != ChannelState::Closed {
            if let Err(e) = self.codec.execute("QUIT").await {
                log::debug!("[{}] QUIT failed: {}", self.id, e);
            }
        }
        self.state = ChannelState::Closed;
        if let Ok(mut stream) = self.codec.into_stream() {
            let _ = tokio::time::timeout(self.config.timeout, stream.shutdown()).await;
        }
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ChannelState::Ready && !self.poisoned
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn features(&self) -> &ServerFeatures {
        &self.features
    }

    pub fn last_response(&self) -> Option<&FtpResponse> {
        self.last_response.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn tls_config(&self) -> Option<&Arc<ClientConfig>> {
        self.tls.as_ref()
    }

    pub(crate) fn epsv_failed(&self) -> bool {
        self.epsv_failed
    }

    pub(crate) fn mark_epsv_failed(&mut self) {
        self.epsv_failed = true;
    }

    pub fn local_addr(&self) -> FtpResult<SocketAddr> {
        self.codec.local_addr()
    }

    pub fn peer_addr(&self) -> FtpResult<SocketAddr> {
        self.codec.peer_addr()
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("id", &self.id)
            .field("host", &self.config.address())
            .field("state", &self.state)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

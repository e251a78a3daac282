//! FTP-specific error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised FTP error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
    pub host: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// TCP / TLS could not be established, or the control connection dropped.
    ConnectionFailed,
    /// USER/PASS rejected.
    AuthFailed,
    /// Command issued while the channel (or client) is not ready.
    NotReady,
    /// Unexpected reply code or malformed reply.
    ProtocolError,
    /// I/O failure on the local stream or the data connection.
    TransferFailed,
    /// A bounded wait expired.
    Timeout,
    /// No control channel became available in time.
    PoolExhausted,
    /// Directory listing yielded no parseable entry.
    ParseError,
    /// Directory creation collided with an existing entry.
    AlreadyExists,
    /// Construction input rejected (URL, time zone, TLS material).
    InvalidConfig,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            host: None,
            path: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        if self.host.is_none() {
            self.host = Some(host.into());
        }
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.into());
        }
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthFailed, msg)
    }

    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::NotReady, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProtocolError, msg)
    }

    pub fn transfer_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TransferFailed, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    pub fn pool_exhausted(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::PoolExhausted, msg)
    }

    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ParseError, msg)
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AlreadyExists, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    /// An unexpected reply to `command`.
    pub fn from_reply(command: &str, code: u16, text: &str) -> Self {
        let verb = command.split_whitespace().next().unwrap_or(command);
        Self::protocol_error(format!("{} failed: {}", verb, text.trim())).with_code(code)
    }

    // ── Classification ───────────────────────────────────────────

    /// Whether the control channel that produced this error must be retired.
    pub fn retires_channel(&self) -> bool {
        matches!(
            self.kind,
            FtpErrorKind::ProtocolError | FtpErrorKind::Timeout | FtpErrorKind::ConnectionFailed
        )
    }

    /// Failures worth repeating on a different control channel.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            FtpErrorKind::ConnectionFailed => true,
            FtpErrorKind::ProtocolError => matches!(self.code, Some(421 | 425 | 426)),
            _ => false,
        }
    }

    /// Server reported the entry as missing or unavailable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self.code, Some(450 | 550))
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)?,
            None => write!(f, "[FTP {:?}] {}", self.kind, self.message)?,
        }
        if let Some(ref path) = self.path {
            write!(f, " (path: {})", path)?;
        }
        if let Some(ref host) = self.host {
            write!(f, " (host: {})", host)?;
        }
        Ok(())
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O timeout: {}", e))
        } else {
            Self::transfer_failed(e.to_string())
        }
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.to_string()
    }
}

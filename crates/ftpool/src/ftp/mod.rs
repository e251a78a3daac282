//! # ftp — pooled FTP/FTPS client
//!
//! Implements the client side of RFC 959 with the extensions a modern
//! server speaks:
//! - **RFC 2228 / 4217** — AUTH TLS / FTPS (Explicit & Implicit)
//! - **RFC 3659** — MLSD/MLST, SIZE, MDTM, REST STREAM
//! - **RFC 2389** — FEAT negotiation
//! - **RFC 2428** — EPSV / EPRT (IPv6-ready)
//!
//! Architecture:
//! - `types` — replies, file metadata, channel state, pool stats
//! - `config` — URL + options → immutable `SessionConfig`
//! - `error` — FTP-specific error type
//! - `protocol` — command/response codec over plain or TLS streams
//! - `connection` — address resolution, TCP connect, implicit TLS
//! - `tls` — rustls connector construction and stream upgrades
//! - `channel` — control-channel state machine (login, AUTH TLS, FEAT)
//! - `transfer` — data channel negotiation (EPSV/PASV/EPRT/PORT)
//! - `pool` — bounded pool of control channels
//! - `file_ops` — STOR / RETR exchanges on a single channel
//! - `directory` — LIST/MLSD, MKD, RMD, DELE, RNFR/RNTO, stat, PWD
//! - `parser` — MLSD / Unix / Windows listing parser
//! - `engine` — acquire → exchange → release, with retries
//! - `client` — public facade

pub mod types;
pub mod config;
pub mod error;
pub mod protocol;
pub mod connection;
pub mod tls;
pub mod channel;
pub mod transfer;
pub mod pool;
pub mod file_ops;
pub mod directory;
pub mod parser;
pub mod engine;
pub mod client;

pub use client::FtpClient;
pub use config::{FtpOptions, ServerLocation, SessionConfig, TlsConfig, TlsMode};
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use pool::{ConnectionPool, PooledChannel};
pub use types::*;

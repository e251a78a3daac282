//! # ftpool — Pooled FTP/FTPS client
//!
//! FTP client built around a bounded pool of control connections to one host:
//!   • Explicit (AUTH TLS) and implicit FTPS with rustls
//!   • Passive (EPSV with PASV fallback) and active (PORT / EPRT) data channels
//!   • Connection pool with exclusive checkout and unhealthy-channel retirement
//!   • Upload / download with transient-error retries and REST resume
//!   • MLSD / MLST fact parsing with Unix & Windows LIST fallbacks
//!   • Server time-zone aware timestamp interpretation

pub mod ftp;

pub use ftp::*;

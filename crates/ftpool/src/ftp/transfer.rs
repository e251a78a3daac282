//! Data-channel management for FTP transfers.
//!
//! Supports four modes (RFC 959 + RFC 2428):
//! - **EPSV** — extended passive (IPv6-ready), tried first
//! - **PASV** — server opens a port, client connects; fallback when EPSV
//!   is disabled or rejected
//! - **PORT** — client opens a port, tells server (IPv4)
//! - **EPRT** — extended active (IPv6)
//!
//! Negotiation happens before the transfer command is sent. The data
//! connection is only completed (accepted, TLS-wrapped) after the server's
//! preliminary 1xx reply, see [`establish`].

use crate::ftp::channel::ControlChannel;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::FtpStream;
use crate::ftp::tls;
use lazy_static::lazy_static;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

lazy_static! {
    static ref PASV_RE: Regex =
        Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})").unwrap();
    static ref EPSV_RE: Regex = Regex::new(r"\((.)(.?)(.?)(\d+)(.)\)").unwrap();
}

const CHUNK_SIZE: usize = 64 * 1024;

/// A data connection negotiated but not yet usable.
pub enum PendingData {
    /// Already connected to the server's passive port.
    Passive(TcpStream),
    /// Waiting for the server to connect to us.
    Active(TcpListener),
}

/// Negotiate a data connection on `channel` according to its configuration.
pub async fn negotiate(channel: &mut ControlChannel) -> FtpResult<PendingData> {
    if channel.config().active_transfers {
        open_active(channel).await.map(PendingData::Active)
    } else {
        open_passive(channel).await.map(PendingData::Passive)
    }
}

/// Complete a pending data connection once the transfer command was
/// answered with 1xx, wrapping it in TLS when the session uses FTPS.
pub async fn establish(channel: &ControlChannel, pending: PendingData) -> FtpResult<DataStream> {
    let config = channel.config();
    let tcp = match pending {
        PendingData::Passive(tcp) => tcp,
        PendingData::Active(listener) => {
            let (tcp, from) = timeout(config.timeout, listener.accept())
                .await
                .map_err(|_| {
                    FtpError::transfer_failed(format!(
                        "Server did not open the active data connection within {:?}",
                        config.timeout
                    ))
                })?
                .map_err(|e| FtpError::transfer_failed(format!("Active accept: {}", e)))?;
            log::debug!("[{}] accepted data connection from {}", channel.id(), from);
            tcp
        }
    };
    tcp.set_nodelay(true).ok();

    let stream = match channel.tls_config() {
        Some(tls_cfg) => tls::wrap_data_stream(tcp, tls_cfg, config).await?,
        None => FtpStream::Plain(tcp),
    };
    Ok(DataStream::new(stream, config.timeout))
}

// ─── Passive ─────────────────────────────────────────────────────────

async fn open_passive(channel: &mut ControlChannel) -> FtpResult<TcpStream> {
    let peer = channel.peer_addr()?;
    let use_epsv = !channel.config().disable_epsv && !channel.epsv_failed();

    let addr = if use_epsv {
        let resp = channel.raw("EPSV").await?;
        match resp.code {
            229 => SocketAddr::new(peer.ip(), parse_epsv_response(&resp.text())?),
            500..=599 => {
                log::debug!(
                    "[{}] EPSV rejected ({}), falling back to PASV",
                    channel.id(),
                    resp.code
                );
                channel.mark_epsv_failed();
                pasv(channel, peer).await?
            }
            code => return Err(FtpError::from_reply("EPSV", code, resp.message())),
        }
    } else {
        pasv(channel, peer).await?
    };

    let data_timeout = channel.config().timeout;
    log::debug!("[{}] data connection to {}", channel.id(), addr);
    timeout(data_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| FtpError::timeout(format!("Data connect to {} timed out", addr)))?
        .map_err(|e| FtpError::connection_failed(format!("Data connect to {}: {}", addr, e)))
}

/// Issue `PASV` and resolve the advertised address.
///
/// Response format: `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
async fn pasv(channel: &mut ControlChannel, peer: SocketAddr) -> FtpResult<SocketAddr> {
    let resp = channel.expect_raw("PASV", |c| c == 227).await?;
    let advertised = parse_pasv_response(&resp.text())?;
    if advertised.ip().is_unspecified() {
        Ok(SocketAddr::new(peer.ip(), advertised.port()))
    } else {
        Ok(advertised)
    }
}

/// Parse `h1,h2,h3,h4,p1,p2` from a 227 response.
pub fn parse_pasv_response(text: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_RE
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse PASV: {}", text)))?;

    let mut nums = [0u8; 6];
    for (i, slot) in nums.iter_mut().enumerate() {
        *slot = caps[i + 1]
            .parse::<u8>()
            .map_err(|_| FtpError::protocol_error(format!("PASV number out of range: {}", text)))?;
    }

    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = u16::from(nums[4]) * 256 + u16::from(nums[5]);
    Ok(SocketAddr::new(ip, port))
}

/// Parse the port out of `229 Entering Extended Passive Mode (|||port|)`.
///
/// The delimiter is whatever character opens the parentheses; it must be
/// used consistently.
pub fn parse_epsv_response(text: &str) -> FtpResult<u16> {
    let bad = || FtpError::protocol_error(format!("Cannot parse EPSV: {}", text));
    let caps = EPSV_RE.captures(text).ok_or_else(bad)?;
    let delim = &caps[1];
    if &caps[2] != delim || &caps[3] != delim || &caps[5] != delim {
        return Err(bad());
    }
    match caps[4].parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(bad()),
    }
}

// ─── Active ──────────────────────────────────────────────────────────

/// Bind a listener and announce it with `PORT` (IPv4) or `EPRT` (IPv6).
async fn open_active(channel: &mut ControlChannel) -> FtpResult<TcpListener> {
    let local = channel.local_addr()?;
    let bind = active_bind_addr(&channel.config().active_listen_addr, local.ip())?;

    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| FtpError::transfer_failed(format!("Active listen on {}: {}", bind, e)))?;
    let listening = listener
        .local_addr()
        .map_err(|e| FtpError::transfer_failed(format!("Active listener address: {}", e)))?;

    // A wildcard bind is announced with the control connection's local IP.
    let announce_ip = if listening.ip().is_unspecified() {
        local.ip()
    } else {
        listening.ip()
    };

    let cmd = match announce_ip {
        IpAddr::V4(v4) => port_command(v4, listening.port()),
        IpAddr::V6(v6) => format!("EPRT |2|{}|{}|", v6, listening.port()),
    };
    log::debug!("[{}] active data listener on {}", channel.id(), listening);
    channel.expect_raw(&cmd, |c| c == 200).await?;
    Ok(listener)
}

/// `PORT h1,h2,h3,h4,p1,p2`
fn port_command(ip: Ipv4Addr, port: u16) -> String {
    let o = ip.octets();
    format!(
        "PORT {},{},{},{},{},{}",
        o[0],
        o[1],
        o[2],
        o[3],
        port / 256,
        port % 256
    )
}

/// Resolve the configured `host:port` listen address. An empty host means
/// the control connection's local IP; an empty port means an ephemeral one.
fn active_bind_addr(listen: &str, control_local: IpAddr) -> FtpResult<SocketAddr> {
    let invalid = || FtpError::invalid_config(format!("Invalid active listen address '{}'", listen));
    let (host, port) = match listen.rfind(':') {
        Some(pos) => (&listen[..pos], &listen[pos + 1..]),
        None => (listen, ""),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let ip = if host.is_empty() {
        control_local
    } else {
        host.parse::<IpAddr>().map_err(|_| invalid())?
    };
    let port = if port.is_empty() {
        0
    } else {
        port.parse::<u16>().map_err(|_| invalid())?
    };
    Ok(SocketAddr::new(ip, port))
}

// ─── Data stream ─────────────────────────────────────────────────────

/// An established data connection for one transfer attempt.
///
/// Every read and write is bounded by the session timeout.
pub struct DataStream {
    stream: FtpStream,
    timeout: Duration,
}

impl DataStream {
    pub fn new(stream: FtpStream, timeout: Duration) -> Self {
        Self { stream, timeout }
    }

    /// Copy everything the server sends into `sink` until it closes the
    /// connection. Returns the number of bytes written to `sink`.
    pub async fn copy_to<W>(&mut self, sink: &mut W, written: &mut u64) -> FtpResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let start = *written;
        loop {
            let n = timeout(self.timeout, self.stream.read(&mut buf))
                .await
                .map_err(|_| self.stalled("read"))?
                .map_err(|e| FtpError::transfer_failed(format!("Data connection read: {}", e)))?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])
                .await
                .map_err(|e| FtpError::transfer_failed(format!("Local write: {}", e)))?;
            *written += n as u64;
        }
        sink.flush()
            .await
            .map_err(|e| FtpError::transfer_failed(format!("Local flush: {}", e)))?;
        Ok(*written - start)
    }

    /// Copy `source` into the data connection until EOF. `consumed` is
    /// advanced as bytes are taken from `source`.
    pub async fn copy_from<R>(&mut self, source: &mut R, consumed: &mut u64) -> FtpResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = source
                .read(&mut buf)
                .await
                .map_err(|e| FtpError::transfer_failed(format!("Local read: {}", e)))?;
            if n == 0 {
                break;
            }
            *consumed += n as u64;
            timeout(self.timeout, self.stream.write_all(&buf[..n]))
                .await
                .map_err(|_| self.stalled("write"))?
                .map_err(|e| FtpError::transfer_failed(format!("Data connection write: {}", e)))?;
            sent += n as u64;
        }
        Ok(sent)
    }

    /// Read the whole remaining payload (listings).
    pub async fn read_all(&mut self) -> FtpResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut written = 0;
        self.copy_to(&mut out, &mut written).await?;
        Ok(out)
    }

    /// Flush and shut the connection down so the server sees EOF.
    pub async fn finish(mut self) -> FtpResult<()> {
        timeout(self.timeout, self.stream.shutdown())
            .await
            .map_err(|_| self.stalled("shutdown"))?
            .map_err(|e| FtpError::transfer_failed(format!("Data connection shutdown: {}", e)))
    }

    fn stalled(&self, what: &str) -> FtpError {
        FtpError::timeout(format!(
            "Data connection {} stalled for {:?}",
            what, self.timeout
        ))
    }
}

//! Low-level FTP command/response codec (RFC 959 §4).
//!
//! Handles:
//! - Sending FTP commands terminated with `\r\n`
//! - Reading single-line and multi-line replies to completion
//! - Parsing the 3-digit reply code
//! - A stream type that is either plain TCP or rustls-wrapped TCP, shared
//!   by control and data connections

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::FtpResponse;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;

/// Plain or TLS-wrapped TCP stream.
pub enum FtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl FtpStream {
    /// The underlying socket.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(s) => s,
            Self::Tls(s) => s.get_ref().0,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for FtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

/// The FTP command/response codec for one control connection.
///
/// Every send and every reply read is bounded by `timeout`.
pub struct FtpCodec {
    stream: BufReader<FtpStream>,
    timeout: Duration,
}

impl FtpCodec {
    pub fn new(stream: FtpStream, timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            timeout,
        }
    }

    pub fn stream(&self) -> &FtpStream {
        self.stream.get_ref()
    }

    pub fn is_tls(&self) -> bool {
        self.stream.get_ref().is_tls()
    }

    pub fn local_addr(&self) -> FtpResult<SocketAddr> {
        self.stream
            .get_ref()
            .tcp()
            .local_addr()
            .map_err(|e| FtpError::connection_failed(format!("local_addr: {}", e)))
    }

    pub fn peer_addr(&self) -> FtpResult<SocketAddr> {
        self.stream
            .get_ref()
            .tcp()
            .peer_addr()
            .map_err(|e| FtpError::connection_failed(format!("peer_addr: {}", e)))
    }

    /// Give back the stream for a TLS upgrade.
    ///
    /// Fails if the server already sent bytes past the last reply, since
    /// those would be lost (or injected) across the upgrade.
    pub fn into_stream(self) -> FtpResult<FtpStream> {
        if !self.stream.buffer().is_empty() {
            return Err(FtpError::protocol_error(
                "Unexpected data buffered on control channel before TLS upgrade",
            ));
        }
        Ok(self.stream.into_inner())
    }

    /// Send a raw FTP command (without trailing CRLF — we add it).
    pub async fn send_command(&mut self, cmd: &str) -> FtpResult<()> {
        let line = format!("{}\r\n", cmd);
        let write = async {
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.flush().await
        };
        match timeout(self.timeout, write).await {
            Err(_) => {
                return Err(FtpError::timeout(format!(
                    "Sending {} timed out after {:?}",
                    verb(cmd),
                    self.timeout
                )))
            }
            Ok(Err(e)) => {
                return Err(FtpError::connection_failed(format!(
                    "Sending {}: {}",
                    verb(cmd),
                    e
                )))
            }
            Ok(Ok(())) => {}
        }
        log::trace!(">>> {}", mask_secret(cmd));
        Ok(())
    }

    /// Read one complete reply, bounded by the codec timeout.
    pub async fn read_response(&mut self) -> FtpResult<FtpResponse> {
        let resp = timeout(self.timeout, read_reply(&mut self.stream))
            .await
            .map_err(|_| {
                FtpError::timeout(format!("No reply from server within {:?}", self.timeout))
            })??;
        log::trace!("<<< {}", resp.lines.last().map(String::as_str).unwrap_or(""));
        Ok(resp)
    }

    /// Send a command and return the reply.
    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        self.send_command(cmd).await?;
        self.read_response().await
    }
}

/// Read a complete FTP reply (possibly multi-line) from `reader`.
///
/// Multi-line replies look like:
/// ```text
/// 220-Welcome to my FTP server
/// 220-This is line 2
///  continuation lines may start with anything
/// 220 End of greeting
/// ```
/// Every line up to and including the terminator is consumed.
pub async fn read_reply<R>(reader: &mut R) -> FtpResult<FtpResponse>
where
    R: AsyncBufRead + Unpin,
{
    let first = read_line(reader).await?;
    let code = parse_code(&first)?;
    let multi = match first.as_bytes().get(3) {
        None | Some(b' ') => false,
        Some(b'-') => true,
        Some(_) => {
            return Err(FtpError::protocol_error(format!(
                "Malformed reply line: '{}'",
                first
            )))
        }
    };

    let mut lines = vec![first];
    if multi {
        loop {
            let next = read_line(reader).await?;
            let done = is_terminator(&next, code);
            lines.push(next);
            if done {
                break;
            }
        }
    }

    Ok(FtpResponse { code, lines })
}

async fn read_line<R>(reader: &mut R) -> FtpResult<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader
        .read_until(b'\n', &mut buf)
        .await
        .map_err(|e| FtpError::connection_failed(format!("Reading reply: {}", e)))?;
    if n == 0 {
        return Err(FtpError::connection_failed("Server closed the control connection"));
    }
    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Parse the 3-digit reply code from the start of a line.
fn parse_code(line: &str) -> FtpResult<u16> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 {
        return Err(FtpError::protocol_error(format!(
            "Reply too short to contain a code: '{}'",
            line
        )));
    }
    let digits = &bytes[..3];
    if !digits.iter().all(u8::is_ascii_digit) || !(b'1'..=b'5').contains(&digits[0]) {
        return Err(FtpError::protocol_error(format!(
            "Invalid reply code in: '{}'",
            line
        )));
    }
    Ok(digits
        .iter()
        .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0')))
}

fn is_terminator(line: &str, code: u16) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 3
        && parse_code(line).map(|c| c == code).unwrap_or(false)
        && matches!(bytes.get(3), None | Some(b' '))
}

fn verb(cmd: &str) -> &str {
    cmd.split_whitespace().next().unwrap_or(cmd)
}

/// Hide the argument of `PASS` in logs.
pub(crate) fn mask_secret(cmd: &str) -> String {
    if cmd.len() >= 4 && cmd[..4].eq_ignore_ascii_case("PASS") {
        "PASS ****".to_string()
    } else {
        cmd.to_string()
    }
}

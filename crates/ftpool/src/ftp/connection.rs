//! TCP + TLS transport — establishes the FTP control connection.
//!
//! Handles name resolution with the IPv4/IPv6 preference, plain-TCP
//! connect to the first reachable address, implicit-FTPS wrapping, and
//! consumption of the server greeting.

use crate::ftp::config::{SessionConfig, TlsMode};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::{FtpCodec, FtpStream};
use crate::ftp::tls::connect_tls;
use crate::ftp::types::FtpResponse;
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

/// Resolve the configured host into an ordered list of candidates.
///
/// With `ipv6_lookup` off, IPv4 addresses come first and IPv6 ones are
/// only kept as a last resort; with it on, IPv6 addresses come first.
pub async fn resolve(config: &SessionConfig) -> FtpResult<Vec<SocketAddr>> {
    let addr = config.address();
    let found = timeout(config.timeout, lookup_host((config.host.as_str(), config.port)))
        .await
        .map_err(|_| FtpError::timeout(format!("Resolving {} timed out", addr)))?
        .map_err(|e| FtpError::connection_failed(format!("Resolving {}: {}", addr, e)))?;

    let ordered = order_addresses(found, config.ipv6_lookup);
    if ordered.is_empty() {
        return Err(FtpError::connection_failed(format!(
            "No addresses found for {}",
            addr
        )));
    }
    Ok(ordered)
}

/// Put the preferred address family first, keeping resolver order within
/// each family.
fn order_addresses(
    found: impl IntoIterator<Item = SocketAddr>,
    ipv6_lookup: bool,
) -> Vec<SocketAddr> {
    let (v6, v4): (Vec<SocketAddr>, Vec<SocketAddr>) =
        found.into_iter().partition(SocketAddr::is_ipv6);
    if ipv6_lookup {
        v6.into_iter().chain(v4).collect()
    } else {
        v4.into_iter().chain(v6).collect()
    }
}

/// Connect to the first reachable resolved address.
async fn connect_tcp(config: &SessionConfig) -> FtpResult<TcpStream> {
    let candidates = resolve(config).await?;
    let mut last_err = None;

    for addr in candidates {
        match timeout(config.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(tcp)) => {
                tcp.set_nodelay(true).ok();
                log::debug!("TCP connected to {} ({})", config.address(), addr);
                return Ok(tcp);
            }
            Ok(Err(e)) => {
                log::debug!("TCP connect to {} failed: {}", addr, e);
                last_err = Some(FtpError::connection_failed(format!(
                    "TCP connect to {}: {}",
                    addr, e
                )));
            }
            Err(_) => {
                log::debug!("TCP connect to {} timed out", addr);
                last_err = Some(FtpError::timeout(format!(
                    "TCP connect to {} timed out after {:?}",
                    addr, config.timeout
                )));
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| FtpError::connection_failed("No address could be reached"))
        .with_host(config.address()))
}

/// Establish the control connection and return a ready-to-use codec
/// **plus** the server welcome banner.
///
/// For Explicit FTPS the caller must later issue AUTH TLS themselves
/// (handled in `channel.rs`).
pub async fn connect(
    config: &SessionConfig,
    tls: Option<&Arc<ClientConfig>>,
) -> FtpResult<(FtpCodec, FtpResponse)> {
    let tcp = connect_tcp(config).await?;

    let stream = match (tls, config.tls_mode) {
        (Some(tls_config), TlsMode::Implicit) => {
            let wrapped = connect_tls(tls_config, config, tcp).await?;
            FtpStream::Tls(Box::new(wrapped))
        }
        // Plain TCP (no TLS, or Explicit — upgrades later).
        _ => FtpStream::Plain(tcp),
    };

    let mut codec = FtpCodec::new(stream, config.timeout);
    let banner = codec.read_response().await?;
    if banner.code != 220 {
        return Err(FtpError::from_reply("connect", banner.code, banner.message())
            .with_host(config.address()));
    }
    Ok((codec, banner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::config::FtpOptions;
    use crate::ftp::error::FtpErrorKind;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn config_for(addr: SocketAddr) -> SessionConfig {
        SessionConfig::from_url(&format!("ftp://u:p@{}", addr), FtpOptions::default()).unwrap()
    }

    fn mixed_addresses() -> Vec<SocketAddr> {
        vec![
            "[::1]:21".parse().unwrap(),
            "10.0.0.2:21".parse().unwrap(),
            "[fe80::2]:21".parse().unwrap(),
            "10.0.0.1:21".parse().unwrap(),
        ]
    }

    #[test]
    fn ipv4_first_by_default() {
        let ordered = order_addresses(mixed_addresses(), false);
        let expected: Vec<SocketAddr> = vec![
            "10.0.0.2:21".parse().unwrap(),
            "10.0.0.1:21".parse().unwrap(),
            "[::1]:21".parse().unwrap(),
            "[fe80::2]:21".parse().unwrap(),
        ];
        assert_eq!(ordered, expected);
    }

    #[test]
    fn ipv6_first_when_requested() {
        let ordered = order_addresses(mixed_addresses(), true);
        assert!(ordered[0].is_ipv6());
        assert!(ordered[1].is_ipv6());
        assert_eq!(ordered[2], "10.0.0.2:21".parse::<SocketAddr>().unwrap());
        assert_eq!(ordered.len(), 4);
    }

    #[test]
    fn single_family_keeps_everything() {
        let only_v6: Vec<SocketAddr> = vec!["[::1]:21".parse().unwrap()];
        assert_eq!(order_addresses(only_v6.clone(), false), only_v6);
        assert!(order_addresses(Vec::new(), false).is_empty());
    }

    #[tokio::test]
    async fn resolve_literal_address() {
        let cfg = SessionConfig::from_url("ftp://127.0.0.1:2121", FtpOptions::default()).unwrap();
        let addrs = resolve(&cfg).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:2121".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn greeting_is_consumed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"220-Hello\r\n220 ready\r\n").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let (_codec, banner) = connect(&config_for(addr), None).await.unwrap();
        assert_eq!(banner.code, 220);
        assert_eq!(banner.lines.len(), 2);
    }

    #[tokio::test]
    async fn busy_greeting_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"421 Too many users\r\n").await.unwrap();
        });

        let err = connect(&config_for(addr), None).await.err().unwrap();
        assert_eq!(err.kind, FtpErrorKind::ProtocolError);
        assert_eq!(err.code, Some(421));
    }

    #[tokio::test]
    async fn refused_connection_is_connection_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect(&config_for(addr), None).await.err().unwrap();
        assert_eq!(err.kind, FtpErrorKind::ConnectionFailed);
        assert!(err.host.is_some());
    }
}

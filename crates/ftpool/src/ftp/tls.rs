//! TLS helpers for Explicit and Implicit FTPS (RFC 4217).
//!
//! - Builds one shared rustls `ClientConfig` per client from `TlsConfig`
//!   (native roots, extra PEM bundle, optionally skipping chain checks).
//! - Provides `upgrade_to_tls` for wrapping an existing plain codec.
//! - Wraps data connections with the same config so the server can
//!   resume the control channel's TLS session.

use crate::ftp::config::{SessionConfig, TlsConfig};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::{FtpCodec, FtpStream};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Build the rustls client configuration described by `tls`.
pub fn build_client_config(tls: &TlsConfig) -> FtpResult<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();

    if tls.use_native_roots {
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            log::debug!("Skipping native root: {}", err);
        }
        let (added, ignored) = root_store.add_parsable_certificates(native.certs);
        log::debug!("Loaded {} native roots ({} ignored)", added, ignored);
    }

    if let Some(ref ca_path) = tls.ca_cert_path {
        let file = std::fs::File::open(ca_path).map_err(|e| {
            FtpError::invalid_config(format!(
                "Failed to read CA bundle {}: {}",
                ca_path.display(),
                e
            ))
        })?;
        let mut reader = BufReader::new(file);
        let mut count = 0usize;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| {
                FtpError::invalid_config(format!("Invalid PEM in {}: {}", ca_path.display(), e))
            })?;
            root_store
                .add(cert)
                .map_err(|e| FtpError::invalid_config(format!("Failed to add CA cert: {}", e)))?;
            count += 1;
        }
        if count == 0 {
            return Err(FtpError::invalid_config(format!(
                "No certificates found in {}",
                ca_path.display()
            )));
        }
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if tls.accept_invalid_certs {
        log::warn!("FTPS certificate verification disabled – insecure!");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(SkipChainVerification::new()));
    }

    Ok(Arc::new(config))
}

fn server_name(config: &SessionConfig) -> FtpResult<ServerName<'static>> {
    ServerName::try_from(config.tls_server_name().to_string()).map_err(|e| {
        FtpError::invalid_config(format!(
            "Invalid TLS server name '{}': {}",
            config.tls_server_name(),
            e
        ))
    })
}

/// Run a client handshake over `tcp`, bounded by the session timeout.
pub async fn connect_tls(
    tls: &Arc<ClientConfig>,
    config: &SessionConfig,
    tcp: TcpStream,
) -> FtpResult<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::clone(tls));
    let name = server_name(config)?;

    timeout(config.timeout, connector.connect(name, tcp))
        .await
        .map_err(|_| FtpError::timeout("TLS handshake timed out"))?
        .map_err(|e| {
            FtpError::connection_failed(format!("TLS handshake failed: {}", e))
                .with_host(config.address())
        })
}

/// Upgrade an existing **plain** control connection to TLS.
///
/// Called after a successful `AUTH TLS` + 234 reply.
/// Consumes the plain codec, performs the handshake, returns a new codec.
pub async fn upgrade_to_tls(
    codec: FtpCodec,
    tls: &Arc<ClientConfig>,
    config: &SessionConfig,
) -> FtpResult<FtpCodec> {
    let tcp = match codec.into_stream()? {
        FtpStream::Plain(tcp) => tcp,
        FtpStream::Tls(_) => {
            return Err(FtpError::protocol_error(
                "Cannot upgrade: connection is already TLS",
            ))
        }
    };

    let wrapped = connect_tls(tls, config, tcp).await?;
    log::debug!("Control channel to {} upgraded to TLS", config.address());
    Ok(FtpCodec::new(FtpStream::Tls(Box::new(wrapped)), config.timeout))
}

/// Wrap a freshly opened data connection for FTPS (`PROT P`).
pub async fn wrap_data_stream(
    tcp: TcpStream,
    tls: &Arc<ClientConfig>,
    config: &SessionConfig,
) -> FtpResult<FtpStream> {
    let wrapped = connect_tls(tls, config, tcp)
        .await
        .map_err(|e| FtpError::new(e.kind, format!("Data channel {}", e.message)))?;
    Ok(FtpStream::Tls(Box::new(wrapped)))
}

// ─── Unverified server certificates ─────────────────────────────────

/// Accepts whatever certificate chain the server presents, for servers
/// with self-signed or mismatched certificates.
///
/// Only the chain and name checks are skipped: handshake signatures are
/// still verified with the crypto provider's algorithms, so the peer must
/// hold the private key of the certificate it sent.
#[derive(Debug)]
struct SkipChainVerification {
    provider: Arc<CryptoProvider>,
}

impl SkipChainVerification {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl ServerCertVerifier for SkipChainVerification {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        log::debug!(
            "Accepting unverified certificate for {:?} ({} bytes)",
            server_name,
            end_entity.len()
        );
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

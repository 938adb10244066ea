//! TLS helpers for Explicit and Implicit FTPS (RFC 4217).
//!
//! - Builds a `tokio_rustls::TlsConnector` against the native root store,
//!   with optional self-signed cert acceptance.
//! - Provides `upgrade_to_tls` for wrapping an existing plain codec.
//! - Wraps data connections with the same connector so servers that
//!   demand TLS session reuse accept them.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::{FtpCodec, ReadHalf, WriteHalf};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Client-side TLS stream over TCP, used for control and data channels.
pub type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Connector plus server name for one FTP host.
#[derive(Clone)]
pub struct FtpTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl FtpTls {
    /// Build a connector according to our configuration.
    pub fn new(host: &str, accept_invalid_certs: bool) -> FtpResult<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?;

        let tls_config = if accept_invalid_certs {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
                .with_no_client_auth()
        } else {
            let mut root_store = rustls::RootCertStore::empty();
            let native = rustls_native_certs::load_native_certs();
            for err in &native.errors {
                log::warn!("Skipping native certificate: {}", err);
            }
            let (added, ignored) = root_store.add_parsable_certificates(native.certs);
            log::debug!("Loaded {} native root certificates ({} ignored)", added, ignored);
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| FtpError::tls_failed(format!("Invalid TLS server name '{}': {}", host, e)))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(tls_config)),
            server_name,
        })
    }

    /// Perform the client handshake over `tcp`.
    pub async fn wrap(&self, tcp: TcpStream, channel: &str) -> FtpResult<TlsStream> {
        self.connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| FtpError::tls_failed(format!("{} TLS handshake: {}", channel, e)))
    }
}

/// Upgrade an existing **plain** control connection to TLS.
///
/// Called after successful `AUTH TLS` + 234 reply.
/// Consumes the plain codec, performs the TLS handshake, returns a new codec.
pub async fn upgrade_to_tls(codec: FtpCodec, tls: &FtpTls) -> FtpResult<FtpCodec> {
    let tcp = reunite_plain(codec)?;
    let stream = tls.wrap(tcp, "Explicit").await?;
    Ok(FtpCodec::from_tls(stream))
}

/// Reunite the read + write halves back into a `TcpStream`.
/// Only works when both halves are `Plain`.
fn reunite_plain(codec: FtpCodec) -> FtpResult<TcpStream> {
    let rd = match codec.reader {
        ReadHalf::Plain(br) => {
            if !br.buffer().is_empty() {
                return Err(FtpError::protocol_error(
                    "Server sent data after AUTH TLS before the handshake",
                ));
            }
            br.into_inner()
        }
        ReadHalf::Tls(_) => {
            return Err(FtpError::protocol_error(
                "Cannot upgrade: connection is already TLS",
            ))
        }
    };
    let wr = match codec.writer {
        WriteHalf::Plain(w) => w,
        WriteHalf::Tls(_) => {
            return Err(FtpError::protocol_error(
                "Cannot upgrade: connection is already TLS",
            ))
        }
    };
    rd.reunite(wr)
        .map_err(|e| FtpError::protocol_error(format!("Reunite failed: {}", e)))
}

// ─── NoCertVerifier (for self-signed certs) ─────────────────────────

#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

//! TCP + TLS transport: establishes the FTP control connection.
//!
//! Handles plain-TCP connect, implicit-FTPS wrapping, the banner, and the
//! connect timeout from `FtpConfig`.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::{codes, FtpCodec};
use crate::ftp::tls::FtpTls;
use crate::ftp::types::{FtpConfig, FtpResponse, FtpSecurityMode};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// A freshly dialled control connection that has sent its banner.
pub struct ControlConnection {
    pub codec: FtpCodec,
    pub banner: FtpResponse,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Establish the control connection and return a ready-to-use codec
/// **plus** the server welcome banner.
///
/// For Explicit FTPS the caller must later issue AUTH TLS themselves
/// (handled in `session.rs`).
pub async fn connect(config: &FtpConfig, tls: Option<&FtpTls>) -> FtpResult<ControlConnection> {
    let addr = config.address();
    let dur = config.connect_timeout();

    let tcp = timeout(dur, TcpStream::connect(&addr))
        .await
        .map_err(|_| FtpError::connection_failed(format!("TCP connect to {} timed out", addr)))?
        .map_err(|e| FtpError::connection_failed(format!("TCP connect to {}: {}", addr, e)))?;

    tcp.set_nodelay(true).ok();
    let peer_addr = tcp.peer_addr()?;
    let local_addr = tcp.local_addr()?;

    let mut codec = match (config.security, tls) {
        (FtpSecurityMode::Implicit, Some(tls)) => {
            let stream = timeout(dur, tls.wrap(tcp, "Implicit"))
                .await
                .map_err(|_| FtpError::timeout(format!("TLS handshake with {} timed out", addr)))??;
            FtpCodec::from_tls(stream)
        }
        (FtpSecurityMode::Implicit, None) => {
            return Err(FtpError::invalid_config("Implicit FTPS requires a TLS connector"))
        }
        // Plain TCP (None or Explicit, which upgrades later).
        _ => FtpCodec::from_tcp(tcp),
    };

    let banner = timeout(dur, codec.read_response())
        .await
        .map_err(|_| FtpError::timeout(format!("No banner from {}", addr)))?
        .map_err(|e| FtpError::connection_failed(format!("Reading banner from {}: {}", addr, e)))?;

    if banner.code != codes::SERVICE_READY {
        return Err(FtpError::connection_failed(format!(
            "Server {} is not ready: {}",
            addr,
            banner.text()
        ))
        .with_code(banner.code)
        .with_reply(banner.text()));
    }

    log::info!("Connected to FTP server {}", addr);
    Ok(ControlConnection {
        codec,
        banner,
        peer_addr,
        local_addr,
    })
}

//! Data-channel management for FTP transfers.
//!
//! Supports four modes (RFC 959 + RFC 2428):
//! - **PASV**: server opens a port, client connects
//! - **EPSV**: extended passive (IPv6-ready)
//! - **PORT**: client opens a port, tells server
//! - **EPRT**: extended active (IPv6-ready)
//!
//! Negotiation happens in two steps. [`negotiate`] runs before the
//! transfer verb: in passive modes the TCP connection is fully
//! established there, in active modes a listener is bound and announced.
//! [`PendingData::establish`] runs after the server's preliminary reply
//! and accepts the active connection and performs the TLS handshake for
//! PROT P, since servers only start either once they have the verb.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::codes;
use crate::ftp::session::FtpSession;
use crate::ftp::tls::{FtpTls, TlsStream};
use crate::ftp::types::DataChannelMode;
use lazy_static::lazy_static;
use regex::Regex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

lazy_static! {
    static ref PASV_RE: Regex =
        Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})").unwrap();
    static ref EPSV_RE: Regex = Regex::new(r"\(\|\|\|(\d+)\|\)").unwrap();
}

/// Abstraction over a plain or TLS-wrapped data stream.
pub enum DataStream {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl AsyncRead for DataStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_flush(cx),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Data connection negotiated on the control channel but not yet usable.
pub enum PendingData {
    /// Passive modes: already connected to the server's endpoint.
    Connected(TcpStream),
    /// Active modes: waiting for the server to connect back.
    Listening(TcpListener),
}

impl PendingData {
    /// Finish the data connection once the transfer verb was accepted.
    pub async fn establish(
        self,
        tls: Option<&FtpTls>,
        data_timeout: Duration,
    ) -> FtpResult<DataStream> {
        let tcp = match self {
            PendingData::Connected(tcp) => tcp,
            PendingData::Listening(listener) => {
                let (tcp, peer) = timeout(data_timeout, listener.accept())
                    .await
                    .map_err(|_| FtpError::data_channel("Active data accept timed out"))?
                    .map_err(|e| FtpError::data_channel(format!("Active data accept: {}", e)))?;
                log::trace!("Data connection from {}", peer);
                tcp
            }
        };

        match tls {
            Some(tls) => {
                let stream = timeout(data_timeout, tls.wrap(tcp, "Data channel"))
                    .await
                    .map_err(|_| FtpError::data_channel("Data channel TLS handshake timed out"))??;
                Ok(DataStream::Tls(Box::new(stream)))
            }
            None => Ok(DataStream::Plain(tcp)),
        }
    }
}

/// Negotiate a data connection according to the configured mode.
pub async fn negotiate(session: &mut FtpSession) -> FtpResult<PendingData> {
    let mode = session.config().data_channel_mode;
    let data_timeout = session.config().data_timeout();
    match mode {
        DataChannelMode::Passive => open_pasv(session, data_timeout).await,
        DataChannelMode::ExtendedPassive => open_epsv(session, data_timeout).await,
        DataChannelMode::Active => open_port(session).await,
        DataChannelMode::ExtendedActive => open_eprt(session).await,
    }
}

async fn dial(addr: SocketAddr, data_timeout: Duration, verb: &str) -> FtpResult<PendingData> {
    let tcp = timeout(data_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| FtpError::data_channel(format!("{} data connect to {} timed out", verb, addr)))?
        .map_err(|e| FtpError::data_channel(format!("{} data connect to {}: {}", verb, addr, e)))?;
    tcp.set_nodelay(true).ok();
    Ok(PendingData::Connected(tcp))
}

// ─── PASV ────────────────────────────────────────────────────────────

/// Issue `PASV`, parse the response, connect to the returned address.
///
/// Response format: `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
async fn open_pasv(session: &mut FtpSession, data_timeout: Duration) -> FtpResult<PendingData> {
    let resp = session.send_command_expected(codes::PASSIVE, "PASV").await?;
    let mut addr = parse_pasv_response(&resp.text())?;
    // Servers behind NAT sometimes announce 0.0.0.0; reuse the control peer.
    if addr.ip().is_unspecified() {
        addr.set_ip(session.peer_addr().ip());
    }
    dial(addr, data_timeout, "PASV").await
}

/// Parse `h1,h2,h3,h4,p1,p2` from a 227 response.
pub fn parse_pasv_response(text: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_RE.captures(text).ok_or_else(|| {
        FtpError::protocol_error(format!("Cannot parse PASV: {}", text)).with_reply(text)
    })?;

    let nums: Vec<u8> = (1..=6)
        .map(|i| {
            caps[i].parse::<u8>().map_err(|_| {
                FtpError::protocol_error(format!("PASV number out of range: {}", text))
                    .with_reply(text)
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = (nums[4] as u16) * 256 + (nums[5] as u16);
    Ok(SocketAddr::new(ip, port))
}

// ─── EPSV ────────────────────────────────────────────────────────────

/// Issue `EPSV`, parse port, connect to the *same host* on that port.
///
/// Response format: `229 Entering Extended Passive Mode (|||port|)`
async fn open_epsv(session: &mut FtpSession, data_timeout: Duration) -> FtpResult<PendingData> {
    let resp = session
        .send_command_expected(codes::EXTENDED_PASSIVE, "EPSV")
        .await?;
    let port = parse_epsv_response(&resp.text())?;
    let addr = SocketAddr::new(session.peer_addr().ip(), port);
    dial(addr, data_timeout, "EPSV").await
}

pub fn parse_epsv_response(text: &str) -> FtpResult<u16> {
    let caps = EPSV_RE.captures(text).ok_or_else(|| {
        FtpError::protocol_error(format!("Cannot parse EPSV: {}", text)).with_reply(text)
    })?;
    caps[1].parse::<u16>().map_err(|_| {
        FtpError::protocol_error(format!("EPSV port out of range: {}", text)).with_reply(text)
    })
}

// ─── PORT / EPRT ─────────────────────────────────────────────────────

async fn bind_active(session: &FtpSession, verb: &str) -> FtpResult<(TcpListener, SocketAddr)> {
    // Default to the interface the control connection uses so the
    // announced address is reachable by the server.
    let bind_ip = match session.config().active_bind_address.as_deref() {
        Some(ip) => ip
            .parse::<IpAddr>()
            .map_err(|e| FtpError::invalid_config(format!("activeBindAddress '{}': {}", ip, e)))?,
        None => session.local_addr().ip(),
    };
    let listener = TcpListener::bind(SocketAddr::new(bind_ip, 0))
        .await
        .map_err(|e| FtpError::data_channel(format!("{} bind: {}", verb, e)))?;
    let local = listener
        .local_addr()
        .map_err(|e| FtpError::data_channel(format!("{} local_addr: {}", verb, e)))?;
    Ok((listener, local))
}

/// Bind a local TCP listener and tell the server via `PORT`.
async fn open_port(session: &mut FtpSession) -> FtpResult<PendingData> {
    let (listener, local) = bind_active(session, "PORT").await?;
    let cmd = format_port_command(local)?;
    session
        .send_command_expected(codes::COMMAND_OK, &cmd)
        .await?;
    Ok(PendingData::Listening(listener))
}

/// `PORT h1,h2,h3,h4,p1,p2` for an IPv4 socket address.
pub fn format_port_command(local: SocketAddr) -> FtpResult<String> {
    let ip = match local.ip() {
        IpAddr::V4(v4) => v4,
        _ => return Err(FtpError::data_channel("PORT requires IPv4")),
    };
    let octets = ip.octets();
    let port = local.port();
    Ok(format!(
        "PORT {},{},{},{},{},{}",
        octets[0],
        octets[1],
        octets[2],
        octets[3],
        port / 256,
        port % 256
    ))
}

/// Bind a local listener and tell the server via `EPRT`.
///
/// Command format: `EPRT |1|ip|port|` (1 = IPv4, 2 = IPv6)
async fn open_eprt(session: &mut FtpSession) -> FtpResult<PendingData> {
    let (listener, local) = bind_active(session, "EPRT").await?;
    let af = match local.ip() {
        IpAddr::V4(_) => 1,
        IpAddr::V6(_) => 2,
    };
    let cmd = format!("EPRT |{}|{}|{}|", af, local.ip(), local.port());
    session
        .send_command_expected(codes::COMMAND_OK, &cmd)
        .await?;
    Ok(PendingData::Listening(listener))
}

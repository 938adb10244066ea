//! FTP-specific error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised FTP error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP response code that triggered the error, if any.
    pub code: Option<u16>,
    /// Full text of the offending reply, all lines.
    pub raw_reply: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// TCP / DNS resolution failure.
    ConnectionFailed,
    /// AUTH TLS / TLS handshake failure.
    TlsFailed,
    /// Wrong username/password.
    AuthFailed,
    /// No pooled connection became available in time.
    PoolExhausted,
    /// The client was closed.
    PoolClosed,
    /// Server replied with a code other than the one expected.
    CommandRejected,
    /// Server sent an un-parseable response.
    ProtocolError,
    /// Permission denied on the server.
    PermissionDenied,
    /// File/directory not found on the server.
    NotFound,
    /// Listing entry violates the fact grammar or has a bad value.
    MalformedEntry,
    /// Listing entry is well-formed but misses a required fact.
    IncompleteEntry,
    /// An I/O error on the control or data stream.
    IoError,
    /// Session is disconnected / dropped.
    Disconnected,
    /// Operation timed out.
    Timeout,
    /// Data channel could not be established (PASV/PORT failed).
    DataChannelFailed,
    /// Transfer aborted or incomplete.
    TransferFailed,
    /// Config / parameter validation error.
    InvalidConfig,
    /// Feature not available with this server or configuration.
    Unsupported,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            raw_reply: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_reply(mut self, raw: impl Into<String>) -> Self {
        self.raw_reply = Some(raw.into());
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionFailed, msg)
    }

    pub fn tls_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TlsFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthFailed, msg)
    }

    pub fn pool_exhausted(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::PoolExhausted, msg)
    }

    pub fn pool_closed() -> Self {
        Self::new(FtpErrorKind::PoolClosed, "FTP client has been closed")
    }

    pub fn command_rejected(code: u16, msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::CommandRejected, msg).with_code(code)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProtocolError, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::NotFound, msg)
    }

    pub fn malformed_entry(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::MalformedEntry, msg)
    }

    pub fn incomplete_entry(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::IncompleteEntry, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::IoError, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disconnected, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannelFailed, msg)
    }

    pub fn transfer_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TransferFailed, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Unsupported, msg)
    }

    /// Classify an FTP reply into the most appropriate error kind.
    /// `raw` is the complete reply text and is kept for diagnosis.
    pub fn from_reply(code: u16, raw: &str) -> Self {
        let kind = match code {
            421 => FtpErrorKind::Disconnected,
            425 | 426 => FtpErrorKind::DataChannelFailed,
            430 | 530 => FtpErrorKind::AuthFailed,
            450 | 550 => {
                let lower = raw.to_lowercase();
                if lower.contains("permission") || lower.contains("denied") {
                    FtpErrorKind::PermissionDenied
                } else if lower.contains("not found")
                    || lower.contains("no such")
                    || lower.contains("does not exist")
                {
                    FtpErrorKind::NotFound
                } else {
                    FtpErrorKind::CommandRejected
                }
            }
            451 | 452 | 552 => FtpErrorKind::TransferFailed,
            _ => FtpErrorKind::CommandRejected,
        };
        Self {
            kind,
            message: raw.lines().last().unwrap_or(raw).to_string(),
            code: Some(code),
            raw_reply: Some(raw.to_string()),
        }
    }

    // ── Classification ───────────────────────────────────────────

    /// Network-level failure whose protocol state is indeterminate.
    pub fn is_transient_io(&self) -> bool {
        matches!(
            self.kind,
            FtpErrorKind::IoError
                | FtpErrorKind::Disconnected
                | FtpErrorKind::Timeout
                | FtpErrorKind::DataChannelFailed
                | FtpErrorKind::TransferFailed
        )
    }

    /// The server refused with a 5xx reply.
    pub fn is_permanent(&self) -> bool {
        matches!(self.code, Some(c) if (500..600).contains(&c))
    }

    /// The server refused with a 4xx reply, or the failure was network-level.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, Some(c) if (400..500).contains(&c)) || self.is_transient_io()
    }

    pub fn is_parse_error(&self) -> bool {
        matches!(
            self.kind,
            FtpErrorKind::MalformedEntry | FtpErrorKind::IncompleteEntry
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == FtpErrorKind::NotFound
    }

    /// Whether a connection that produced this error must be discarded
    /// rather than returned to the idle set.
    pub fn marks_connection_unhealthy(&self) -> bool {
        match self.kind {
            FtpErrorKind::CommandRejected
            | FtpErrorKind::ProtocolError
            | FtpErrorKind::PermissionDenied
            | FtpErrorKind::NotFound
            | FtpErrorKind::TlsFailed
            | FtpErrorKind::AuthFailed => true,
            _ => self.is_transient_io(),
        }
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[FTP {:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout(format!("I/O timeout: {}", e)),
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::disconnected(e.to_string()),
            _ => Self::io_error(e.to_string()),
        }
    }
}

impl From<rustls::Error> for FtpError {
    fn from(e: rustls::Error) -> Self {
        Self::tls_failed(e.to_string())
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.to_string()
    }
}

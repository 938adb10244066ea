//! Shared types for the FTP crate.

use crate::ftp::error::{FtpError, FtpResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

// ─── Connection ──────────────────────────────────────────────────────

/// Security mode for the control channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum FtpSecurityMode {
    /// Plain-text FTP (port 21).
    #[default]
    None,
    /// Explicit FTPS: starts plain then upgrades via AUTH TLS (port 21).
    Explicit,
    /// Implicit FTPS: TLS from the first byte (port 990).
    Implicit,
}

/// Transfer type (RFC 959 TYPE command).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TransferType {
    Ascii,
    #[default]
    Binary,
}

impl TransferType {
    pub fn command(self) -> &'static str {
        match self {
            TransferType::Ascii => "TYPE A",
            TransferType::Binary => "TYPE I",
        }
    }
}

/// Transfer mode selected for the data channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum DataChannelMode {
    #[default]
    Passive,
    ExtendedPassive,
    Active,
    ExtendedActive,
}

/// Canned reply returned instead of talking to the server.
///
/// Keyed by the exact command line (without CRLF) in
/// [`FtpConfig::stub_responses`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubResponse {
    pub code: u16,
    pub message: String,
}

/// Configuration shared by every connection of a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub security: FtpSecurityMode,
    /// Accept self-signed / untrusted certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub transfer_type: TransferType,
    #[serde(default)]
    pub data_channel_mode: DataChannelMode,
    /// Local address to bind for active-mode data connections.
    #[serde(default)]
    pub active_bind_address: Option<String>,
    /// Send OPTS UTF8 ON when the server advertises it.
    #[serde(default = "default_true")]
    pub utf8: bool,
    /// Connections opened eagerly when the client is built.
    #[serde(default)]
    pub min_connections: usize,
    /// Upper bound on live control connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
    /// Per command/reply exchange on the control channel.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_sec: u64,
    /// How long a caller waits for a pooled connection.
    #[serde(default = "default_borrow_timeout")]
    pub borrow_timeout_sec: u64,
    #[serde(default = "default_data_timeout")]
    pub data_timeout_sec: u64,
    /// Idle connections older than this are closed instead of reused.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_sec: u64,
    /// Exact command → canned reply. Checked before anything is written
    /// to the wire.
    #[serde(skip)]
    pub stub_responses: HashMap<String, StubResponse>,
}

fn default_port() -> u16 {
    21
}
fn default_username() -> String {
    "anonymous".into()
}
fn default_true() -> bool {
    true
}
fn default_max_connections() -> usize {
    5
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_command_timeout() -> u64 {
    30
}
fn default_borrow_timeout() -> u64 {
    30
}
fn default_data_timeout() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    300
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: default_username(),
            password: "anonymous@".into(),
            security: FtpSecurityMode::None,
            accept_invalid_certs: false,
            transfer_type: TransferType::Binary,
            data_channel_mode: DataChannelMode::Passive,
            active_bind_address: None,
            utf8: true,
            min_connections: 0,
            max_connections: default_max_connections(),
            connect_timeout_sec: default_connect_timeout(),
            command_timeout_sec: default_command_timeout(),
            borrow_timeout_sec: default_borrow_timeout(),
            data_timeout_sec: default_data_timeout(),
            idle_timeout_sec: default_idle_timeout(),
            stub_responses: HashMap::new(),
        }
    }
}

impl FtpConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// Build a config from `ftp://`, `ftpes://` (explicit TLS) or
    /// `ftps://` (implicit TLS) URLs. Credentials in the URL are taken
    /// verbatim.
    pub fn from_url(raw: &str) -> FtpResult<Self> {
        let url = Url::parse(raw)
            .map_err(|e| FtpError::invalid_config(format!("Invalid FTP URL '{}': {}", raw, e)))?;

        let (security, default_port) = match url.scheme() {
            "ftp" => (FtpSecurityMode::None, 21),
            "ftpes" => (FtpSecurityMode::Explicit, 21),
            "ftps" => (FtpSecurityMode::Implicit, 990),
            other => {
                return Err(FtpError::invalid_config(format!(
                    "Unsupported URL scheme '{}'",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| FtpError::invalid_config(format!("URL has no host: {}", raw)))?;

        let mut config = Self {
            host: host.to_string(),
            port: url.port().unwrap_or(default_port),
            security,
            ..Default::default()
        };
        if !url.username().is_empty() {
            config.username = url.username().to_string();
            config.password = url.password().unwrap_or_default().to_string();
        }
        Ok(config)
    }

    /// Deserialize a config from JSON, filling unspecified fields with defaults.
    pub fn from_json(raw: &str) -> FtpResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| FtpError::invalid_config(format!("Invalid FTP config: {}", e)))
    }

    /// Register a canned reply for an exact command line.
    pub fn with_stub(mut self, command: impl Into<String>, code: u16, message: impl Into<String>) -> Self {
        self.stub_responses.insert(
            command.into(),
            StubResponse {
                code,
                message: message.into(),
            },
        );
        self
    }

    pub fn validate(&self) -> FtpResult<()> {
        if self.host.is_empty() {
            return Err(FtpError::invalid_config("Host must not be empty"));
        }
        if self.max_connections == 0 {
            return Err(FtpError::invalid_config("maxConnections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(FtpError::invalid_config(format!(
                "minConnections ({}) exceeds maxConnections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_sec)
    }

    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_secs(self.borrow_timeout_sec)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_sec)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_sec)
    }
}

// ─── Directory Listing ───────────────────────────────────────────────

/// Type of a remote filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

/// Normalised metadata for one remote entry, whichever listing format
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub name: String,
    /// Absent for directories whose listing carried no size.
    pub size: Option<u64>,
    pub modified: DateTime<Utc>,
    /// Permission bits only (`0o7777`); the type lives in `kind`.
    pub mode: u32,
    pub kind: FileKind,
    /// The listing line this record was parsed from.
    pub raw: String,
}

impl FileRecord {
    pub const TYPE_DIRECTORY: u32 = 0o040_000;
    pub const TYPE_REGULAR: u32 = 0o100_000;
    pub const TYPE_SYMLINK: u32 = 0o120_000;

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::Regular
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    /// Size in bytes, zero when the listing did not report one.
    pub fn len(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `st_mode`-style value: type bits combined with the permission bits.
    pub fn unix_mode(&self) -> u32 {
        let type_bits = match self.kind {
            FileKind::Regular => Self::TYPE_REGULAR,
            FileKind::Directory => Self::TYPE_DIRECTORY,
            FileKind::Symlink => Self::TYPE_SYMLINK,
        };
        type_bits | (self.mode & 0o7777)
    }
}

/// How a connection lists directories, decided once per connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ListingStrategy {
    /// MLSD / MLST facts (RFC 3659).
    Structured,
    /// Free-form LIST text.
    Freeform,
}

/// Sorting field for directory listings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FtpSortField {
    Name,
    Size,
    Modified,
    Kind,
}

/// Sort order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FtpSortOrder {
    Asc,
    Desc,
}

/// Options for listing a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    /// Filter by glob pattern (e.g. "*.txt").
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub sort_by: Option<FtpSortField>,
    #[serde(default)]
    pub sort_order: Option<FtpSortOrder>,
    /// Show hidden ("dot") files.
    #[serde(default = "default_true")]
    pub show_hidden: bool,
    /// Drop entries that fail to parse instead of failing the listing.
    #[serde(default)]
    pub skip_unparsable: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            filter: None,
            sort_by: None,
            sort_order: None,
            show_hidden: true,
            skip_unparsable: false,
        }
    }
}

// ─── FTP Response ────────────────────────────────────────────────────

/// A single FTP response (may be multi-line).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpResponse {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpResponse {
    pub fn new(code: u16, message: &str) -> Self {
        Self {
            code,
            lines: vec![format!("{} {}", code, message)],
        }
    }

    /// Full response text (all lines joined).
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Text of the final line after the reply code.
    pub fn message(&self) -> &str {
        self.lines
            .last()
            .map(|l| l.get(4..).unwrap_or(""))
            .unwrap_or("")
    }

    /// Whether the response code indicates success (1xx–3xx).
    pub fn is_success(&self) -> bool {
        self.code < 400
    }

    /// Whether this is a positive-preliminary reply (1xx).
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Whether this is a positive-completion reply (2xx).
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Whether this is a positive-intermediate reply (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Transient negative completion (4xx).
    pub fn is_transient_failure(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// Permanent negative completion (5xx).
    pub fn is_permanent_failure(&self) -> bool {
        (500..600).contains(&self.code)
    }
}

// ─── Connection Pool ─────────────────────────────────────────────────

/// Statistics about the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Connections that exist right now: idle + leased + being dialled.
    pub live: usize,
    pub idle: usize,
    pub leased: usize,
    pub max: usize,
    pub total_created: u64,
    pub total_discarded: u64,
}

// ─── Server Capabilities ─────────────────────────────────────────────

/// Parsed FEAT response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFeatures {
    pub mlsd: bool,
    pub mlst: bool,
    pub utf8: bool,
    pub epsv: bool,
    pub auth_tls: bool,
    pub raw_features: Vec<String>,
}

impl ServerFeatures {
    /// Build from the lines of a 211 FEAT reply.
    pub fn from_feat_reply(resp: &FtpResponse) -> Self {
        let raw: Vec<String> = resp
            .lines
            .iter()
            .skip(1)
            .filter(|l| !l.starts_with("211"))
            .map(|l| l.trim().to_uppercase())
            .collect();

        let has = |feat: &str| raw.iter().any(|l| l.starts_with(feat));

        Self {
            mlsd: has("MLSD"),
            mlst: has("MLST"),
            utf8: has("UTF8"),
            epsv: has("EPSV"),
            auth_tls: has("AUTH TLS"),
            raw_features: raw,
        }
    }
}

//! Stateful FTP session: owns one control connection and issues commands.
//!
//! Lifecycle: `connect()` → optional TLS upgrade → authenticate →
//! FEAT probing → OPTS UTF8 → set TYPE → PWD.
//!
//! The session is the protocol engine the pool hands out. It exposes the
//! low-level command helpers used by `directory.rs` and `file_ops.rs`,
//! applies the stub table before touching the wire, enforces the
//! per-command timeout, and remembers when its control channel can no
//! longer be trusted.

use crate::ftp::connection;
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::protocol::{codes, parse_quoted_path, FtpCodec};
use crate::ftp::tls::{self, FtpTls};
use crate::ftp::transfer::{self, DataStream};
use crate::ftp::types::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use uuid::Uuid;

/// Outcome of starting a data-transfer command.
pub enum TransferStart {
    /// The server accepted the command; bytes flow over the stream and the
    /// completion reply must be read with [`FtpSession::finish_transfer`].
    Stream(DataStream),
    /// The server answered with a completion reply straight away
    /// (nothing to transfer), or a stub answered for it.
    Completed(FtpResponse),
}

/// A connected FTP control session.
pub struct FtpSession {
    id: String,
    codec: FtpCodec,
    config: Arc<FtpConfig>,
    /// Present when data connections must be TLS-wrapped (PROT P).
    data_tls: Option<FtpTls>,
    features: ServerFeatures,
    /// How `list` reads directories (MLSD or LIST).
    listing: Option<ListingStrategy>,
    /// How `stat` reads single entries (MLST or a parent LIST).
    stat: Option<ListingStrategy>,
    cwd: String,
    /// Working directory right after login.
    home: String,
    system_type: Option<String>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    broken: bool,
    created_at: Instant,
    last_used: Instant,
    lease_count: u64,
    lease_start_bytes: u64,
    lease_replies: u32,
}

impl FtpSession {
    /// Dial, authenticate and prepare a new session.
    pub async fn connect(config: Arc<FtpConfig>) -> FtpResult<Self> {
        config.validate()?;

        let tls = match config.security {
            FtpSecurityMode::None => None,
            _ => Some(FtpTls::new(&config.host, config.accept_invalid_certs)?),
        };

        let conn = connection::connect(&config, tls.as_ref()).await?;
        let mut codec = conn.codec;

        // ── Explicit FTPS: AUTH TLS ──────────────────────────────
        if let (FtpSecurityMode::Explicit, Some(tls)) = (config.security, tls.as_ref()) {
            let resp = bounded(config.command_timeout(), "AUTH TLS", codec.execute("AUTH TLS")).await?;
            if resp.code != codes::AUTH_OK {
                return Err(FtpError::tls_failed(format!("AUTH TLS rejected: {}", resp.text()))
                    .with_code(resp.code)
                    .with_reply(resp.text()));
            }
            codec = timeout(config.connect_timeout(), tls::upgrade_to_tls(codec, tls))
                .await
                .map_err(|_| FtpError::timeout("Explicit TLS handshake timed out"))??;
        }

        let now = Instant::now();
        let mut session = Self {
            id: Uuid::new_v4().to_string(),
            codec,
            config,
            data_tls: tls,
            features: ServerFeatures::default(),
            listing: None,
            stat: None,
            cwd: "/".into(),
            home: "/".into(),
            system_type: None,
            peer_addr: conn.peer_addr,
            local_addr: conn.local_addr,
            broken: false,
            created_at: now,
            last_used: now,
            lease_count: 0,
            lease_start_bytes: 0,
            lease_replies: 0,
        };

        // ── Protection level ─────────────────────────────────────
        if session.data_tls.is_some() {
            session.send_command_expected(codes::COMMAND_OK, "PBSZ 0").await?;
            session.send_command_expected(codes::COMMAND_OK, "PROT P").await?;
        }

        session.login().await?;

        // ── FEAT ─────────────────────────────────────────────────
        session.features = session.read_features().await?;

        // ── OPTS UTF8 ON ─────────────────────────────────────────
        if session.config.utf8 && session.features.utf8 {
            let resp = session.send_command("OPTS UTF8 ON").await?;
            if !resp.is_completion() {
                log::debug!("[{}] OPTS UTF8 ON refused: {}", session.id, resp.text());
            }
        }

        // ── SYST ─────────────────────────────────────────────────
        let syst = session.send_command("SYST").await?;
        if syst.code == codes::SYSTEM_TYPE {
            session.system_type = Some(syst.message().to_string());
        }

        // ── TYPE ─────────────────────────────────────────────────
        let type_cmd = session.config.transfer_type.command();
        session.send_command_expected(codes::COMMAND_OK, type_cmd).await?;

        // ── PWD ──────────────────────────────────────────────────
        session.cwd = session.pwd().await?;
        session.home = session.cwd.clone();

        log::info!(
            "[{}] FTP session ready on {} as {} (cwd {})",
            session.id,
            session.peer_addr,
            session.config.username,
            session.cwd
        );
        Ok(session)
    }

    async fn login(&mut self) -> FtpResult<()> {
        let user_cmd = format!("USER {}", self.config.username);
        let user_resp = self.send_command(&user_cmd).await?;
        match user_resp.code {
            codes::LOGGED_IN => Ok(()),
            codes::NEED_PASSWORD => {
                let pass_cmd = format!("PASS {}", self.config.password);
                let pass_resp = self.send_command(&pass_cmd).await?;
                if pass_resp.code == codes::LOGGED_IN || pass_resp.code == 202 {
                    Ok(())
                } else {
                    Err(FtpError::auth_failed(format!("Login failed: {}", pass_resp.message()))
                        .with_code(pass_resp.code)
                        .with_reply(pass_resp.text()))
                }
            }
            code => Err(FtpError::auth_failed(format!("USER rejected: {}", user_resp.message()))
                .with_code(code)
                .with_reply(user_resp.text())),
        }
    }

    async fn read_features(&mut self) -> FtpResult<ServerFeatures> {
        let resp = self.send_command("FEAT").await?;
        if resp.code != codes::SYSTEM_STATUS {
            return Ok(ServerFeatures::default());
        }
        let features = ServerFeatures::from_feat_reply(&resp);
        // A FEAT list without MLSD or MLST: go straight to LIST.
        if !features.mlsd && !features.mlst {
            self.set_listing_strategy(ListingStrategy::Freeform);
            self.set_stat_strategy(ListingStrategy::Freeform);
        }
        Ok(features)
    }

    // ─── Command / reply ─────────────────────────────────────────

    /// Send one command line and read its reply.
    ///
    /// A command found verbatim in the stub table is answered from the
    /// table and never reaches the server.
    pub async fn send_command(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        if let Some(resp) = self.stubbed(cmd) {
            return Ok(resp);
        }
        let dur = self.config.command_timeout();
        let result = bounded(dur, cmd, self.codec.execute(cmd)).await;
        self.last_used = Instant::now();
        self.note_reply(&result);
        self.track(result)
    }

    /// Like [`send_command`](Self::send_command) but fails unless the reply
    /// carries exactly `expected`.
    pub async fn send_command_expected(&mut self, expected: u16, cmd: &str) -> FtpResult<FtpResponse> {
        let resp = self.send_command(cmd).await?;
        if resp.code != expected {
            log::debug!(
                "[{}] '{}' expected {} got {}",
                self.id,
                redact(cmd),
                expected,
                resp.code
            );
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }
        Ok(resp)
    }

    /// Read one more reply without sending anything (transfer completion).
    pub async fn read_reply(&mut self) -> FtpResult<FtpResponse> {
        let dur = self.config.command_timeout();
        let result = bounded(dur, "reply", self.codec.read_response()).await;
        self.last_used = Instant::now();
        self.note_reply(&result);
        self.track(result)
    }

    fn stubbed(&self, cmd: &str) -> Option<FtpResponse> {
        let stub = self.config.stub_responses.get(cmd)?;
        log::debug!(
            "[{}] stubbed '{}' -> {} {}",
            self.id,
            redact(cmd),
            stub.code,
            stub.message
        );
        Some(FtpResponse::new(stub.code, &stub.message))
    }

    /// Count a server reply. A `421` means the server is closing the
    /// control connection, whatever command it appears to answer.
    fn note_reply(&mut self, result: &FtpResult<FtpResponse>) {
        if let Ok(resp) = result {
            self.lease_replies += 1;
            if resp.code == codes::SERVICE_CLOSING && !self.broken {
                log::warn!("[{}] server closing connection: {}", self.id, resp.text());
                self.broken = true;
            }
        }
    }

    /// Record failures that leave the control channel in an unknown state.
    fn track<T>(&mut self, result: FtpResult<T>) -> FtpResult<T> {
        if let Err(ref e) = result {
            if e.is_transient_io() || e.kind == FtpErrorKind::ProtocolError {
                if !self.broken {
                    log::warn!("[{}] control channel unusable: {}", self.id, e);
                }
                self.broken = true;
            }
        }
        result
    }

    // ─── Data transfers ──────────────────────────────────────────

    /// Start a command that moves data over a data connection
    /// (`LIST`, `MLSD`, `RETR`, `STOR`, ...).
    ///
    /// The data connection is negotiated before the verb is sent. A
    /// positive-preliminary reply yields the ready stream.
    pub async fn begin_transfer(&mut self, cmd: &str) -> FtpResult<TransferStart> {
        if let Some(resp) = self.stubbed(cmd) {
            return if resp.is_success() {
                Ok(TransferStart::Completed(resp))
            } else {
                Err(FtpError::from_reply(resp.code, &resp.text()))
            };
        }

        let pending = match transfer::negotiate(self).await {
            Ok(p) => p,
            Err(e) => return self.track(Err(e)),
        };

        let dur = self.config.command_timeout();
        let result = bounded(dur, cmd, self.codec.execute(cmd)).await;
        self.last_used = Instant::now();
        self.note_reply(&result);
        let resp = self.track(result)?;

        if resp.is_preliminary() {
            let data_timeout = self.config.data_timeout();
            let stream = pending.establish(self.data_tls.as_ref(), data_timeout).await;
            let stream = self.track(stream)?;
            Ok(TransferStart::Stream(stream))
        } else if resp.is_completion() {
            Ok(TransferStart::Completed(resp))
        } else {
            Err(FtpError::from_reply(resp.code, &resp.text()))
        }
    }

    /// Read the completion reply once the data stream hit EOF or was shut
    /// down. Must run before the session is reused.
    pub async fn finish_transfer(&mut self) -> FtpResult<FtpResponse> {
        let resp = self.read_reply().await?;
        if !resp.is_completion() {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }
        Ok(resp)
    }

    // ─── PWD / CWD ───────────────────────────────────────────────

    /// Ask the server for its working directory.
    pub async fn pwd(&mut self) -> FtpResult<String> {
        let resp = self.send_command_expected(codes::PATH_CREATED, "PWD").await?;
        parse_quoted_path(&resp.text())?.ok_or_else(|| {
            FtpError::protocol_error(format!("Cannot parse PWD: {}", resp.text()))
                .with_reply(resp.text())
        })
    }

    /// Change into `path` and record the server's view of the new directory.
    pub async fn chdir(&mut self, path: &str) -> FtpResult<String> {
        self.send_command_expected(codes::FILE_ACTION_OK, &format!("CWD {}", path))
            .await?;
        let new_pwd = self.pwd().await?;
        log::debug!("[{}] cwd {} -> {}", self.id, self.cwd, new_pwd);
        self.cwd = new_pwd.clone();
        Ok(new_pwd)
    }

    /// Last working directory recorded for this connection.
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Working directory the server put us in at login.
    pub fn home(&self) -> &str {
        &self.home
    }

    // ─── QUIT ────────────────────────────────────────────────────

    /// Gracefully close the session. Errors are ignored; the socket is
    /// dropped either way.
    pub async fn quit(mut self) {
        if !self.broken {
            let _ = timeout(Duration::from_secs(2), self.codec.execute("QUIT")).await;
        }
        let _ = self.codec.shutdown().await;
        log::debug!("[{}] FTP session closed", self.id);
    }

    // ─── Capability ──────────────────────────────────────────────

    /// Directory listing strategy, if this connection already determined it.
    pub fn listing_strategy(&self) -> Option<ListingStrategy> {
        self.listing
    }

    pub(crate) fn set_listing_strategy(&mut self, strategy: ListingStrategy) {
        if self.listing.is_none() {
            log::debug!("[{}] listing strategy: {:?}", self.id, strategy);
            self.listing = Some(strategy);
        }
    }

    /// Single-entry lookup strategy, decided independently of listings.
    pub fn stat_strategy(&self) -> Option<ListingStrategy> {
        self.stat
    }

    pub(crate) fn set_stat_strategy(&mut self, strategy: ListingStrategy) {
        if self.stat.is_none() {
            log::debug!("[{}] stat strategy: {:?}", self.id, strategy);
            self.stat = Some(strategy);
        }
    }

    // ─── Lease bookkeeping ───────────────────────────────────────

    pub(crate) fn begin_lease(&mut self) {
        self.lease_count += 1;
        self.lease_start_bytes = self.codec.bytes_read();
        self.lease_replies = 0;
    }

    /// Whether the server has sent anything during the current lease.
    pub fn exchanged_this_lease(&self) -> bool {
        self.codec.bytes_read() > self.lease_start_bytes
    }

    /// Server replies read during the current lease.
    pub fn replies_this_lease(&self) -> u32 {
        self.lease_replies
    }

    /// Number of times this session was handed out, including the current one.
    pub fn lease_count(&self) -> u64 {
        self.lease_count
    }

    // ─── Utility ─────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &FtpConfig {
        &self.config
    }

    pub fn features(&self) -> &ServerFeatures {
        &self.features
    }

    pub fn system_type(&self) -> Option<&str> {
        self.system_type.as_deref()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

/// Run one control-channel exchange under `dur`.
async fn bounded<F>(dur: Duration, cmd: &str, fut: F) -> FtpResult<FtpResponse>
where
    F: std::future::Future<Output = FtpResult<FtpResponse>>,
{
    match timeout(dur, fut).await {
        Ok(result) => result,
        Err(_) => Err(FtpError::timeout(format!(
            "No reply to '{}' within {}s",
            redact(cmd),
            dur.as_secs()
        ))),
    }
}

/// Hide the password argument of `PASS`.
fn redact(cmd: &str) -> &str {
    if cmd.get(..5).map_or(false, |p| p.eq_ignore_ascii_case("PASS ")) {
        "PASS ****"
    } else {
        cmd
    }
}

/// Reply codes that mean the server does not know the command at all.
pub fn is_not_understood(code: u16) -> bool {
    code == codes::SYNTAX_ERROR || code == codes::NOT_IMPLEMENTED
}

//! High-level client: filesystem-style operations over the connection pool.
//!
//! Every call leases one connection, runs its exchanges, and hands the
//! connection back healthy or not depending on how the call ended. A reused
//! connection that dies before the server has said anything on this lease
//! is treated as stale and the call is replayed once on another connection.

use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::pool::{spawn_pool_maintenance, FtpPool, PooledSession};
use crate::ftp::protocol::codes;
use crate::ftp::types::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

/// Run `$body` on a leased session bound to `$s`, with a single replay on a
/// stale connection.
macro_rules! with_session {
    ($client:expr, $op:expr, |$s:ident| $body:expr) => {{
        let mut attempt = 0u8;
        loop {
            attempt += 1;
            let mut $s = $client.inner.pool.borrow().await?;
            let result = $body.await;
            let retry = attempt == 1 && matches!(&result, Err(e) if is_stale(e, &$s));
            let healthy = result
                .as_ref()
                .err()
                .map_or(true, |e| !e.marks_connection_unhealthy());
            $s.release(healthy);
            if retry {
                log::info!("FTP {}: stale connection, retrying on a fresh one", $op);
                continue;
            }
            break result;
        }
    }};
}

/// Failed before the server answered anything on a connection that sat in
/// the idle set, so nothing can have been executed. A `421` that is the
/// first reply of the lease was queued while idle and counts the same.
fn is_stale(err: &FtpError, session: &PooledSession) -> bool {
    let dropped = matches!(err.kind, FtpErrorKind::IoError | FtpErrorKind::Disconnected);
    if !dropped || !session.is_reused() {
        return false;
    }
    let idle_notice = err.code == Some(codes::SERVICE_CLOSING) && session.replies_this_lease() == 1;
    !session.exchanged_this_lease() || idle_notice
}

struct ClientInner {
    pool: FtpPool,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.maintenance.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// Pooled FTP client. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct FtpClient {
    inner: Arc<ClientInner>,
}

impl FtpClient {
    // ─── Lifecycle ───────────────────────────────────────────────

    /// Build a client, open `min_connections` connections, and start the
    /// idle reaper.
    pub async fn connect(config: FtpConfig) -> FtpResult<Self> {
        log::info!(
            "FTP client for {} (pool {}..{})",
            config.address(),
            config.min_connections,
            config.max_connections
        );
        let interval = reap_interval(config.idle_timeout());
        let pool = FtpPool::new(config)?;
        if let Err(e) = pool.warm_up().await {
            pool.close().await;
            return Err(e);
        }
        let maintenance = spawn_pool_maintenance(pool.clone(), interval);
        Ok(Self {
            inner: Arc::new(ClientInner {
                pool,
                maintenance: Mutex::new(Some(maintenance)),
            }),
        })
    }

    /// Parse an `ftp://`, `ftpes://` or `ftps://` URL and connect.
    pub async fn connect_url(url: &str) -> FtpResult<Self> {
        Self::connect(FtpConfig::from_url(url)?).await
    }

    pub fn config(&self) -> &FtpConfig {
        self.inner.pool.config()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Close every idle connection and refuse further calls. Connections
    /// still leased are closed as they come back.
    pub async fn close(&self) {
        let handle = match self.inner.maintenance.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        self.inner.pool.close().await;
    }

    /// Lease a connection for several exchanges in a row. Give it back
    /// with [`PooledSession::release`].
    pub async fn checkout(&self) -> FtpResult<PooledSession> {
        self.inner.pool.borrow().await
    }

    /// Send one command verbatim and return the reply, whatever its code.
    pub async fn raw_command(&self, cmd: &str) -> FtpResult<FtpResponse> {
        with_session!(self, "raw command", |s| s.send_command(cmd))
    }

    // ─── Directories ─────────────────────────────────────────────

    /// List `path` (empty for the login directory).
    pub async fn list(&self, path: &str) -> FtpResult<Vec<FileRecord>> {
        self.list_with_options(path, ListOptions::default()).await
    }

    /// List `path`, then filter and sort per `opts`.
    pub async fn list_with_options(&self, path: &str, opts: ListOptions) -> FtpResult<Vec<FileRecord>> {
        let pattern = match opts.filter.as_deref() {
            Some(filter) => Some(glob::Pattern::new(filter).map_err(|e| {
                FtpError::invalid_config(format!("Invalid filter '{}': {}", filter, e))
            })?),
            None => None,
        };

        let mut entries = with_session!(self, "list", |s| s.list(path, opts.skip_unparsable))?;

        if let Some(pattern) = pattern {
            entries.retain(|e| pattern.matches(&e.name));
        }
        if !opts.show_hidden {
            entries.retain(|e| !e.name.starts_with('.'));
        }
        sort_entries(&mut entries, opts.sort_by, opts.sort_order);
        Ok(entries)
    }

    pub async fn stat(&self, path: &str) -> FtpResult<FileRecord> {
        with_session!(self, "stat", |s| s.stat(path))
    }

    /// Create a directory. Returns the path the server reports, which may
    /// be normalised or absolute.
    pub async fn mkdir(&self, path: &str) -> FtpResult<String> {
        with_session!(self, "mkdir", |s| s.mkdir(path))
    }

    pub async fn rmdir(&self, path: &str) -> FtpResult<()> {
        with_session!(self, "rmdir", |s| s.rmdir(path))
    }

    pub async fn rename(&self, from: &str, to: &str) -> FtpResult<()> {
        with_session!(self, "rename", |s| s.rename(from, to))
    }

    pub async fn delete(&self, path: &str) -> FtpResult<()> {
        with_session!(self, "delete", |s| s.delete(path))
    }

    /// Login directory as the server names it.
    pub async fn getwd(&self) -> FtpResult<String> {
        with_session!(self, "getwd", |s| s.getwd())
    }

    // ─── Files ───────────────────────────────────────────────────

    /// Upload everything `reader` yields to `path`. Returns bytes sent.
    pub async fn store<R>(&self, path: &str, reader: &mut R) -> FtpResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        with_session!(self, "store", |s| s.store(path, &mut *reader))
    }

    /// Download `path` into `writer`. Returns bytes written.
    pub async fn retrieve<W>(&self, path: &str, writer: &mut W) -> FtpResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        with_session!(self, "retrieve", |s| s.retrieve(path, &mut *writer))
    }

    /// Download `path` into memory.
    pub async fn retrieve_bytes(&self, path: &str) -> FtpResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.retrieve(path, &mut buf).await?;
        Ok(buf)
    }

    /// Upload an in-memory buffer to `path`.
    pub async fn store_bytes(&self, path: &str, data: &[u8]) -> FtpResult<u64> {
        let mut reader = data;
        self.store(path, &mut reader).await
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

fn reap_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 4).max(Duration::from_secs(1))
}

fn sort_entries(entries: &mut [FileRecord], sort_by: Option<FtpSortField>, order: Option<FtpSortOrder>) {
    if let Some(field) = sort_by {
        match field {
            FtpSortField::Name => entries.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase())),
            FtpSortField::Size => entries.sort_by(|a, b| a.size.cmp(&b.size)),
            FtpSortField::Modified => entries.sort_by(|a, b| a.modified.cmp(&b.modified)),
            FtpSortField::Kind => entries.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name))),
        }
    }
    if order == Some(FtpSortOrder::Desc) {
        entries.reverse();
    }
}

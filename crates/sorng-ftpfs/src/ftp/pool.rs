//! Connection pool: a bounded set of `FtpSession`s leased to one caller at
//! a time.
//!
//! A fair semaphore caps live connections at `max_connections`; waiters
//! are served in arrival order. Idle sessions sit in a LIFO stack behind a
//! short-lived mutex that is never held across an await. Sessions idle
//! longer than `idle_timeout_sec` are closed instead of reused, both on
//! borrow and by the optional maintenance task.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::session::FtpSession;
use crate::ftp::types::*;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, timeout, Duration};

struct PoolState {
    idle: Vec<FtpSession>,
    /// Idle + leased + being dialled.
    open: usize,
    leased: usize,
    closed: bool,
}

struct PoolShared {
    config: Arc<FtpConfig>,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
    total_created: AtomicU64,
    total_discarded: AtomicU64,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // The state stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Account for a connection that will never come back.
    fn forget(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.lock();
        state.open = state.open.saturating_sub(count);
        drop(state);
        self.total_discarded.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Thread-safe pool of FTP control connections. Cheap to clone.
#[derive(Clone)]
pub struct FtpPool {
    shared: Arc<PoolShared>,
}

impl FtpPool {
    pub fn new(config: FtpConfig) -> FtpResult<Self> {
        config.validate()?;
        let max = config.max_connections;
        Ok(Self {
            shared: Arc::new(PoolShared {
                config: Arc::new(config),
                state: Mutex::new(PoolState {
                    idle: Vec::with_capacity(max),
                    open: 0,
                    leased: 0,
                    closed: false,
                }),
                permits: Arc::new(Semaphore::new(max)),
                total_created: AtomicU64::new(0),
                total_discarded: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &FtpConfig {
        &self.shared.config
    }

    /// Open `min_connections` sessions up front and park them as idle.
    pub async fn warm_up(&self) -> FtpResult<()> {
        let min = self.shared.config.min_connections;
        let mut leases = Vec::with_capacity(min);
        for _ in 0..min {
            leases.push(self.borrow().await?);
        }
        for lease in leases {
            lease.release(true);
        }
        if min > 0 {
            log::info!("FTP pool warmed up with {} connections", min);
        }
        Ok(())
    }

    // ─── Borrow ──────────────────────────────────────────────────

    /// Lease a connection: an idle one if available, otherwise a new one
    /// while below the limit, otherwise wait up to `borrow_timeout_sec`.
    pub async fn borrow(&self) -> FtpResult<PooledSession> {
        let wait = self.shared.config.borrow_timeout();
        let permit = match timeout(wait, self.shared.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(FtpError::pool_closed()),
            Err(_) => {
                return Err(FtpError::pool_exhausted(format!(
                    "No FTP connection available within {}s (max {})",
                    wait.as_secs(),
                    self.shared.config.max_connections
                )))
            }
        };

        let idle_timeout = self.shared.config.idle_timeout();
        let mut expired = Vec::new();
        let reused = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(FtpError::pool_closed());
            }
            let mut found = None;
            while let Some(session) = state.idle.pop() {
                if session.idle_for() > idle_timeout {
                    expired.push(session);
                } else {
                    found = Some(session);
                    break;
                }
            }
            state.open -= expired.len();
            if found.is_some() {
                state.leased += 1;
            } else {
                // Holding a permit guarantees room for one more.
                state.open += 1;
            }
            found
        };
        if !expired.is_empty() {
            self.shared
                .total_discarded
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            log::debug!("FTP pool: closing {} expired idle connections", expired.len());
            // No await before the lease or dial slot owns the counts above.
            expired.into_iter().for_each(discard);
        }

        let mut session = match reused {
            Some(session) => session,
            None => {
                let mut slot = DialSlot {
                    shared: &self.shared,
                    filled: false,
                };
                let session = FtpSession::connect(self.shared.config.clone())
                    .await
                    .map_err(|e| {
                        log::warn!("FTP pool: dial failed: {}", e);
                        e
                    })?;
                slot.filled = true;
                self.shared.total_created.fetch_add(1, Ordering::Relaxed);
                self.shared.lock().leased += 1;
                session
            }
        };

        session.begin_lease();
        log::debug!(
            "FTP pool: leased {} (lease #{})",
            session.id(),
            session.lease_count()
        );
        Ok(PooledSession {
            session,
            lease: Lease {
                shared: self.shared.clone(),
                _permit: permit,
                settled: false,
            },
        })
    }

    // ─── Maintenance ─────────────────────────────────────────────

    /// Close idle connections past `idle_timeout_sec`. Returns how many.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.shared.config.idle_timeout();
        let expired: Vec<FtpSession> = {
            let mut state = self.shared.lock();
            let (expired, kept): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|s| s.idle_for() > idle_timeout);
            state.idle = kept;
            state.open -= expired.len();
            expired
        };
        let count = expired.len();
        self.shared
            .total_discarded
            .fetch_add(count as u64, Ordering::Relaxed);
        for session in expired {
            session.quit().await;
        }
        if count > 0 {
            log::info!("FTP pool: reaped {} idle connections", count);
        }
        count
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            live: state.open,
            idle: state.idle.len(),
            leased: state.leased,
            max: self.shared.config.max_connections,
            total_created: self.shared.total_created.load(Ordering::Relaxed),
            total_discarded: self.shared.total_discarded.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Refuse further borrows, wake every waiter with an error, and QUIT
    /// all idle connections. Leased ones are closed when they come back.
    pub async fn close(&self) {
        let idle: Vec<FtpSession> = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<FtpSession> = state.idle.drain(..).collect();
            state.open -= idle.len();
            idle
        };
        self.shared.permits.close();
        self.shared
            .total_discarded
            .fetch_add(idle.len() as u64, Ordering::Relaxed);
        log::info!("FTP pool: closing {} idle connections", idle.len());
        for session in idle {
            session.quit().await;
        }
    }
}

/// Spawn a background task that periodically reaps expired idle
/// connections. Stops once the pool is closed.
pub fn spawn_pool_maintenance(pool: FtpPool, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if pool.is_closed() {
                break;
            }
            pool.reap_idle().await;
        }
    })
}

// ─── Lease guard ─────────────────────────────────────────────────────

/// A slot reserved for a connection being dialled. Gives the slot back
/// if the dial fails or the borrowing future is dropped mid-dial.
struct DialSlot<'a> {
    shared: &'a PoolShared,
    filled: bool,
}

impl Drop for DialSlot<'_> {
    fn drop(&mut self) {
        if !self.filled {
            let mut state = self.shared.lock();
            state.open = state.open.saturating_sub(1);
        }
    }
}

/// Slot accounting for one leased connection. Dropping it unsettled
/// counts the connection as discarded; the permit goes back either way.
struct Lease {
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
    settled: bool,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.shared.lock().leased -= 1;
        if !self.settled {
            self.shared.forget(1);
        }
    }
}

/// A connection on loan from the pool. Derefs to [`FtpSession`].
///
/// Hand it back with [`release`](Self::release). Dropping it without
/// releasing closes the connection.
pub struct PooledSession {
    session: FtpSession,
    lease: Lease,
}

impl PooledSession {
    /// Return the connection. Healthy sessions go back to the idle set;
    /// unhealthy ones are closed and their slot freed for a replacement.
    /// A session left outside its login directory counts as unhealthy.
    pub fn release(self, healthy: bool) {
        let PooledSession { session, mut lease } = self;
        // Relative paths must mean the same thing on every lease.
        let healthy = healthy && !session.is_broken() && session.cwd() == session.home();

        let rejected = {
            let mut state = lease.shared.lock();
            if healthy && !state.closed {
                log::debug!("FTP pool: returned {}", session.id());
                let mut session = session;
                session.touch();
                state.idle.push(session);
                None
            } else {
                Some(session)
            }
        };

        match rejected {
            None => lease.settled = true,
            Some(session) => {
                log::debug!("FTP pool: discarding {}", session.id());
                discard(session);
            }
        }
        // `lease` drops here: the permit is released after the session is
        // back in the idle set, so a woken waiter finds it.
    }

    /// Whether this connection served an earlier lease.
    pub fn is_reused(&self) -> bool {
        self.session.lease_count() > 1
    }
}

impl Deref for PooledSession {
    type Target = FtpSession;

    fn deref(&self) -> &FtpSession {
        &self.session
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut FtpSession {
        &mut self.session
    }
}

/// Close a session in the background when a runtime is available.
fn discard(session: FtpSession) {
    if session.is_broken() {
        return;
    }
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(session.quit());
    }
}

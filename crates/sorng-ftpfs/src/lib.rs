//! # SortOfRemote NG – FTP filesystem
//!
//! Filesystem-style FTP/FTPS client backed by a pool of reusable control
//! connections:
//!   • Bounded connection pool with fair leasing and stale-connection replacement
//!   • RFC 959 command/reply engine with multi-line replies and path quoting
//!   • MLSD/MLST fact parsing with LIST fallback, normalised into `FileRecord`
//!   • Passive / extended-passive / active data channels
//!   • Explicit and implicit FTPS via rustls

pub mod ftp;

pub use ftp::*;

//! # sorng-ftpfs: pooled FTP filesystem client
//!
//! Implements the FTP protocol (RFC 959) with the extensions needed for a
//! filesystem view of a remote server:
//! - **RFC 3659**: MLSD/MLST machine-readable listings
//! - **RFC 2389**: FEAT negotiation
//! - **RFC 2428**: EPSV / EPRT
//! - **RFC 4217**: AUTH TLS / FTPS (Explicit & Implicit)
//!
//! Architecture:
//! - `types`: config, file records, replies, pool statistics
//! - `error`: FTP-specific error type
//! - `protocol`: low-level command/reply codec and path quoting
//! - `connection`: TCP + TLS transport for the control channel
//! - `tls`: rustls connector, AUTH TLS upgrade, data-channel wrapping
//! - `session`: per-connection protocol engine (login, FEAT, capability, CWD)
//! - `transfer`: data channel negotiation (PASV/EPSV/PORT/EPRT)
//! - `mlst`: MLSD/MLST fact parser
//! - `parser`: free-form LIST parser (Unix / Windows)
//! - `directory`: list, stat, mkdir, rmdir, rename, delete, getwd
//! - `file_ops`: store / retrieve over async byte streams
//! - `pool`: bounded connection pool with lease guards
//! - `client`: public filesystem-style API with stale-connection retry

pub mod types;
pub mod error;
pub mod protocol;
pub mod connection;
pub mod tls;
pub mod session;
pub mod transfer;
pub mod mlst;
pub mod parser;
pub mod directory;
pub mod file_ops;
pub mod pool;
pub mod client;

pub use client::FtpClient;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use pool::{spawn_pool_maintenance, FtpPool, PooledSession};
pub use session::FtpSession;
pub use types::*;

//! File-level operations: store and retrieve over async byte streams.
//!
//! The caller supplies any `AsyncRead` / `AsyncWrite`; bytes are pumped
//! through a fixed buffer with an idle timeout per chunk, so a stalled
//! server fails the transfer instead of hanging the connection.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::session::{FtpSession, TransferStart};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Default chunk size for streaming transfers (64 KiB).
const DEFAULT_CHUNK: usize = 65_536;

impl FtpSession {
    // ─── DOWNLOAD (RETR) ─────────────────────────────────────────

    /// Download `path` into `writer`. Returns the number of bytes written.
    pub async fn retrieve<W>(&mut self, path: &str, writer: &mut W) -> FtpResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut stream = match self.begin_transfer(&format!("RETR {}", path)).await? {
            TransferStart::Stream(s) => s,
            TransferStart::Completed(_) => return Ok(0),
        };

        let copied = pump(&mut stream, &mut *writer, self.config().data_timeout()).await;
        drop(stream);
        let n = match copied {
            Ok(n) => n,
            Err(e) => {
                self.mark_broken();
                return Err(e);
            }
        };
        if let Err(e) = writer.flush().await {
            self.mark_broken();
            return Err(FtpError::io_error(format!("Flushing download of {}: {}", path, e)));
        }

        self.finish_transfer().await?;
        log::debug!("[{}] RETR {} ({} bytes)", self.id(), path, n);
        Ok(n)
    }

    // ─── UPLOAD (STOR) ───────────────────────────────────────────

    /// Upload everything `reader` yields to `path`, replacing any existing
    /// file. Returns the number of bytes sent.
    pub async fn store<R>(&mut self, path: &str, reader: &mut R) -> FtpResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut stream = match self.begin_transfer(&format!("STOR {}", path)).await? {
            TransferStart::Stream(s) => s,
            TransferStart::Completed(_) => return Ok(0),
        };

        let data_timeout = self.config().data_timeout();
        let copied = pump(reader, &mut stream, data_timeout).await;
        let n = match copied {
            Ok(n) => n,
            Err(e) => {
                self.mark_broken();
                return Err(e);
            }
        };
        // EOF on the data connection is what tells the server we are done.
        match timeout(data_timeout, stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.mark_broken();
                return Err(FtpError::transfer_failed(format!("Closing upload of {}: {}", path, e)));
            }
            Err(_) => {
                self.mark_broken();
                return Err(FtpError::timeout(format!("Closing upload of {} timed out", path)));
            }
        }
        drop(stream);

        self.finish_transfer().await?;
        log::debug!("[{}] STOR {} ({} bytes)", self.id(), path, n);
        Ok(n)
    }
}

/// Copy `reader` into `writer` until EOF, failing when a single read
/// stalls for longer than `idle`.
pub(crate) async fn pump<R, W>(reader: &mut R, writer: &mut W, idle: Duration) -> FtpResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; DEFAULT_CHUNK];
    let mut total = 0u64;
    loop {
        let n = timeout(idle, reader.read(&mut buf))
            .await
            .map_err(|_| FtpError::timeout(format!("Transfer stalled for {}s", idle.as_secs())))?
            .map_err(|e| FtpError::transfer_failed(format!("Transfer read failed: {}", e)))?;
        if n == 0 {
            return Ok(total);
        }
        timeout(idle, writer.write_all(&buf[..n]))
            .await
            .map_err(|_| FtpError::timeout(format!("Transfer stalled for {}s", idle.as_secs())))?
            .map_err(|e| FtpError::transfer_failed(format!("Transfer write failed: {}", e)))?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::error::FtpErrorKind;

    #[tokio::test]
    async fn pump_copies_everything() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = &data[..];
        let mut out: Vec<u8> = Vec::new();
        let n = pump(&mut reader, &mut out, Duration::from_secs(1)).await.unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn pump_times_out_on_stalled_reader() {
        let (mut stalled, _keep_open) = tokio::io::duplex(64);
        let mut out: Vec<u8> = Vec::new();
        let err = pump(&mut stalled, &mut out, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Timeout);
    }
}

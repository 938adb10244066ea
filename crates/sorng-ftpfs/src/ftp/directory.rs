//! Directory operations: list, stat, mkdir, rmdir, rename, delete, getwd.
//!
//! Listing tries MLSD and stat tries MLST on first use. Each remembers its
//! own answer per connection; a "not understood" reply switches that one
//! operation to LIST for good.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::file_ops::pump;
use crate::ftp::mlst;
use crate::ftp::parser;
use crate::ftp::protocol::{codes, parse_quoted_path};
use crate::ftp::session::{is_not_understood, FtpSession, TransferStart};
use crate::ftp::types::*;

impl FtpSession {
    // ─── LIST / MLSD ─────────────────────────────────────────────

    /// List the children of `path` (empty for the working directory).
    ///
    /// `.` and `..` are never returned. A line that fails to parse aborts
    /// the listing unless `skip_unparsable` is set, in which case it is
    /// logged and dropped.
    pub async fn list(&mut self, path: &str, skip_unparsable: bool) -> FtpResult<Vec<FileRecord>> {
        if self.listing_strategy() != Some(ListingStrategy::Freeform) {
            match self.read_listing(&with_arg("MLSD", path)).await {
                Ok(body) => {
                    self.set_listing_strategy(ListingStrategy::Structured);
                    return collect_records(&body, skip_unparsable, |line| {
                        mlst::parse_entry(line, true)
                    });
                }
                Err(e) if first_attempt_rejected(self.listing_strategy(), &e) => {
                    log::info!("[{}] MLSD not understood, falling back to LIST", self.id());
                    self.set_listing_strategy(ListingStrategy::Freeform);
                }
                Err(e) => return Err(e),
            }
        }

        let body = self.read_listing(&with_arg("LIST", path)).await?;
        let records = collect_records(&body, skip_unparsable, parser::parse_line)?;
        Ok(records
            .into_iter()
            .filter(|r| r.name != "." && r.name != "..")
            .collect())
    }

    /// Metadata for a single path.
    pub async fn stat(&mut self, path: &str) -> FtpResult<FileRecord> {
        if self.stat_strategy() != Some(ListingStrategy::Freeform) {
            let resp = self.send_command(&with_arg("MLST", path)).await?;
            if resp.code == codes::FILE_ACTION_OK {
                self.set_stat_strategy(ListingStrategy::Structured);
                let line = mlst::fact_line(&resp)?;
                return mlst::parse_entry(&line, false)?.ok_or_else(|| {
                    FtpError::not_found(format!("MLST returned no entry for {}", path))
                });
            }
            let err = FtpError::from_reply(resp.code, &resp.text());
            if !first_attempt_rejected(self.stat_strategy(), &err) {
                return Err(err);
            }
            log::info!("[{}] MLST not understood, falling back to LIST", self.id());
            self.set_stat_strategy(ListingStrategy::Freeform);
        }
        self.stat_from_parent(path).await
    }

    /// Find `path` in a LIST of its parent directory.
    async fn stat_from_parent(&mut self, path: &str) -> FtpResult<FileRecord> {
        let (parent, name) = split_parent(path).ok_or_else(|| {
            FtpError::unsupported(format!("Cannot stat '{}' without MLST support", path))
        })?;
        let body = self.read_listing(&with_arg("LIST", parent)).await?;
        for line in body.lines() {
            match parser::parse_line(line) {
                Ok(Some(rec)) if rec.name == name => return Ok(rec),
                Ok(_) => {}
                Err(e) => log::warn!("[{}] skipping LIST line: {}", self.id(), e),
            }
        }
        Err(FtpError::not_found(format!("{}: no such file or directory", path)))
    }

    /// Run a listing command and collect the data connection as text.
    async fn read_listing(&mut self, cmd: &str) -> FtpResult<String> {
        let mut stream = match self.begin_transfer(cmd).await? {
            TransferStart::Stream(s) => s,
            TransferStart::Completed(_) => return Ok(String::new()),
        };
        let mut buf: Vec<u8> = Vec::new();
        let copied = pump(&mut stream, &mut buf, self.config().data_timeout()).await;
        drop(stream);
        if let Err(e) = copied {
            self.mark_broken();
            return Err(e);
        }
        self.finish_transfer().await?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    // ─── MKD / RMD ───────────────────────────────────────────────

    /// Create a directory and return the path the server reports for it.
    pub async fn mkdir(&mut self, path: &str) -> FtpResult<String> {
        let resp = self
            .send_command_expected(codes::PATH_CREATED, &format!("MKD {}", path))
            .await?;
        // Parse the created path from `257 "/new/dir" created`.
        Ok(parse_quoted_path(&resp.text())?.unwrap_or_else(|| path.to_string()))
    }

    /// Remove an empty directory.
    pub async fn rmdir(&mut self, path: &str) -> FtpResult<()> {
        self.send_command_expected(codes::FILE_ACTION_OK, &format!("RMD {}", path))
            .await?;
        Ok(())
    }

    // ─── DELE / RNFR+RNTO ────────────────────────────────────────

    pub async fn delete(&mut self, path: &str) -> FtpResult<()> {
        self.send_command_expected(codes::FILE_ACTION_OK, &format!("DELE {}", path))
            .await?;
        Ok(())
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> FtpResult<()> {
        self.send_command_expected(codes::PENDING_FURTHER_INFO, &format!("RNFR {}", from))
            .await?;
        self.send_command_expected(codes::FILE_ACTION_OK, &format!("RNTO {}", to))
            .await?;
        Ok(())
    }

    // ─── PWD ─────────────────────────────────────────────────────

    /// Working directory as reported by the server.
    pub async fn getwd(&mut self) -> FtpResult<String> {
        self.pwd().await
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

/// The first structured attempt for a strategy met a "not understood" reply.
fn first_attempt_rejected(decided: Option<ListingStrategy>, err: &FtpError) -> bool {
    decided.is_none() && err.code.map_or(false, is_not_understood)
}

fn with_arg(verb: &str, arg: &str) -> String {
    if arg.is_empty() {
        verb.to_string()
    } else {
        format!("{} {}", verb, arg)
    }
}

fn collect_records<F>(body: &str, skip_unparsable: bool, mut parse: F) -> FtpResult<Vec<FileRecord>>
where
    F: FnMut(&str) -> FtpResult<Option<FileRecord>>,
{
    let mut records = Vec::new();
    for line in body.lines().map(|l| l.trim_end_matches('\r')) {
        if line.trim().is_empty() {
            continue;
        }
        match parse(line) {
            Ok(Some(rec)) => records.push(rec),
            Ok(None) => {}
            Err(e) if skip_unparsable && e.is_parse_error() => {
                log::warn!("Skipping unparsable listing line: {}", e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}

/// Split a path into the directory to list and the entry name to find.
/// Returns `None` for the root, which has no parent listing.
fn split_parent(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some(("/", &trimmed[1..])),
        Some(i) => Some((&trimmed[..i], &trimmed[i + 1..])),
        None => Some(("", trimmed)),
    }
}

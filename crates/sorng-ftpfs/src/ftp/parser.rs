//! Free-form LIST response parser.
//!
//! Used when the server does not understand MLSD/MLST. Supports two formats:
//! 1. **Unix-style** (`ls -l`): `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//! 2. **Windows/IIS-style**: `01-01-26  12:00AM       1234 file.txt`
//!
//! Both produce the same [`FileRecord`] as the MLST parser. Dates without
//! a year are placed in the current year, or the previous one when that
//! would put them in the future.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{FileKind, FileRecord};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref UNIX_RE: Regex = Regex::new(
        r"(?x)
        ^([bcdlps-][rwxsStT-]{9})[+@.]?\s+   # permissions, optional ACL/xattr marker
        (\d+)\s+                             # link count
        (\S+)\s+                             # owner
        (?:(\S+)\s+)?                        # group (some servers omit it)
        (\d+)\s+                             # size
        ([A-Za-z]{3})\s+                     # month
        (\d{1,2})\s+                         # day
        (\d{1,2}:\d{2}|\d{4})\s+             # time or year
        (.+)$                                # filename (possibly with -> target)
        "
    )
    .unwrap();
    static ref WINDOWS_RE: Regex = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-\d{2,4})\s+            # date
        (\d{1,2}:\d{2}\s*(?:[AaPp][Mm])?)\s+ # time
        (<DIR>|\d+)\s+                       # size or <DIR>
        (.+)$                                # filename
        "
    )
    .unwrap();
    static ref TOTAL_RE: Regex = Regex::new(r"^total\s+\d+").unwrap();
}

/// Parse one LIST line against the current clock.
///
/// Returns `Ok(None)` for lines that carry no entry (blank, `total N`).
pub fn parse_line(line: &str) -> FtpResult<Option<FileRecord>> {
    parse_line_at(line, Utc::now())
}

/// Parse one LIST line, resolving year-less dates relative to `now`.
pub fn parse_line_at(line: &str, now: DateTime<Utc>) -> FtpResult<Option<FileRecord>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || TOTAL_RE.is_match(line) {
        return Ok(None);
    }

    if let Some(rec) = parse_unix(line, now)? {
        return Ok(Some(rec));
    }
    if let Some(rec) = parse_windows(line)? {
        return Ok(Some(rec));
    }

    Err(FtpError::malformed_entry(format!(
        "Unrecognised LIST line: {}",
        line
    )))
}

// ─── Unix-style parser ───────────────────────────────────────────────

/// Parse a Unix `ls -l` line:
/// ```text
/// drwxr-xr-x   2 user group  4096 Jan  1 12:00 dirname
/// -rw-r--r--   1 user group  1234 Jan  1  2025 file.txt
/// lrwxrwxrwx   1 user group    42 Jan  1 12:00 link -> target
/// ```
fn parse_unix(line: &str, now: DateTime<Utc>) -> FtpResult<Option<FileRecord>> {
    let caps = match UNIX_RE.captures(line) {
        Some(c) => c,
        None => return Ok(None),
    };

    let perms = &caps[1];
    let size = caps[5]
        .parse::<u64>()
        .map_err(|_| FtpError::malformed_entry(format!("Bad size in LIST line: {}", line)))?;
    let modified = parse_unix_date(&caps[6], &caps[7], &caps[8], now).ok_or_else(|| {
        FtpError::malformed_entry(format!("Bad date in LIST line: {}", line))
    })?;
    let name_raw = &caps[9];

    let kind = match perms.as_bytes()[0] {
        b'd' => FileKind::Directory,
        b'l' => FileKind::Symlink,
        _ => FileKind::Regular,
    };

    let name = if kind == FileKind::Symlink {
        name_raw
            .split_once(" -> ")
            .map(|(n, _)| n)
            .unwrap_or(name_raw)
    } else {
        name_raw
    };

    Ok(Some(FileRecord {
        name: name.to_string(),
        size: Some(size),
        modified,
        mode: mode_from_symbolic(&perms[1..]),
        kind,
        raw: line.to_string(),
    }))
}

/// Permission bits from the nine `rwx` characters of `ls -l`.
fn mode_from_symbolic(rwx: &str) -> u32 {
    let b = rwx.as_bytes();
    let mut mode = 0u32;
    for (i, shift) in [(0usize, 6u32), (3, 3), (6, 0)] {
        if b[i] == b'r' {
            mode |= 0o4 << shift;
        }
        if b[i + 1] == b'w' {
            mode |= 0o2 << shift;
        }
        match b[i + 2] {
            b'x' => mode |= 0o1 << shift,
            b's' | b't' => mode |= 0o1 << shift | special_bit(i),
            b'S' | b'T' => mode |= special_bit(i),
            _ => {}
        }
    }
    mode
}

/// setuid, setgid or sticky, depending on the triplet.
fn special_bit(triplet: usize) -> u32 {
    match triplet {
        0 => 0o4000,
        3 => 0o2000,
        _ => 0o1000,
    }
}

fn parse_month(s: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let lower = s.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lower)
        .map(|i| i as u32 + 1)
}

/// Parse the date portion: "Jan  1 12:00" or "Jan  1  2025".
fn parse_unix_date(month: &str, day: &str, time_or_year: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let month = parse_month(month)?;
    let day = day.parse::<u32>().ok()?;

    if let Some((h, m)) = time_or_year.split_once(':') {
        let (h, m) = (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?);
        let at = |year: i32| {
            NaiveDate::from_ymd_opt(year, month, day)
                .and_then(|d| d.and_hms_opt(h, m, 0))
                .map(|dt| dt.and_utc())
        };
        // No year given: this year unless that lies in the future.
        match at(now.year()) {
            Some(dt) if dt <= now => Some(dt),
            _ => at(now.year() - 1),
        }
    } else {
        let year = time_or_year.parse::<i32>().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }
}

// ─── Windows-style parser ────────────────────────────────────────────

/// Parse Windows / IIS style line:
/// ```text
/// 01-01-26  12:00AM       1234 file.txt
/// 01-01-26  12:00PM      <DIR> Directory Name
/// ```
fn parse_windows(line: &str) -> FtpResult<Option<FileRecord>> {
    let caps = match WINDOWS_RE.captures(line) {
        Some(c) => c,
        None => return Ok(None),
    };

    let modified = parse_windows_date(&caps[1], &caps[2]).ok_or_else(|| {
        FtpError::malformed_entry(format!("Bad date in LIST line: {}", line))
    })?;

    let (kind, size) = if &caps[3] == "<DIR>" {
        (FileKind::Directory, None)
    } else {
        let size = caps[3]
            .parse::<u64>()
            .map_err(|_| FtpError::malformed_entry(format!("Bad size in LIST line: {}", line)))?;
        (FileKind::Regular, Some(size))
    };

    Ok(Some(FileRecord {
        name: caps[4].to_string(),
        size,
        modified,
        // IIS reports no permissions.
        mode: 0o400,
        kind,
        raw: line.to_string(),
    }))
}

fn parse_windows_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let time: String = time.split_whitespace().collect::<Vec<_>>().join("").to_uppercase();
    let combined = format!("{} {}", date, time);
    let formats = [
        "%m-%d-%y %I:%M%p",
        "%m-%d-%y %H:%M",
        "%m-%d-%Y %I:%M%p",
        "%m-%d-%Y %H:%M",
    ];
    formats
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(&combined, f).ok())
        .map(|dt| dt.and_utc())
}

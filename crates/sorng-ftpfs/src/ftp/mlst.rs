//! MLSD / MLST fact parser (RFC 3659 §7).
//!
//! An entry looks like:
//! ```text
//! type=file;size=12;modify=20150216084148;UNIX.mode=0644;unique=1000004g1187ec7; lorem.txt
//! ```
//! The line is tokenised by a three-state machine instead of splitting on
//! `;`, so filenames containing `;`, `=` or runs of spaces survive intact.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{FileKind, FileRecord, FtpResponse};
use chrono::{DateTime, NaiveDate, Utc};

/// Tokeniser position inside an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FactName,
    FactValue,
    Filename,
}

/// Facts this parser understands, lowercased. Anything else is ignored.
#[derive(Debug, Default)]
struct Facts {
    kind: Option<String>,
    unix_mode: Option<String>,
    perm: Option<String>,
    size: Option<String>,
    sizd: Option<String>,
    modify: Option<String>,
}

impl Facts {
    fn set(&mut self, key: &str, value: String) {
        let slot = match key {
            "type" => &mut self.kind,
            "unix.mode" => &mut self.unix_mode,
            "perm" => &mut self.perm,
            "size" => &mut self.size,
            "sizd" => &mut self.sizd,
            "modify" => &mut self.modify,
            _ => return,
        };
        *slot = Some(value);
    }
}

/// Split an entry into its facts and the raw filename.
fn tokenize(entry: &str) -> FtpResult<(Facts, &str)> {
    let mut facts = Facts::default();
    let mut state = State::FactName;
    // `key=` of the fact being read, and where the current token starts.
    let mut key: &str = "";
    let mut start = 0usize;
    let bytes = entry.as_bytes();

    for (i, c) in entry.char_indices() {
        match (c, state) {
            ('=', State::FactName) => {
                key = &entry[start..=i];
                start = i + 1;
                state = State::FactValue;
            }
            (';', State::FactValue) => {
                let name = key
                    .strip_suffix('=')
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| malformed(entry))?;
                facts.set(&name.to_lowercase(), entry[start..i].to_lowercase());
                state = if bytes.get(i + 1) == Some(&b' ') {
                    State::Filename
                } else {
                    State::FactName
                };
                start = i + 1;
            }
            _ => {}
        }
    }

    // `start` sits on the separating space; the name follows it.
    if state != State::Filename || start + 1 >= entry.len() {
        return Err(malformed(entry));
    }
    Ok((facts, &entry[start + 1..]))
}

/// Parse one MLSD line or MLST fact line into a [`FileRecord`].
///
/// With `skip_self_parent`, `cdir`/`pdir` entries and the literal names
/// `.` and `..` yield `Ok(None)`.
pub fn parse_entry(entry: &str, skip_self_parent: bool) -> FtpResult<Option<FileRecord>> {
    let (facts, filename) = tokenize(entry)?;

    let typ = facts.kind.as_deref().ok_or_else(|| incomplete(entry))?;
    let name = base_name(filename);

    if skip_self_parent && (typ == "cdir" || typ == "pdir" || name == "." || name == "..") {
        return Ok(None);
    }

    let mode = match (&facts.unix_mode, &facts.perm) {
        (Some(m), _) => u32::from_str_radix(m, 8).map_err(|_| malformed(entry))? & 0o7777,
        (None, Some(perm)) => mode_from_perm(perm),
        (None, None) => 0o400,
    };

    let kind = if typ == "dir" || typ == "cdir" || typ == "pdir" {
        FileKind::Directory
    } else if typ.starts_with("os.unix=slink") || typ.starts_with("os.unix=symlink") {
        // Whether the target is a file or a directory is unknowable here.
        FileKind::Symlink
    } else {
        FileKind::Regular
    };

    let size_fact = match (&facts.size, &facts.sizd) {
        (Some(s), _) => Some(s),
        (None, Some(s)) if kind == FileKind::Directory => Some(s),
        _ if typ == "file" => return Err(incomplete(entry)),
        _ => None,
    };
    let size = size_fact
        .map(|s| s.parse::<u64>().map_err(|_| malformed(entry)))
        .transpose()?;

    let modify = facts.modify.as_deref().ok_or_else(|| incomplete(entry))?;
    let modified = parse_modify(modify).ok_or_else(|| malformed(entry))?;

    Ok(Some(FileRecord {
        name,
        size,
        modified,
        mode,
        kind,
        raw: entry.to_string(),
    }))
}

/// Approximate permission bits from an RFC 3659 §7.5.5 `perm` fact.
fn mode_from_perm(perm: &str) -> u32 {
    perm.chars().fold(0, |mode, c| match c {
        // Any of these means we may modify the entry.
        'a' | 'd' | 'c' | 'f' | 'm' | 'p' | 'w' => mode | 0o200,
        // Listable directory: readable and enterable.
        'l' => mode | 0o500,
        'r' => mode | 0o400,
        _ => mode,
    })
}

/// `YYYYMMDDHHMMSS[.sss]`, always UTC.
fn parse_modify(value: &str) -> Option<DateTime<Utc>> {
    let (digits, fraction) = match value.split_once('.') {
        Some((d, f)) => (d, Some(f)),
        None => (value, None),
    };
    if digits.len() != 14 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if let Some(f) = fraction {
        if f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    let num = |r: std::ops::Range<usize>| digits[r].parse::<u32>().ok();
    let date = NaiveDate::from_ymd_opt(num(0..4)? as i32, num(4..6)?, num(6..8)?)?;
    let dt = date.and_hms_opt(num(8..10)?, num(10..12)?, num(12..14)?)?;
    Some(dt.and_utc())
}

/// Last path segment, the way servers that return full paths need it.
fn base_name(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.is_empty() { ".".into() } else { "/".into() };
    }
    match trimmed.rfind('/') {
        Some(i) => trimmed[i + 1..].to_string(),
        None => trimmed.to_string(),
    }
}

/// Pull the fact line out of a `250` MLST reply:
/// ```text
/// 250- Listing file.txt
///  type=file;size=12;modify=20150216084148; /file.txt
/// 250 End
/// ```
pub fn fact_line(resp: &FtpResponse) -> FtpResult<String> {
    if resp.lines.len() < 3 {
        return Err(FtpError::protocol_error(format!(
            "MLST reply carries no fact line: {}",
            resp.text()
        ))
        .with_reply(resp.text()));
    }
    let body = &resp.lines[1..resp.lines.len() - 1];
    Ok(body
        .iter()
        .map(|l| l.trim_start_matches(' '))
        .collect::<Vec<_>>()
        .join(""))
}

fn malformed(entry: &str) -> FtpError {
    FtpError::malformed_entry(format!("Failed parsing MLST entry: {}", entry))
}

fn incomplete(entry: &str) -> FtpError {
    FtpError::incomplete_entry(format!("MLST entry incomplete: {}", entry))
}

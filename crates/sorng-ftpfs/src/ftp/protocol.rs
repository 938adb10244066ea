//! Low-level FTP command/response codec (RFC 959 §4).
//!
//! Handles:
//! - Sending FTP commands terminated with `\r\n`
//! - Reading single-line and multi-line replies
//! - Parsing the 3-digit reply code
//! - Quoting and unquoting paths embedded in replies (`257 "a""b"`)

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::tls::TlsStream;
use crate::ftp::types::FtpResponse;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Reply codes the engine checks for by value.
pub mod codes {
    pub const COMMAND_OK: u16 = 200;
    pub const SYSTEM_STATUS: u16 = 211;
    pub const SYSTEM_TYPE: u16 = 215;
    pub const SERVICE_READY: u16 = 220;
    pub const PASSIVE: u16 = 227;
    pub const EXTENDED_PASSIVE: u16 = 229;
    pub const LOGGED_IN: u16 = 230;
    pub const AUTH_OK: u16 = 234;
    pub const FILE_ACTION_OK: u16 = 250;
    pub const PATH_CREATED: u16 = 257;
    pub const NEED_PASSWORD: u16 = 331;
    pub const PENDING_FURTHER_INFO: u16 = 350;
    pub const SERVICE_CLOSING: u16 = 421;
    pub const SYNTAX_ERROR: u16 = 500;
    pub const NOT_IMPLEMENTED: u16 = 502;
}

/// Abstraction over plain TCP or TLS-wrapped read half.
pub enum ReadHalf {
    Plain(BufReader<OwnedReadHalf>),
    Tls(BufReader<tokio::io::ReadHalf<TlsStream>>),
}

/// Abstraction over plain TCP or TLS-wrapped write half.
pub enum WriteHalf {
    Plain(OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<TlsStream>),
}

/// The FTP command/response codec operating on split halves.
pub struct FtpCodec {
    pub reader: ReadHalf,
    pub writer: WriteHalf,
    bytes_read: u64,
}

impl FtpCodec {
    /// Create a codec from a plain TCP stream.
    pub fn from_tcp(stream: tokio::net::TcpStream) -> Self {
        let (rd, wr) = stream.into_split();
        Self {
            reader: ReadHalf::Plain(BufReader::new(rd)),
            writer: WriteHalf::Plain(wr),
            bytes_read: 0,
        }
    }

    /// Create a codec from a TLS-wrapped TCP stream.
    pub fn from_tls(stream: TlsStream) -> Self {
        let (rd, wr) = tokio::io::split(stream);
        Self {
            reader: ReadHalf::Tls(BufReader::new(rd)),
            writer: WriteHalf::Tls(wr),
            bytes_read: 0,
        }
    }

    /// Total bytes received on the control channel so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Send a raw FTP command (without trailing CRLF; we add it).
    pub async fn send_command(&mut self, cmd: &str) -> FtpResult<()> {
        if cmd.contains('\r') || cmd.contains('\n') {
            return Err(FtpError::invalid_config(format!(
                "Command must be a single line: {:?}",
                cmd
            )));
        }
        let line = format!("{}\r\n", cmd);
        match &mut self.writer {
            WriteHalf::Plain(w) => {
                w.write_all(line.as_bytes()).await?;
                w.flush().await?;
            }
            WriteHalf::Tls(w) => {
                w.write_all(line.as_bytes()).await?;
                w.flush().await?;
            }
        }
        if cmd.get(..5).map_or(false, |p| p.eq_ignore_ascii_case("PASS ")) {
            log::trace!(">>> PASS ****");
        } else {
            log::trace!(">>> {}", cmd);
        }
        Ok(())
    }

    /// Read a single line from the control channel, CRLF stripped.
    async fn read_line_raw(&mut self) -> FtpResult<String> {
        let mut buf = Vec::new();
        let n = match &mut self.reader {
            ReadHalf::Plain(r) => r.read_until(b'\n', &mut buf).await?,
            ReadHalf::Tls(r) => r.read_until(b'\n', &mut buf).await?,
        };
        if n == 0 {
            return Err(FtpError::disconnected("Server closed connection"));
        }
        self.bytes_read += n as u64;
        let line = String::from_utf8_lossy(&buf);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read a complete FTP response (possibly multi-line).
    ///
    /// Multi-line responses look like:
    /// ```text
    /// 220-Welcome to my FTP server
    /// 220-This is line 2
    /// 220 End of greeting
    /// ```
    /// Lines in between need not carry the code at all.
    pub async fn read_response(&mut self) -> FtpResult<FtpResponse> {
        let first = self.read_line_raw().await?;
        let code = parse_code(&first)?;
        let mut lines = vec![first];

        // "NNN-" means more lines follow until "NNN " is seen.
        let is_multi = lines[0].as_bytes().get(3) == Some(&b'-');
        if is_multi {
            let terminator = format!("{} ", code);
            let bare = code.to_string();
            loop {
                let next = self.read_line_raw().await.map_err(|e| {
                    FtpError::protocol_error(format!(
                        "Multi-line {} reply not terminated: {}",
                        code, e.message
                    ))
                    .with_reply(lines.join("\n"))
                })?;
                let done = next.starts_with(&terminator) || next == bare;
                lines.push(next);
                if done {
                    break;
                }
            }
        }

        let resp = FtpResponse { code, lines };
        log::trace!("<<< {}", resp.lines.last().map(String::as_str).unwrap_or(""));
        Ok(resp)
    }

    /// Send a command and return the response.
    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        self.send_command(cmd).await?;
        self.read_response().await
    }

    /// Shut down the write side so the peer sees EOF.
    pub async fn shutdown(&mut self) -> FtpResult<()> {
        match &mut self.writer {
            WriteHalf::Plain(w) => w.shutdown().await?,
            WriteHalf::Tls(w) => w.shutdown().await?,
        }
        Ok(())
    }
}

/// Parse the 3-digit reply code from the start of a line.
fn parse_code(line: &str) -> FtpResult<u16> {
    let digits = line
        .get(..3)
        .filter(|d| d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| {
            FtpError::protocol_error(format!("Invalid reply code in: '{}'", line)).with_reply(line)
        })?;
    let sep = line.as_bytes().get(3);
    if !matches!(sep, None | Some(b' ') | Some(b'-')) {
        return Err(
            FtpError::protocol_error(format!("Invalid reply code in: '{}'", line)).with_reply(line),
        );
    }
    digits
        .parse::<u16>()
        .map_err(|_| FtpError::protocol_error(format!("Invalid reply code in: '{}'", line)))
}

// ─── Path quoting ────────────────────────────────────────────────────

/// Embed a path in a reply the RFC 959 way: surrounded by `"` with every
/// internal `"` doubled.
pub fn quote_path(path: &str) -> String {
    format!("\"{}\"", path.replace('"', "\"\""))
}

/// Extract the quoted path from a reply such as
/// `257 "/a ""quoted"" dir" created`.
///
/// Returns `Ok(None)` when the text holds no quote at all; an opening
/// quote without its closing partner is a protocol error.
pub fn parse_quoted_path(text: &str) -> FtpResult<Option<String>> {
    let start = match text.find('"') {
        Some(i) => i + 1,
        None => return Ok(None),
    };
    let mut out = String::new();
    let mut chars = text[start..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                out.push('"');
            } else {
                return Ok(Some(out));
            }
        } else {
            out.push(c);
        }
    }
    Err(FtpError::protocol_error(format!("Unterminated quoted path in reply: {}", text))
        .with_reply(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::{TcpListener, TcpStream};

    async fn codec_with_server_bytes(bytes: &'static [u8]) -> FtpCodec {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(bytes).await.unwrap();
            // Keep the socket open until the client has read everything.
            let mut sink = [0u8; 64];
            let _ = tokio::io::AsyncReadExt::read(&mut sock, &mut sink).await;
        });
        FtpCodec::from_tcp(TcpStream::connect(addr).await.unwrap())
    }

    #[test]
    fn quote_round_trip() {
        let path = r#"/dir-with-"quote"#;
        let quoted = quote_path(path);
        assert_eq!(quoted, r#""/dir-with-""quote""#);
        let reply = format!("257 {} created", quoted);
        assert_eq!(parse_quoted_path(&reply).unwrap().as_deref(), Some(path));
    }

    #[test]
    fn unquote_edge_cases() {
        assert_eq!(parse_quoted_path("257 created").unwrap(), None);
        assert_eq!(parse_quoted_path(r#"257 """" ok"#).unwrap().as_deref(), Some("\""));
        assert_eq!(parse_quoted_path(r#"257 "" ok"#).unwrap().as_deref(), Some(""));
        let err = parse_quoted_path(r#"257 "/never/closed"#).unwrap_err();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::ProtocolError);
    }

    #[test]
    fn reply_code_parsing() {
        assert_eq!(parse_code("220 ready").unwrap(), 220);
        assert_eq!(parse_code("211-Features").unwrap(), 211);
        assert_eq!(parse_code("226").unwrap(), 226);
        assert!(parse_code("22").is_err());
        assert!(parse_code("abc hello").is_err());
        assert!(parse_code("2200 nope").is_err());
    }

    #[tokio::test]
    async fn reads_single_and_multi_line_replies() {
        let mut codec = codec_with_server_bytes(
            b"220 hello\r\n211-Features:\r\n MLST size*;\r\n UTF8\r\n211 End\r\n",
        )
        .await;
        let banner = codec.read_response().await.unwrap();
        assert_eq!(banner.code, 220);
        assert_eq!(banner.lines, vec!["220 hello".to_string()]);

        let feat = codec.read_response().await.unwrap();
        assert_eq!(feat.code, 211);
        assert_eq!(feat.lines.len(), 4);
        assert_eq!(feat.lines[3], "211 End");
        assert!(codec.bytes_read() > 0);
    }

    #[tokio::test]
    async fn multi_line_reply_ignores_other_codes_inside() {
        let mut codec =
            codec_with_server_bytes(b"250-Listing\r\n250-x\r\n200 not the end\r\n250 End\r\n").await;
        let resp = codec.read_response().await.unwrap();
        assert_eq!(resp.code, 250);
        assert_eq!(resp.lines.len(), 4);
    }

    #[tokio::test]
    async fn truncated_multi_line_reply_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"211-Features:\r\n UTF8\r\n").await.unwrap();
        });
        let mut codec = FtpCodec::from_tcp(TcpStream::connect(addr).await.unwrap());
        let err = codec.read_response().await.unwrap_err();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::ProtocolError);
        assert!(err.raw_reply.unwrap().contains("211-Features:"));
    }

    #[tokio::test]
    async fn rejects_commands_with_line_breaks() {
        let mut codec = codec_with_server_bytes(b"").await;
        assert!(codec.send_command("DELE a\r\nDELE b").await.is_err());
    }
}

//! In-process FTP server over an in-memory filesystem, for integration tests.
//!
//! Supports login, FEAT, PWD/CWD (with RFC 959 quote doubling), MKD/RMD,
//! DELE, RNFR/RNTO, PASV/EPSV, PORT/EPRT, MLSD/MLST (switchable), LIST,
//! STOR and RETR. Counts connections and can drop every control connection
//! on demand.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use sorng_ftpfs::protocol::quote_path;
use sorng_ftpfs::FtpConfig;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const USER: &str = "tester";
pub const PASS: &str = "s3cret";

#[derive(Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

struct State {
    fs: Mutex<BTreeMap<String, Node>>,
    commands: Mutex<Vec<String>>,
    mtime: DateTime<Utc>,
    mlst: AtomicBool,
    quit_silent: AtomicBool,
    listing_delay_ms: AtomicU64,
    active: AtomicUsize,
    max_active: AtomicUsize,
    total: AtomicUsize,
    kill: watch::Sender<u64>,
    notice: watch::Sender<u64>,
}

pub struct MockServer {
    addr: SocketAddr,
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Minute precision so LIST and MLSD agree.
        let ts = Utc::now().timestamp() - 3600;
        let mtime = Utc.timestamp_opt(ts - ts % 60, 0).unwrap();

        let mut fs = BTreeMap::new();
        fs.insert("/".to_string(), Node::Dir);
        let (kill, _) = watch::channel(0u64);
        let (notice, _) = watch::channel(0u64);
        let state = Arc::new(State {
            fs: Mutex::new(fs),
            commands: Mutex::new(Vec::new()),
            mtime,
            mlst: AtomicBool::new(true),
            quit_silent: AtomicBool::new(false),
            listing_delay_ms: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            kill,
            notice,
        });

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => break,
                };
                let state = accept_state.clone();
                let kill = state.kill.subscribe();
                let notice = state.notice.subscribe();
                tokio::spawn(async move {
                    let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
                    state.max_active.fetch_max(now, Ordering::SeqCst);
                    state.total.fetch_add(1, Ordering::SeqCst);
                    let _ = Control::new(state.clone(), stream, kill, notice).run().await;
                    state.active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self { addr, state, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Client config pointing at this server with short timeouts.
    pub fn config(&self) -> FtpConfig {
        let mut cfg = FtpConfig::new("127.0.0.1", USER, PASS);
        cfg.port = self.port();
        cfg.connect_timeout_sec = 5;
        cfg.command_timeout_sec = 5;
        cfg.borrow_timeout_sec = 5;
        cfg.data_timeout_sec = 5;
        cfg
    }

    // ── Filesystem ──────────────────────────────────────────────

    pub fn add_dir(&self, path: &str) {
        self.state.fs.lock().unwrap().insert(path.to_string(), Node::Dir);
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.state
            .fs
            .lock()
            .unwrap()
            .insert(path.to_string(), Node::File(data.to_vec()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.fs.lock().unwrap().get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.fs.lock().unwrap().contains_key(path)
    }

    pub fn mtime(&self) -> DateTime<Utc> {
        self.state.mtime
    }

    // ── Behaviour ───────────────────────────────────────────────

    pub fn set_mlst(&self, enabled: bool) {
        self.state.mlst.store(enabled, Ordering::SeqCst);
    }

    /// Swallow QUIT without replying and keep the connection open.
    pub fn set_quit_silent(&self, silent: bool) {
        self.state.quit_silent.store(silent, Ordering::SeqCst);
    }

    /// Hold every listing open for `delay` before sending it.
    pub fn set_listing_delay(&self, delay: Duration) {
        self.state
            .listing_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Drop every control connection without a goodbye.
    pub fn disconnect_all(&self) {
        self.state.kill.send_modify(|generation| *generation += 1);
    }

    /// Push an unsolicited `421` onto every control connection, as a server
    /// does before closing idle sessions. The connections stay open.
    pub fn announce_shutdown(&self) {
        self.state.notice.send_modify(|generation| *generation += 1);
    }

    // ── Counters ────────────────────────────────────────────────

    pub fn active_connections(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    pub fn total_connections(&self) -> usize {
        self.state.total.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn saw(&self, cmd: &str) -> bool {
        self.commands().iter().any(|c| c == cmd)
    }

    pub fn saw_prefix(&self, prefix: &str) -> bool {
        self.commands().iter().any(|c| c.starts_with(prefix))
    }

    /// Wait until the server holds exactly `n` control connections.
    pub async fn wait_for_active(&self, n: usize) {
        for _ in 0..200 {
            if self.active_connections() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} active connections, have {}",
            n,
            self.active_connections()
        );
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
        self.disconnect_all();
    }
}

// ─── Control connection ──────────────────────────────────────────────

struct Control {
    state: Arc<State>,
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    kill: watch::Receiver<u64>,
    notice: watch::Receiver<u64>,
    cwd: String,
    user: Option<String>,
    logged_in: bool,
    rename_from: Option<String>,
    passive: Option<TcpListener>,
    active: Option<SocketAddr>,
}

impl Control {
    fn new(
        state: Arc<State>,
        stream: TcpStream,
        kill: watch::Receiver<u64>,
        notice: watch::Receiver<u64>,
    ) -> Self {
        let (r, w) = stream.into_split();
        Self {
            state,
            reader: BufReader::new(r),
            writer: w,
            kill,
            notice,
            cwd: "/".into(),
            user: None,
            logged_in: false,
            rename_from: None,
            passive: None,
            active: None,
        }
    }

    async fn reply(&mut self, text: &str) -> std::io::Result<()> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await
    }

    async fn run(mut self) -> std::io::Result<()> {
        self.reply("220 mock FTP ready").await?;
        let mut line = String::new();
        loop {
            tokio::select! {
                n = self.reader.read_line(&mut line) => {
                    if n? == 0 {
                        return Ok(());
                    }
                }
                _ = self.kill.changed() => return Ok(()),
                _ = self.notice.changed() => {
                    self.reply("421 Idle timeout, closing control connection").await?;
                    continue;
                }
            }
            let raw = std::mem::take(&mut line);
            let cmd = raw.trim_end_matches(|c: char| c == '\r' || c == '\n').to_string();
            self.state.commands.lock().unwrap().push(cmd.clone());
            let (verb, arg) = match cmd.split_once(' ') {
                Some((v, a)) => (v.to_ascii_uppercase(), a.to_string()),
                None => (cmd.to_ascii_uppercase(), String::new()),
            };
            if !self.dispatch(&verb, &arg).await? {
                return Ok(());
            }
        }
    }

    /// Returns `false` once the session should end.
    async fn dispatch(&mut self, verb: &str, arg: &str) -> std::io::Result<bool> {
        if !self.logged_in && !matches!(verb, "USER" | "PASS" | "QUIT" | "FEAT" | "SYST") {
            self.reply("530 Please login with USER and PASS").await?;
            return Ok(true);
        }
        match verb {
            "USER" => {
                self.user = Some(arg.to_string());
                self.reply("331 Password required").await?;
            }
            "PASS" => {
                if self.user.as_deref() == Some(USER) && arg == PASS {
                    self.logged_in = true;
                    self.reply("230 Logged in").await?;
                } else {
                    self.reply("530 Login incorrect").await?;
                }
            }
            "SYST" => self.reply("215 UNIX Type: L8").await?,
            "FEAT" => {
                let mut text = String::from("211-Features:\r\n");
                if self.state.mlst.load(Ordering::SeqCst) {
                    text.push_str(" MLST type*;size*;modify*;UNIX.mode*;\r\n");
                }
                text.push_str(" UTF8\r\n EPSV\r\n211 End");
                self.reply(&text).await?;
            }
            "OPTS" | "TYPE" | "NOOP" => self.reply("200 OK").await?,
            "PWD" => {
                let text = format!("257 {} is the current directory", quote_path(&self.cwd));
                self.reply(&text).await?;
            }
            "CWD" => {
                let path = self.resolve(arg);
                if self.is_dir(&path) {
                    self.cwd = path;
                    self.reply("250 Directory changed").await?;
                } else {
                    self.reply("550 No such directory").await?;
                }
            }
            "MKD" => {
                let path = self.resolve(arg);
                let ok = {
                    let mut fs = self.state.fs.lock().unwrap();
                    let parent_ok = matches!(fs.get(parent_of(&path)), Some(Node::Dir));
                    if parent_ok && !fs.contains_key(&path) {
                        fs.insert(path.clone(), Node::Dir);
                        true
                    } else {
                        false
                    }
                };
                if ok {
                    self.reply(&format!("257 {} created", quote_path(&path))).await?;
                } else {
                    self.reply("550 Cannot create directory").await?;
                }
            }
            "RMD" => {
                let path = self.resolve(arg);
                let ok = {
                    let mut fs = self.state.fs.lock().unwrap();
                    let empty = !fs.keys().any(|k| parent_of(k) == path && *k != path);
                    if matches!(fs.get(&path), Some(Node::Dir)) && empty && path != "/" {
                        fs.remove(&path);
                        true
                    } else {
                        false
                    }
                };
                if ok {
                    self.reply("250 Directory removed").await?;
                } else {
                    self.reply("550 Cannot remove directory").await?;
                }
            }
            "DELE" => {
                let path = self.resolve(arg);
                let removed = {
                    let mut fs = self.state.fs.lock().unwrap();
                    if matches!(fs.get(&path), Some(Node::File(_))) {
                        fs.remove(&path);
                        true
                    } else {
                        false
                    }
                };
                if removed {
                    self.reply("250 File deleted").await?;
                } else {
                    self.reply("550 No such file or directory").await?;
                }
            }
            "RNFR" => {
                let path = self.resolve(arg);
                if self.state.fs.lock().unwrap().contains_key(&path) {
                    self.rename_from = Some(path);
                    self.reply("350 Ready for destination name").await?;
                } else {
                    self.reply("550 No such file or directory").await?;
                }
            }
            "RNTO" => match self.rename_from.take() {
                Some(from) => {
                    let to = self.resolve(arg);
                    move_tree(&mut self.state.fs.lock().unwrap(), &from, &to);
                    self.reply("250 Rename successful").await?;
                }
                None => self.reply("503 Bad sequence of commands").await?,
            },
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                self.passive = Some(listener);
                let text = format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})",
                    port / 256,
                    port % 256
                );
                self.reply(&text).await?;
            }
            "EPSV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                self.passive = Some(listener);
                self.reply(&format!("229 Entering Extended Passive Mode (|||{}|)", port))
                    .await?;
            }
            "PORT" => match parse_port(arg) {
                Some(addr) => {
                    self.active = Some(addr);
                    self.reply("200 PORT command successful").await?;
                }
                None => self.reply("501 Bad PORT argument").await?,
            },
            "EPRT" => match parse_eprt(arg) {
                Some(addr) => {
                    self.active = Some(addr);
                    self.reply("200 EPRT command successful").await?;
                }
                None => self.reply("501 Bad EPRT argument").await?,
            },
            "MLSD" => {
                if !self.state.mlst.load(Ordering::SeqCst) {
                    self.forget_data();
                    self.reply("500 MLSD not understood").await?;
                    return Ok(true);
                }
                let path = self.resolve(arg);
                if !self.is_dir(&path) {
                    self.forget_data();
                    self.reply("550 No such directory").await?;
                    return Ok(true);
                }
                let body: String = self
                    .children(&path)
                    .iter()
                    .map(|(name, node)| format!("{}\r\n", self.facts(node, name)))
                    .collect();
                self.send_listing(body).await?;
            }
            "MLST" => {
                if !self.state.mlst.load(Ordering::SeqCst) {
                    self.reply("500 MLST not understood").await?;
                    return Ok(true);
                }
                let path = self.resolve(arg);
                let node = self.state.fs.lock().unwrap().get(&path).cloned();
                match node {
                    Some(node) => {
                        let text = format!(
                            "250-Listing {}\r\n {}\r\n250 End",
                            path,
                            self.facts(&node, &path)
                        );
                        self.reply(&text).await?;
                    }
                    None => self.reply("550 No such file or directory").await?,
                }
            }
            "LIST" => {
                let arg = if arg.starts_with('-') { "" } else { arg };
                let path = self.resolve(arg);
                let node = self.state.fs.lock().unwrap().get(&path).cloned();
                let body: String = match node {
                    Some(Node::Dir) => self
                        .children(&path)
                        .iter()
                        .map(|(name, node)| format!("{}\r\n", self.ls_line(node, name)))
                        .collect(),
                    Some(file) => format!("{}\r\n", self.ls_line(&file, base_name(&path))),
                    None => {
                        self.forget_data();
                        self.reply("550 No such file or directory").await?;
                        return Ok(true);
                    }
                };
                self.send_listing(body).await?;
            }
            "RETR" => {
                let path = self.resolve(arg);
                let data = match self.state.fs.lock().unwrap().get(&path) {
                    Some(Node::File(data)) => Some(data.clone()),
                    _ => None,
                };
                match data {
                    Some(data) => self.send_data(&data).await?,
                    None => {
                        self.forget_data();
                        self.reply("550 No such file or directory").await?;
                    }
                }
            }
            "STOR" => {
                let path = self.resolve(arg);
                if !self.is_dir(parent_of(&path)) {
                    self.forget_data();
                    self.reply("553 Parent directory does not exist").await?;
                    return Ok(true);
                }
                let Some(mut data_conn) = self.open_data().await? else {
                    return Ok(true);
                };
                let mut data = Vec::new();
                data_conn.read_to_end(&mut data).await?;
                self.state.fs.lock().unwrap().insert(path, Node::File(data));
                self.reply("226 Transfer complete").await?;
            }
            "QUIT" => {
                if self.state.quit_silent.load(Ordering::SeqCst) {
                    return Ok(true);
                }
                self.reply("221 Goodbye").await?;
                return Ok(false);
            }
            _ => self.reply("502 Command not implemented").await?,
        }
        Ok(true)
    }

    // ── Data connections ────────────────────────────────────────

    fn forget_data(&mut self) {
        self.passive = None;
        self.active = None;
    }

    async fn open_data(&mut self) -> std::io::Result<Option<TcpStream>> {
        let passive = self.passive.take();
        let active = self.active.take();
        if passive.is_none() && active.is_none() {
            self.reply("425 Use PASV or PORT first").await?;
            return Ok(None);
        }
        self.reply("150 Opening data connection").await?;
        let wait = Duration::from_secs(5);
        let conn = match (active, passive) {
            (Some(target), _) => timeout(wait, TcpStream::connect(target))
                .await
                .ok()
                .and_then(Result::ok),
            (None, Some(listener)) => timeout(wait, listener.accept())
                .await
                .ok()
                .and_then(Result::ok)
                .map(|(stream, _)| stream),
            (None, None) => None,
        };
        if conn.is_none() {
            self.reply("425 Data connection failed").await?;
        }
        Ok(conn)
    }

    async fn send_data(&mut self, data: &[u8]) -> std::io::Result<()> {
        let Some(mut conn) = self.open_data().await? else {
            return Ok(());
        };
        conn.write_all(data).await?;
        conn.shutdown().await?;
        drop(conn);
        self.reply("226 Transfer complete").await
    }

    async fn send_listing(&mut self, body: String) -> std::io::Result<()> {
        let delay = self.state.listing_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.send_data(body.as_bytes()).await
    }

    // ── Filesystem helpers ──────────────────────────────────────

    fn resolve(&self, arg: &str) -> String {
        let joined = if arg.is_empty() {
            self.cwd.clone()
        } else if arg.starts_with('/') {
            arg.to_string()
        } else {
            format!("{}/{}", self.cwd, arg)
        };
        let mut parts: Vec<&str> = Vec::new();
        for seg in joined.split('/') {
            match seg {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                s => parts.push(s),
            }
        }
        format!("/{}", parts.join("/"))
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.state.fs.lock().unwrap().get(path), Some(Node::Dir))
    }

    fn children(&self, dir: &str) -> Vec<(String, Node)> {
        self.state
            .fs
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.as_str() != "/" && parent_of(k) == dir)
            .map(|(k, v)| (base_name(k).to_string(), v.clone()))
            .collect()
    }

    fn facts(&self, node: &Node, name: &str) -> String {
        let modify = self.state.mtime.format("%Y%m%d%H%M%S");
        match node {
            Node::Dir => format!("type=dir;modify={};UNIX.mode=0755; {}", modify, name),
            Node::File(data) => format!(
                "type=file;size={};modify={};UNIX.mode=0644; {}",
                data.len(),
                modify,
                name
            ),
        }
    }

    fn ls_line(&self, node: &Node, name: &str) -> String {
        let when = self.state.mtime.format("%b %e %H:%M");
        match node {
            Node::Dir => format!("drwxr-xr-x    2 ftp      ftp          4096 {} {}", when, name),
            Node::File(data) => format!(
                "-rw-r--r--    1 ftp      ftp      {:>8} {} {}",
                data.len(),
                when,
                name
            ),
        }
    }
}

/// `h1,h2,h3,h4,p1,p2`
fn parse_port(arg: &str) -> Option<SocketAddr> {
    let nums: Vec<u8> = arg
        .split(',')
        .map(|n| n.trim().parse().ok())
        .collect::<Option<_>>()?;
    if nums.len() != 6 {
        return None;
    }
    let ip = std::net::Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]);
    let port = u16::from(nums[4]) * 256 + u16::from(nums[5]);
    Some(SocketAddr::from((ip, port)))
}

/// `|af|ip|port|`
fn parse_eprt(arg: &str) -> Option<SocketAddr> {
    let mut fields = arg.trim_matches('|').split('|');
    let _af = fields.next()?;
    let ip: std::net::IpAddr = fields.next()?.parse().ok()?;
    let port: u16 = fields.next()?.parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn move_tree(fs: &mut BTreeMap<String, Node>, from: &str, to: &str) {
    let prefix = format!("{}/", from);
    let moved: Vec<String> = fs
        .keys()
        .filter(|k| k.as_str() == from || k.starts_with(&prefix))
        .cloned()
        .collect();
    for key in moved {
        if let Some(node) = fs.remove(&key) {
            let new_key = format!("{}{}", to, &key[from.len()..]);
            fs.insert(new_key, node);
        }
    }
}

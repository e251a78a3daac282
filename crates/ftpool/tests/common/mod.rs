//! In-process stub FTP server for the integration tests.
//!
//! Serves an in-memory tree over real sockets, records every command it
//! receives, and can be told to misbehave once on a given verb.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub const PASSWORD: &str = "secret";
pub const MODIFY: &str = "20240105103000";

#[derive(Debug, Clone)]
pub enum Node {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug, Clone)]
pub struct StubOptions {
    /// Advertise MLST (and serve MLSD / MLST).
    pub machine_listings: bool,
    pub epsv: bool,
    pub rest_stream: bool,
    /// Accept PORT/EPRT but never dial the client's data listener.
    pub ignore_active: bool,
}

impl Default for StubOptions {
    fn default() -> Self {
        Self {
            machine_listings: true,
            epsv: true,
            rest_stream: true,
            ignore_active: false,
        }
    }
}

#[derive(Default)]
struct StubState {
    tree: BTreeMap<String, Node>,
    log: Vec<String>,
    connections: usize,
    sessions: usize,
    max_sessions: usize,
    malformed_on: Vec<String>,
    stall_on: Vec<String>,
    fail_once: HashMap<String, String>,
}

/// Handle to a running stub server.
#[derive(Clone)]
pub struct StubServer {
    pub addr: SocketAddr,
    options: StubOptions,
    state: Arc<Mutex<StubState>>,
}

impl StubServer {
    pub async fn start() -> Self {
        Self::start_with(StubOptions::default()).await
    }

    pub async fn start_with(options: StubOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut tree = BTreeMap::new();
        tree.insert("/".to_string(), Node::Dir);
        let server = Self {
            addr,
            options,
            state: Arc::new(Mutex::new(StubState {
                tree,
                ..StubState::default()
            })),
        };

        let accept = server.clone();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                {
                    let mut st = accept.lock();
                    st.connections += 1;
                    st.sessions += 1;
                    st.max_sessions = st.max_sessions.max(st.sessions);
                }
                let session = accept.clone();
                tokio::spawn(async move {
                    Session::new(session.clone()).run(sock).await;
                    session.lock().sessions -= 1;
                });
            }
        });
        server
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.state.lock().unwrap()
    }

    pub fn url(&self) -> String {
        format!("ftp://tester:{}@{}", PASSWORD, self.addr)
    }

    pub fn url_with_password(&self, password: &str) -> String {
        format!("ftp://tester:{}@{}", password, self.addr)
    }

    // ── Fixture setup ────────────────────────────────────────────

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.lock()
            .tree
            .insert(path.to_string(), Node::File(data.to_vec()));
    }

    pub fn put_dir(&self, path: &str) {
        self.lock().tree.insert(path.to_string(), Node::Dir);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().tree.get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().tree.contains_key(path)
    }

    // ── Fault injection ──────────────────────────────────────────

    /// Answer the next `verb` with a line that is not an FTP reply.
    pub fn malformed_on(&self, verb: &str) {
        self.lock().malformed_on.push(verb.to_string());
    }

    /// Never answer the next `verb`.
    pub fn stall_on(&self, verb: &str) {
        self.lock().stall_on.push(verb.to_string());
    }

    /// Answer the next `verb` with `reply` instead of handling it.
    pub fn fail_once(&self, verb: &str, reply: &str) {
        self.lock()
            .fail_once
            .insert(verb.to_string(), reply.to_string());
    }

    // ── Observations ─────────────────────────────────────────────

    pub fn commands(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .count()
    }

    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    pub fn max_sessions(&self) -> usize {
        self.lock().max_sessions
    }
}

// ─── Session ─────────────────────────────────────────────────────────

enum Pending {
    None,
    Passive(TcpListener),
    Active(SocketAddr),
}

struct Session {
    server: StubServer,
    cwd: String,
    pending: Pending,
    rest: u64,
    rename_from: Option<String>,
}

enum Injection {
    Malformed,
    Stall,
    Reply(String),
}

impl Session {
    fn new(server: StubServer) -> Self {
        Self {
            server,
            cwd: "/".to_string(),
            pending: Pending::None,
            rest: 0,
            rename_from: None,
        }
    }

    async fn run(mut self, sock: TcpStream) {
        let (rd, mut wr) = sock.into_split();
        let mut rd = BufReader::new(rd);
        if wr
            .write_all(b"220-Welcome\r\n220 stub ready\r\n")
            .await
            .is_err()
        {
            return;
        }

        let mut line = String::new();
        loop {
            line.clear();
            match rd.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let command = line.trim_end_matches(['\r', '\n']).to_string();
            let (verb, arg) = match command.split_once(' ') {
                Some((v, a)) => (v.to_ascii_uppercase(), a.to_string()),
                None => (command.to_ascii_uppercase(), String::new()),
            };
            let logged = if verb == "PASS" {
                "PASS ***".to_string()
            } else {
                command.clone()
            };
            self.server.lock().log.push(logged);

            let reply = match self.injection(&verb) {
                Some(Injection::Malformed) => "this is not ftp\r\n".to_string(),
                Some(Injection::Stall) => continue,
                Some(Injection::Reply(text)) => {
                    self.pending = Pending::None;
                    format!("{}\r\n", text)
                }
                None => match self.handle(&verb, &arg, &mut wr).await {
                    Some(reply) => reply,
                    None => return,
                },
            };
            if wr.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
            if verb == "QUIT" {
                return;
            }
        }
    }

    fn injection(&self, verb: &str) -> Option<Injection> {
        let mut st = self.server.lock();
        if let Some(pos) = st.malformed_on.iter().position(|v| v == verb) {
            st.malformed_on.remove(pos);
            return Some(Injection::Malformed);
        }
        if let Some(pos) = st.stall_on.iter().position(|v| v == verb) {
            st.stall_on.remove(pos);
            return Some(Injection::Stall);
        }
        st.fail_once.remove(verb).map(Injection::Reply)
    }

    fn resolve(&self, arg: &str) -> String {
        let raw = if arg.is_empty() {
            self.cwd.clone()
        } else if arg.starts_with('/') {
            arg.to_string()
        } else if self.cwd == "/" {
            format!("/{}", arg)
        } else {
            format!("{}/{}", self.cwd, arg)
        };
        if raw.len() > 1 {
            raw.trim_end_matches('/').to_string()
        } else {
            raw
        }
    }

    fn node(&self, path: &str) -> Option<Node> {
        self.server.lock().tree.get(path).cloned()
    }

    fn children(&self, dir: &str) -> Vec<(String, Node)> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        self.server
            .lock()
            .tree
            .iter()
            .filter(|(p, _)| p.starts_with(&prefix) && p.len() > prefix.len())
            .filter(|(p, _)| !p[prefix.len()..].contains('/'))
            .map(|(p, n)| (p[prefix.len()..].to_string(), n.clone()))
            .collect()
    }

    /// Handle one command. `None` ends the session.
    async fn handle(
        &mut self,
        verb: &str,
        arg: &str,
        wr: &mut tokio::net::tcp::OwnedWriteHalf,
    ) -> Option<String> {
        let opts = self.server.options.clone();
        let reply = match verb {
            "USER" => "331 Password required".to_string(),
            "PASS" if arg == PASSWORD => "230 Logged in".to_string(),
            "PASS" => "530 Login incorrect".to_string(),
            "FEAT" => {
                let mut feat = String::from("211-Features:\r\n SIZE\r\n MDTM\r\n UTF8\r\n");
                if opts.rest_stream {
                    feat.push_str(" REST STREAM\r\n");
                }
                if opts.machine_listings {
                    feat.push_str(" MLST type*;size*;modify*;\r\n");
                }
                if opts.epsv {
                    feat.push_str(" EPSV\r\n");
                }
                feat.push_str("211 End");
                feat
            }
            "OPTS" | "TYPE" | "NOOP" => "200 OK".to_string(),
            "QUIT" => "221 Goodbye".to_string(),
            "PWD" => format!("257 \"{}\" is the current directory", self.cwd),
            "CWD" => {
                let path = self.resolve(arg);
                match self.node(&path) {
                    Some(Node::Dir) => {
                        self.cwd = path;
                        "250 Directory changed".to_string()
                    }
                    _ => format!("550 {}: No such directory", arg),
                }
            }
            "EPSV" if !opts.epsv => "500 EPSV not understood".to_string(),
            "EPSV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await.ok()?;
                let port = listener.local_addr().ok()?.port();
                self.pending = Pending::Passive(listener);
                format!("229 Entering Extended Passive Mode (|||{}|)", port)
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await.ok()?;
                let port = listener.local_addr().ok()?.port();
                self.pending = Pending::Passive(listener);
                format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})",
                    port / 256,
                    port % 256
                )
            }
            "PORT" => {
                let nums: Vec<u16> = arg.split(',').filter_map(|n| n.parse().ok()).collect();
                if nums.len() != 6 {
                    "501 Bad PORT".to_string()
                } else {
                    let ip = format!("{}.{}.{}.{}", nums[0], nums[1], nums[2], nums[3]);
                    let port = nums[4] * 256 + nums[5];
                    match format!("{}:{}", ip, port).parse() {
                        Ok(addr) => {
                            self.pending = Pending::Active(addr);
                            "200 PORT command successful".to_string()
                        }
                        Err(_) => "501 Bad PORT".to_string(),
                    }
                }
            }
            "EPRT" => {
                let parts: Vec<&str> = arg.split('|').collect();
                match (parts.get(2), parts.get(3)) {
                    (Some(ip), Some(port)) => match format!("[{}]:{}", ip, port).parse() {
                        Ok(addr) => {
                            self.pending = Pending::Active(addr);
                            "200 EPRT command successful".to_string()
                        }
                        Err(_) => "501 Bad EPRT".to_string(),
                    },
                    _ => "501 Bad EPRT".to_string(),
                }
            }
            "REST" => match arg.parse() {
                Ok(offset) => {
                    self.rest = offset;
                    format!("350 Restarting at {}", offset)
                }
                Err(_) => "501 Bad offset".to_string(),
            },
            "STOR" => {
                let path = self.resolve(arg);
                let mut data = self.open_data(wr).await?;
                let mut body = Vec::new();
                if data.read_to_end(&mut body).await.is_err() {
                    return Some("426 Transfer aborted\r\n".to_string());
                }
                drop(data);
                self.server.lock().tree.insert(path, Node::File(body));
                "226 Transfer complete".to_string()
            }
            "RETR" => {
                let path = self.resolve(arg);
                let offset = std::mem::take(&mut self.rest) as usize;
                match self.node(&path) {
                    Some(Node::File(body)) => {
                        let mut data = self.open_data(wr).await?;
                        let start = offset.min(body.len());
                        let _ = data.write_all(&body[start..]).await;
                        let _ = data.shutdown().await;
                        drop(data);
                        "226 Transfer complete".to_string()
                    }
                    _ => {
                        self.pending = Pending::None;
                        format!("550 {}: No such file", arg)
                    }
                }
            }
            "LIST" | "MLSD" => {
                let dir = self.resolve(arg);
                if !matches!(self.node(&dir), Some(Node::Dir)) {
                    self.pending = Pending::None;
                    return Some(format!("550 {}: No such directory\r\n", arg));
                }
                let mut body = String::new();
                for (name, node) in self.children(&dir) {
                    if verb == "MLSD" {
                        body.push_str(&mlsd_line(&name, &node));
                    } else {
                        body.push_str(&list_line(&name, &node));
                    }
                    body.push_str("\r\n");
                }
                let mut data = self.open_data(wr).await?;
                let _ = data.write_all(body.as_bytes()).await;
                let _ = data.shutdown().await;
                drop(data);
                "226 Transfer complete".to_string()
            }
            "MLST" if opts.machine_listings => {
                let path = self.resolve(arg);
                match self.node(&path) {
                    Some(node) => format!(
                        "250-Listing {}\r\n {}\r\n250 End",
                        path,
                        mlsd_line(&path, &node)
                    ),
                    None => format!("550 {}: No such file or directory", arg),
                }
            }
            "STAT" if !arg.is_empty() => {
                let path = self.resolve(arg);
                match self.node(&path) {
                    Some(Node::File(body)) => {
                        let name = path.rsplit('/').next().unwrap_or("");
                        format!(
                            "213-Status of {}:\r\n{}\r\n213 End",
                            arg,
                            list_line(name, &Node::File(body))
                        )
                    }
                    Some(Node::Dir) => {
                        let mut reply = format!("213-Status of {}:\r\n", arg);
                        for (name, node) in self.children(&path) {
                            reply.push_str(&list_line(&name, &node));
                            reply.push_str("\r\n");
                        }
                        reply.push_str("213 End");
                        reply
                    }
                    None => format!("550 {}: No such file or directory", arg),
                }
            }
            "SIZE" => match self.node(&self.resolve(arg)) {
                Some(Node::File(body)) => format!("213 {}", body.len()),
                _ => format!("550 {}: not a plain file", arg),
            },
            "MDTM" => match self.node(&self.resolve(arg)) {
                Some(Node::File(_)) => format!("213 {}", MODIFY),
                _ => format!("550 {}: not a plain file", arg),
            },
            "DELE" => {
                let path = self.resolve(arg);
                let mut st = self.server.lock();
                if matches!(st.tree.get(&path), Some(Node::File(_))) {
                    st.tree.remove(&path);
                    "250 File deleted".to_string()
                } else {
                    format!("550 {}: not a plain file", arg)
                }
            }
            "RMD" => {
                let path = self.resolve(arg);
                let has_children = !self.children(&path).is_empty();
                let mut st = self.server.lock();
                let is_dir = matches!(st.tree.get(&path), Some(Node::Dir));
                if !is_dir {
                    format!("550 {}: not a directory", arg)
                } else if has_children {
                    format!("550 {}: Directory not empty", arg)
                } else {
                    st.tree.remove(&path);
                    "250 Directory removed".to_string()
                }
            }
            "MKD" => {
                let path = self.resolve(arg);
                let mut st = self.server.lock();
                if st.tree.contains_key(&path) {
                    format!("550 {}: File exists", arg)
                } else {
                    st.tree.insert(path.clone(), Node::Dir);
                    format!("257 \"{}\" created", path)
                }
            }
            "RNFR" => {
                let path = self.resolve(arg);
                if self.node(&path).is_some() {
                    self.rename_from = Some(path);
                    "350 Ready for RNTO".to_string()
                } else {
                    format!("550 {}: No such file or directory", arg)
                }
            }
            "RNTO" => match self.rename_from.take() {
                Some(from) => {
                    let to = self.resolve(arg);
                    let mut st = self.server.lock();
                    let moved: Vec<(String, Node)> = st
                        .tree
                        .iter()
                        .filter(|(p, _)| **p == from || p.starts_with(&format!("{}/", from)))
                        .map(|(p, n)| (p.clone(), n.clone()))
                        .collect();
                    for (old, node) in moved {
                        st.tree.remove(&old);
                        st.tree.insert(format!("{}{}", to, &old[from.len()..]), node);
                    }
                    "250 Rename successful".to_string()
                }
                None => "503 RNFR required first".to_string(),
            },
            _ => format!("502 {} not implemented", verb),
        };
        Some(format!("{}\r\n", reply))
    }

    /// Reply 150 and bring up the pending data connection.
    async fn open_data(&mut self, wr: &mut tokio::net::tcp::OwnedWriteHalf) -> Option<TcpStream> {
        let pending = std::mem::replace(&mut self.pending, Pending::None);
        if matches!(pending, Pending::None) {
            wr.write_all(b"425 Use PORT or PASV first\r\n").await.ok()?;
            return None;
        }
        wr.write_all(b"150 Opening data connection\r\n").await.ok()?;
        if self.server.options.ignore_active && matches!(pending, Pending::Active(_)) {
            tokio::time::sleep(Duration::from_secs(3)).await;
            return None;
        }
        let connect = async {
            match pending {
                Pending::Passive(listener) => listener.accept().await.ok().map(|(s, _)| s),
                Pending::Active(addr) => TcpStream::connect(addr).await.ok(),
                Pending::None => None,
            }
        };
        tokio::time::timeout(Duration::from_secs(5), connect)
            .await
            .ok()
            .flatten()
    }
}

fn mlsd_line(name: &str, node: &Node) -> String {
    match node {
        Node::File(body) => format!("type=file;size={};modify={}; {}", body.len(), MODIFY, name),
        Node::Dir => format!("type=dir;modify={}; {}", MODIFY, name),
    }
}

fn list_line(name: &str, node: &Node) -> String {
    match node {
        Node::File(body) => format!(
            "-rw-r--r--   1 owner    group    {:>8} Jan 05  2024 {}",
            body.len(),
            name
        ),
        Node::Dir => format!(
            "drwxr-xr-x   2 owner    group    {:>8} Jan 05  2024 {}",
            4096, name
        ),
    }
}

//! Per-socket protocol state machine.
//!
//! ```text
//!            Init                 Done                  written
//!   Idle ───────────► Reading ──────────► Writing ─────────────┐
//!    ▲                  ▲                                      │
//!    │                  └────────────── keep-alive ────────────┤
//!    └──────────────────────────── close ──────────────────────┘
//! ```
//!
//! Every phase runs under the slot mutex and returns instead of blocking:
//! on `WouldBlock` it re-arms the one-shot epoll registration for the event
//! it is waiting for. Progress (filled buffer, bytes written) lives in the
//! slot between invocations.

use std::io::{ErrorKind, IoSlice, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use socket2::SockRef;
use tracing::{debug, trace, warn};

use crate::cache::CacheEntry;
use crate::context::{Phase, ServerContext, Stats, Task};
use crate::http::mime;
use crate::http::{encode_respond_header, HeaderMap, HeaderParser, Method, ParseStatus, StatusCode};
use crate::sys::{self, INTEREST_READ, INTEREST_WRITE};

/// The only protocol version served.
pub const HTTP_VERSION: &str = "HTTP/1.1";

/// Served for an empty target or one ending in `/`.
pub const INDEX_FILE: &str = "index.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Reading,
    Writing,
}

pub struct Connection {
    slot: usize,
    epoch: u32,
    state: ConnState,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,

    /// Request header bytes; allocated on first use, kept across reuse.
    buf: Vec<u8>,
    filled: usize,
    parser: HeaderParser,

    /// Serialized response header (plus body for non-OK statuses).
    response: Vec<u8>,
    file: Option<Arc<CacheEntry>>,
    header_sent: usize,
    body_sent: usize,
    keep_alive: bool,
}

impl Connection {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            epoch: 0,
            state: ConnState::Idle,
            stream: None,
            peer: None,
            buf: Vec::new(),
            filled: 0,
            parser: HeaderParser::new(),
            response: Vec::new(),
            file: None,
            header_sent: 0,
            body_sent: 0,
            keep_alive: false,
        }
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    #[inline]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Response bytes not yet written (header and file).
    pub fn remaining(&self) -> usize {
        let body = self.file.as_ref().map_or(0, |f| f.data().len());
        (self.response.len() - self.header_sent) + (body - self.body_sent)
    }

    /// Run one phase. Tasks from an earlier occupant of the slot are dropped.
    pub fn process(&mut self, ctx: &ServerContext, task: Task) {
        let Task { slot, epoch, phase } = task;
        debug_assert_eq!(slot, self.slot);

        if let Phase::Init { stream, peer } = phase {
            self.init(ctx, stream, peer, epoch);
            return;
        }
        if !self.is_active() || epoch != self.epoch {
            trace!(slot, epoch, current = self.epoch, phase = phase.name(), "stale task dropped");
            return;
        }
        match phase {
            Phase::Readable => self.on_readable(ctx),
            Phase::Writable => self.on_writable(ctx),
            Phase::Close => {
                debug!(slot, peer = ?self.peer, "closing on request");
                self.close(ctx);
            }
            Phase::Init { .. } => {}
        }
    }

    fn init(&mut self, ctx: &ServerContext, stream: TcpStream, peer: SocketAddr, epoch: u32) {
        if self.is_active() {
            debug!(slot = self.slot, "slot still active, force-closing previous connection");
            self.close(ctx);
        }

        if let Err(e) = stream.set_nonblocking(true) {
            warn!(slot = self.slot, error = %e, "set_nonblocking failed, dropping connection");
            return;
        }
        if let Err(e) = SockRef::from(&stream).set_reuse_address(true) {
            trace!(slot = self.slot, error = %e, "SO_REUSEADDR not applied");
        }
        if self.buf.len() != ctx.read_buffer() {
            self.buf = vec![0; ctx.read_buffer()];
        }

        let fd = stream.as_raw_fd();
        self.epoch = epoch;
        self.peer = Some(peer);
        self.stream = Some(stream);
        self.reset_request();
        self.state = ConnState::Reading;
        ctx.stats.live.fetch_add(1, Ordering::Relaxed);

        if let Err(errno) = ctx.epoll.add(fd, INTEREST_READ, sys::token(self.slot, epoch)) {
            warn!(slot = self.slot, %errno, "epoll add failed");
            self.close(ctx);
            return;
        }
        debug!(slot = self.slot, %peer, epoch, "connection open");
    }

    fn on_readable(&mut self, ctx: &ServerContext) {
        if self.state != ConnState::Reading {
            trace!(slot = self.slot, state = ?self.state, "readable outside reading state");
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        // edge-triggered: drain until the kernel has nothing more
        let mut hit_eof = false;
        while self.filled < self.buf.len() {
            match stream.read(&mut self.buf[self.filled..]) {
                Ok(0) => {
                    hit_eof = true;
                    break;
                }
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(slot = self.slot, error = %e, "read failed");
                    self.close(ctx);
                    return;
                }
            }
        }
        if hit_eof {
            trace!(slot = self.slot, "peer closed");
            self.close(ctx);
            return;
        }

        match self.parser.parse_request(&self.buf[..self.filled]) {
            ParseStatus::Working if self.filled == self.buf.len() => {
                warn!(slot = self.slot, size = self.filled, "request header exceeds read buffer");
                self.close(ctx);
            }
            ParseStatus::Working => self.rearm(ctx, INTEREST_READ),
            ParseStatus::Done => {
                self.prepare_response(ctx);
                self.state = ConnState::Writing;
                self.on_writable(ctx);
            }
            ParseStatus::Error => {
                warn!(slot = self.slot, peer = ?self.peer, "malformed request, closing");
                self.close(ctx);
            }
        }
    }

    fn prepare_response(&mut self, ctx: &ServerContext) {
        self.response.clear();
        self.file = None;
        self.header_sent = 0;
        self.body_sent = 0;

        let Some(request) = self.parser.request() else {
            self.keep_alive = false;
            encode_respond_header(&mut self.response, HTTP_VERSION, StatusCode::BadRequest, None);
            return;
        };
        self.keep_alive = request.keep_alive();

        if request.method != Method::Get || request.version != HTTP_VERSION {
            debug!(slot = self.slot, method = %request.method, version = %request.version, "unsupported request");
            encode_respond_header(&mut self.response, HTTP_VERSION, StatusCode::BadRequest, None);
            return;
        }

        let entry = resolve_path(ctx.doc_root(), &request.path).and_then(|path| ctx.cache.get_file(&path));
        let Some(entry) = entry else {
            debug!(slot = self.slot, path = %request.path, "not found");
            encode_respond_header(&mut self.response, HTTP_VERSION, StatusCode::NotFound, None);
            return;
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            "Connection".into(),
            if self.keep_alive { "keep-alive" } else { "close" }.into(),
        );
        headers.insert("Content-Length".into(), entry.size().to_string());
        headers.insert("Content-Type".into(), mime::content_type(entry.path()));
        encode_respond_header(&mut self.response, HTTP_VERSION, StatusCode::Ok, Some(&headers));
        debug!(slot = self.slot, path = %request.path, size = entry.size(), "serving");
        self.file = Some(entry);
    }

    fn on_writable(&mut self, ctx: &ServerContext) {
        if self.state != ConnState::Writing {
            trace!(slot = self.slot, state = ?self.state, "writable outside writing state");
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        loop {
            let header = &self.response[self.header_sent..];
            let body = match &self.file {
                Some(file) => &file.data()[self.body_sent..],
                None => &[][..],
            };
            if header.is_empty() && body.is_empty() {
                break;
            }
            let segments = [IoSlice::new(header), IoSlice::new(body)];
            match stream.write_vectored(&segments) {
                Ok(0) => {
                    debug!(slot = self.slot, "write returned zero");
                    self.close(ctx);
                    return;
                }
                Ok(n) => {
                    let from_header = n.min(header.len());
                    self.header_sent += from_header;
                    self.body_sent += n - from_header;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    trace!(slot = self.slot, remaining = self.remaining(), "socket full, waiting for writable");
                    self.rearm(ctx, INTEREST_WRITE);
                    return;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(slot = self.slot, error = %e, "write failed");
                    self.close(ctx);
                    return;
                }
            }
        }

        Stats::bump(&ctx.stats.responses);
        self.file = None;
        if self.keep_alive {
            trace!(slot = self.slot, "response complete, keeping alive");
            self.reset_request();
            self.state = ConnState::Reading;
            self.rearm(ctx, INTEREST_READ);
        } else {
            trace!(slot = self.slot, "response complete, closing");
            self.close(ctx);
        }
    }

    fn rearm(&mut self, ctx: &ServerContext, interest: u32) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        if let Err(errno) = ctx.epoll.modify(stream.as_raw_fd(), interest, sys::token(self.slot, self.epoch)) {
            debug!(slot = self.slot, %errno, "epoll re-arm failed");
            self.close(ctx);
        }
    }

    /// Clear per-request state; the stream and epoch stay.
    fn reset_request(&mut self) {
        self.buf[..self.filled].fill(0);
        self.filled = 0;
        self.parser.reset();
        self.response.clear();
        self.file = None;
        self.header_sent = 0;
        self.body_sent = 0;
        self.keep_alive = false;
    }

    /// Deregister, close the descriptor and return the slot to `Idle`.
    pub fn close(&mut self, ctx: &ServerContext) {
        if let Some(stream) = self.stream.take() {
            let _ = ctx.epoll.delete(stream.as_raw_fd());
            drop(stream);
            ctx.stats.live.fetch_sub(1, Ordering::Relaxed);
            trace!(slot = self.slot, peer = ?self.peer, "connection closed");
        }
        self.reset_request();
        self.buf.fill(0);
        self.peer = None;
        self.state = ConnState::Idle;
    }
}

/// Map a request target onto the document root.
///
/// Query and fragment are ignored. `None` when the target tries to leave the
/// root (`..`, or an absolute path after the leading `/` was stripped).
pub fn resolve_path(root: &Path, target: &str) -> Option<PathBuf> {
    let target = target.split(['?', '#']).next().unwrap_or_default();
    let mut path = root.to_path_buf();
    for component in Path::new(target).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if target.is_empty() || target.ends_with('/') {
        path.push(INDEX_FILE);
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::time::Duration;

    struct Harness {
        ctx: ServerContext,
        listener: TcpListener,
        _root: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            std::fs::write(root.path().join("index.html"), b"<h1>home</h1>").unwrap();
            std::fs::create_dir(root.path().join("docs")).unwrap();
            std::fs::write(root.path().join("docs/readme.txt"), b"read me\n").unwrap();
            let config = ServerConfig::default().root(root.path());
            Self {
                ctx: ServerContext::new(&config).unwrap(),
                listener: TcpListener::bind("127.0.0.1:0").unwrap(),
                _root: root,
            }
        }

        /// Connect a client and run `Init` for the accepted side.
        fn open(&self, epoch: u32) -> (TcpStream, usize) {
            let client = TcpStream::connect(self.listener.local_addr().unwrap()).unwrap();
            client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let (stream, peer) = self.listener.accept().unwrap();
            let slot = stream.as_raw_fd() as usize;
            self.ctx.dispatch(Task::new(slot, epoch, Phase::Init { stream, peer }));
            (client, slot)
        }

        fn state(&self, slot: usize) -> ConnState {
            self.ctx.slots[slot].lock().unwrap().state()
        }

        /// Deliver `Readable` until a response went out or the slot closed.
        fn pump_read(&self, slot: usize, epoch: u32) {
            let responses = self.ctx.stats().responses.load(Ordering::Relaxed);
            for _ in 0..200 {
                self.ctx.dispatch(Task::new(slot, epoch, Phase::Readable));
                if self.state(slot) == ConnState::Idle
                    || self.ctx.stats().responses.load(Ordering::Relaxed) != responses
                {
                    return;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    fn read_response(client: &mut TcpStream) -> (String, Vec<u8>) {
        let mut reader = BufReader::new(client);
        let mut head = String::new();
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if let Some(v) = line.strip_prefix("Content-Length: ") {
                content_length = v.trim().parse().unwrap();
            }
            head.push_str(&line);
            if line == "\r\n" {
                break;
            }
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).unwrap();
        (head, body)
    }

    #[test]
    fn test_resolve_path() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve_path(root, ""), Some(PathBuf::from("/srv/www/index.html")));
        assert_eq!(resolve_path(root, "a/b.css"), Some(PathBuf::from("/srv/www/a/b.css")));
        assert_eq!(resolve_path(root, "docs/"), Some(PathBuf::from("/srv/www/docs/index.html")));
        assert_eq!(resolve_path(root, "a.js?v=3#top"), Some(PathBuf::from("/srv/www/a.js")));
        assert_eq!(resolve_path(root, "./a.js"), Some(PathBuf::from("/srv/www/a.js")));
        assert_eq!(resolve_path(root, "../etc/passwd"), None);
        assert_eq!(resolve_path(root, "a/../../x"), None);
        assert_eq!(resolve_path(root, "/etc/passwd"), None);
    }

    #[test]
    fn test_get_serves_file_and_closes() {
        let h = Harness::new();
        let (mut client, slot) = h.open(1);
        assert_eq!(h.state(slot), ConnState::Reading);
        assert_eq!(h.ctx.stats().live_connections(), 1);

        client.write_all(b"GET /docs/readme.txt HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        h.pump_read(slot, 1);

        let (head, body) = read_response(&mut client);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.contains("Content-Length: 8\r\n"));
        assert!(head.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert_eq!(body, b"read me\n");

        assert_eq!(h.state(slot), ConnState::Idle);
        assert_eq!(h.ctx.stats().live_connections(), 0);
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).unwrap(), 0);
    }

    #[test]
    fn test_keep_alive_serves_index_twice() {
        let h = Harness::new();
        let (mut client, slot) = h.open(1);
        for _ in 0..2 {
            client.write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").unwrap();
            h.pump_read(slot, 1);
            let (head, body) = read_response(&mut client);
            assert!(head.contains("Connection: keep-alive\r\n"));
            assert!(head.contains("Content-Type: text/html; charset=utf-8\r\n"));
            assert_eq!(body, b"<h1>home</h1>");
            assert_eq!(h.state(slot), ConnState::Reading);
        }
        assert_eq!(h.ctx.stats().responses.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_missing_file_is_404() {
        let h = Harness::new();
        let (mut client, slot) = h.open(1);
        client.write_all(b"GET /nope.html HTTP/1.1\r\n\r\n").unwrap();
        h.pump_read(slot, 1);
        let (head, body) = read_response(&mut client);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(body, b"404 Not Found");
    }

    #[test]
    fn test_post_and_old_version_are_400() {
        let h = Harness::new();
        for request in [
            &b"POST / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n"[..],
            &b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n"[..],
        ] {
            let (mut client, slot) = h.open(1);
            client.write_all(request).unwrap();
            h.pump_read(slot, 1);
            let (head, body) = read_response(&mut client);
            assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
            assert_eq!(body, b"400 Bad Request");
            // keep-alive is honoured for unsupported requests
            assert_eq!(h.state(slot), ConnState::Reading);
            h.ctx.dispatch(Task::new(slot, 1, Phase::Close));
        }
    }

    /// Peer side sees the connection end without a single response byte.
    fn assert_closed_silently(client: &mut TcpStream) {
        let mut rest = Vec::new();
        let outcome = client.read_to_end(&mut rest);
        assert!(
            matches!(&outcome, Ok(0)) || matches!(&outcome, Err(e) if e.kind() == ErrorKind::ConnectionReset),
            "{outcome:?}"
        );
        assert!(rest.is_empty(), "unexpected response: {:?}", String::from_utf8_lossy(&rest));
    }

    #[test]
    fn test_malformed_request_closes_without_response() {
        let h = Harness::new();
        let (mut client, slot) = h.open(1);
        client.write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\nno colon here\r\n\r\n").unwrap();
        h.pump_read(slot, 1);
        assert_eq!(h.state(slot), ConnState::Idle);
        assert_eq!(h.ctx.stats().live_connections(), 0);
        assert_eq!(h.ctx.stats().responses.load(Ordering::Relaxed), 0);
        assert_closed_silently(&mut client);
    }

    #[test]
    fn test_oversized_header_closes_without_response() {
        let h = Harness::new();
        let (mut client, slot) = h.open(1);
        // exactly one buffer: no unread bytes left behind when the server closes
        let mut request = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        request.resize(h.ctx.read_buffer(), b'a');
        client.write_all(&request).unwrap();
        h.pump_read(slot, 1);
        assert_eq!(h.state(slot), ConnState::Idle);
        assert_closed_silently(&mut client);
    }

    #[test]
    fn test_stale_epoch_is_ignored() {
        let h = Harness::new();
        let (_client, slot) = h.open(5);
        h.ctx.dispatch(Task::new(slot, 4, Phase::Close));
        assert_eq!(h.state(slot), ConnState::Reading);
        h.ctx.dispatch(Task::new(slot, 5, Phase::Close));
        assert_eq!(h.state(slot), ConnState::Idle);
        // closing twice is harmless
        h.ctx.dispatch(Task::new(slot, 5, Phase::Close));
        assert_eq!(h.ctx.stats().live_connections(), 0);
    }

    #[test]
    fn test_peer_close_releases_slot() {
        let h = Harness::new();
        let (client, slot) = h.open(1);
        drop(client);
        h.pump_read(slot, 1);
        assert_eq!(h.state(slot), ConnState::Idle);
        assert_eq!(h.ctx.stats().live_connections(), 0);
    }
}

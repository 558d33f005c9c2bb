//! Per-connection HTTP state machine: incremental request parsing, routing,
//! response encoding and vectored write-back.
//!
//! One `Connection` owns one accepted socket plus its read/write buffers.
//! Parsing is resumable: it consumes whatever the read buffer holds and asks
//! for more data when a line or body is still incomplete, so a request split
//! across any number of socket reads parses identically to one delivered
//! whole.

use std::fs::{self, File};
use std::io::{self, IoSlice, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::ops::Range;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use memmap2::Mmap;
use nix::errno::Errno;
use nix::sys::uio::writev;

use crate::config::{MAX_PATH_LEN, READ_BUF_SIZE, WRITE_BUF_SIZE};
use crate::http::route;
use crate::http::{
    reason_phrase, Method, ParseState, RequestOutcome, ERROR_400_BODY, ERROR_403_BODY,
    ERROR_404_BODY, ERROR_500_BODY, OK_EMPTY_BODY,
};
use crate::store::UserDb;

/// What the event loop should do with the socket after `process`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessAction {
    /// Request still incomplete: re-arm read interest.
    AwaitMore,
    /// A response is queued: re-arm write interest.
    Respond,
    /// Encoding failed; the connection is unusable.
    Fatal,
}

/// Result of draining the write buffer once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Socket would block; re-arm write interest and come back.
    Blocked,
    /// Response fully sent, connection reset for the next request.
    KeepAlive,
    /// Response fully sent, peer did not ask to keep the connection.
    Finished,
    /// Fatal socket error.
    Error,
}

enum LineStatus {
    Complete(Range<usize>),
    Open,
    Bad,
}

enum HeaderStep {
    More,
    Done,
    Bad,
}

pub struct Connection {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    doc_root: Arc<PathBuf>,
    et_mode: bool,

    read_buf: Box<[u8]>,
    /// High-water mark of buffered socket data.
    read_idx: usize,
    /// Parse cursor; never ahead of `read_idx`.
    checked_idx: usize,
    start_line: usize,

    state: ParseState,
    method: Method,
    url: String,
    host: Option<String>,
    content_len: usize,
    keep_alive: bool,
    body: Option<String>,

    file_path: PathBuf,
    file_map: Option<Mmap>,

    write_buf: Vec<u8>,
    bytes_to_send: usize,
    bytes_sent: usize,
}

impl Connection {
    pub fn new(
        stream: Option<TcpStream>,
        peer: SocketAddr,
        doc_root: Arc<PathBuf>,
        et_mode: bool,
    ) -> Connection {
        Connection {
            stream,
            peer,
            doc_root,
            et_mode,
            read_buf: vec![0u8; READ_BUF_SIZE].into_boxed_slice(),
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            state: ParseState::RequestLine,
            method: Method::Get,
            url: String::new(),
            host: None,
            content_len: 0,
            keep_alive: false,
            body: None,
            file_path: PathBuf::new(),
            file_map: None,
            write_buf: Vec::with_capacity(WRITE_BUF_SIZE),
            bytes_to_send: 0,
            bytes_sent: 0,
        }
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Reinitialize for the next request on the same socket. Any mapping
    /// still held is released here.
    pub fn reset(&mut self) {
        self.read_buf.fill(0);
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.state = ParseState::RequestLine;
        self.method = Method::Get;
        self.url.clear();
        self.host = None;
        self.content_len = 0;
        self.keep_alive = false;
        self.body = None;
        self.file_path = PathBuf::new();
        self.file_map = None;
        self.write_buf.clear();
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
    }

    /// Drop the socket, releasing the mapping first. Idempotent: the close
    /// path may run both from a worker and from timer expiry.
    pub fn close(&mut self) -> Option<RawFd> {
        self.file_map = None;
        self.stream.take().map(|s| s.as_raw_fd())
    }

    /// Pull whatever the socket has into the read buffer. Level-triggered
    /// mode reads once; edge-triggered mode drains until the socket would
    /// block. Returns false on EOF or a fatal error.
    pub fn read_once(&mut self) -> bool {
        if self.read_idx >= self.read_buf.len() {
            return false;
        }
        let Some(stream) = self.stream.as_ref() else {
            return false;
        };
        let mut stream: &TcpStream = stream;

        loop {
            match stream.read(&mut self.read_buf[self.read_idx..]) {
                Ok(0) => return false,
                Ok(n) => {
                    self.read_idx += n;
                    if !self.et_mode {
                        return true;
                    }
                    if self.read_idx >= self.read_buf.len() {
                        return true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("read from {} failed: {e}", self.peer);
                    return false;
                }
            }
        }
    }

    /// Copy bytes straight into the read buffer, as if read from the socket.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let room = self.read_buf.len() - self.read_idx;
        let n = room.min(bytes.len());
        self.read_buf[self.read_idx..self.read_idx + n].copy_from_slice(&bytes[..n]);
        self.read_idx += n;
        n
    }

    /// Run the parse-route-encode pipeline over the buffered data.
    pub fn process(&mut self, db: &UserDb) -> ProcessAction {
        match self.process_read(db) {
            RequestOutcome::Incomplete => ProcessAction::AwaitMore,
            outcome => {
                if self.build_response(outcome) {
                    ProcessAction::Respond
                } else {
                    ProcessAction::Fatal
                }
            }
        }
    }

    /// Advance the request parser as far as the buffered bytes allow.
    pub fn process_read(&mut self, db: &UserDb) -> RequestOutcome {
        loop {
            if self.state == ParseState::Body {
                if self.checked_idx + self.content_len > self.read_idx {
                    return RequestOutcome::Incomplete;
                }
                let range = self.checked_idx..self.checked_idx + self.content_len;
                let body = match std::str::from_utf8(&self.read_buf[range]) {
                    Ok(body) => body.to_string(),
                    Err(_) => return RequestOutcome::BadRequest,
                };
                self.checked_idx += self.content_len;
                self.body = Some(body);
                return self.dispatch(db);
            }

            let range = match self.parse_line() {
                LineStatus::Open => return RequestOutcome::Incomplete,
                LineStatus::Bad => return RequestOutcome::BadRequest,
                LineStatus::Complete(range) => range,
            };
            let line = match std::str::from_utf8(&self.read_buf[range]) {
                Ok(line) => line.to_string(),
                Err(_) => return RequestOutcome::BadRequest,
            };
            log::debug!("{}: {line}", self.peer);

            match self.state {
                ParseState::RequestLine => {
                    if !self.parse_request_line(&line) {
                        return RequestOutcome::BadRequest;
                    }
                }
                ParseState::Headers => match self.parse_header(&line) {
                    HeaderStep::More => {}
                    HeaderStep::Done => return self.dispatch(db),
                    HeaderStep::Bad => return RequestOutcome::BadRequest,
                },
                ParseState::Body => return RequestOutcome::Internal,
            }
        }
    }

    /// Scan for the next CRLF-terminated line starting at the parse cursor.
    /// The terminator bytes are overwritten with NUL in place and the cursor
    /// moves past them. A CR sitting at the fill boundary means "more data";
    /// a stray CR or LF is a syntax error.
    fn parse_line(&mut self) -> LineStatus {
        let mut i = self.checked_idx;
        while i < self.read_idx {
            match self.read_buf[i] {
                b'\r' => {
                    if i + 1 == self.read_idx {
                        self.checked_idx = i;
                        return LineStatus::Open;
                    }
                    if self.read_buf[i + 1] == b'\n' {
                        let line = self.start_line..i;
                        self.read_buf[i] = 0;
                        self.read_buf[i + 1] = 0;
                        self.checked_idx = i + 2;
                        self.start_line = self.checked_idx;
                        return LineStatus::Complete(line);
                    }
                    return LineStatus::Bad;
                }
                b'\n' => {
                    if i >= 1 && self.read_buf[i - 1] == b'\r' {
                        let line = self.start_line..i - 1;
                        self.read_buf[i - 1] = 0;
                        self.read_buf[i] = 0;
                        self.checked_idx = i + 1;
                        self.start_line = self.checked_idx;
                        return LineStatus::Complete(line);
                    }
                    return LineStatus::Bad;
                }
                _ => i += 1,
            }
        }
        self.checked_idx = i;
        LineStatus::Open
    }

    /// `<method> <url> <version>`; only GET/POST and HTTP/1.1 are accepted.
    fn parse_request_line(&mut self, line: &str) -> bool {
        let mut parts = line.split_ascii_whitespace();
        let (Some(method), Some(url), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        if parts.next().is_some() {
            return false;
        }

        if method.eq_ignore_ascii_case("GET") {
            self.method = Method::Get;
        } else if method.eq_ignore_ascii_case("POST") {
            self.method = Method::Post;
        } else {
            return false;
        }

        if !version.eq_ignore_ascii_case("HTTP/1.1") {
            return false;
        }

        let url = strip_scheme(url, "http://")
            .or_else(|| strip_scheme(url, "https://"))
            .unwrap_or(Some(url))
            .unwrap_or("");
        if !url.starts_with('/') {
            return false;
        }
        self.url = if url == "/" { route::LANDING_PAGE.to_string() } else { url.to_string() };

        self.state = ParseState::Headers;
        true
    }

    /// One header line; the empty line ends the block.
    fn parse_header(&mut self, line: &str) -> HeaderStep {
        if line.is_empty() {
            if self.content_len != 0 {
                // The declared body must fit in what is left of the read
                // buffer, or it can never be received.
                if self.content_len > self.read_buf.len() - self.checked_idx {
                    return HeaderStep::Bad;
                }
                self.state = ParseState::Body;
                return HeaderStep::More;
            }
            return HeaderStep::Done;
        }
        if let Some(value) = header_value(line, "Connection") {
            self.keep_alive = value.eq_ignore_ascii_case("keep-alive");
        } else if let Some(value) = header_value(line, "Content-Length") {
            match value.parse::<usize>() {
                Ok(len) => self.content_len = len,
                Err(_) => return HeaderStep::Bad,
            }
        } else if let Some(value) = header_value(line, "Host") {
            self.host = Some(value.to_string());
        } else {
            log::debug!("ignoring unknown header: {line}");
        }
        HeaderStep::More
    }

    /// Resolve the parsed request against the document root and map the file.
    fn dispatch(&mut self, db: &UserDb) -> RequestOutcome {
        let target = match route::resolve(self.method, &self.url, self.body.as_deref(), db) {
            Ok(target) => target,
            Err(_) => return RequestOutcome::BadRequest,
        };
        let path = self.doc_root.join(target.trim_start_matches('/'));
        if path.as_os_str().len() > MAX_PATH_LEN {
            return RequestOutcome::NoResource;
        }

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return RequestOutcome::NoResource,
        };
        if meta.permissions().mode() & 0o004 == 0 {
            return RequestOutcome::Forbidden;
        }
        if meta.is_dir() {
            return RequestOutcome::BadRequest;
        }

        self.file_path = path;
        if meta.len() == 0 {
            self.file_map = None;
            return RequestOutcome::FileReady;
        }
        let file = match File::open(&self.file_path) {
            Ok(file) => file,
            Err(_) => return RequestOutcome::NoResource,
        };
        match unsafe { Mmap::map(&file) } {
            Ok(map) => {
                self.file_map = Some(map);
                RequestOutcome::FileReady
            }
            Err(e) => {
                log::error!("mmap of {} failed: {e}", self.file_path.display());
                RequestOutcome::Internal
            }
        }
    }

    /// Encode the status line, headers and (for errors or empty files) the
    /// body into the write buffer. File bodies stay in the mapping and go
    /// out as the second element of the vectored write.
    fn build_response(&mut self, outcome: RequestOutcome) -> bool {
        let ok = match outcome {
            RequestOutcome::FileReady => {
                let file_len = self.file_map.as_ref().map(|m| m.len());
                match file_len {
                    Some(len) => {
                        self.add_status(200) && self.add_headers(len)
                    }
                    None => {
                        self.add_status(200)
                            && self.add_headers(OK_EMPTY_BODY.len())
                            && self.add_content(OK_EMPTY_BODY)
                    }
                }
            }
            RequestOutcome::BadRequest => {
                // Protocol errors never reuse the connection.
                self.keep_alive = false;
                self.add_error(400, ERROR_400_BODY)
            }
            RequestOutcome::Forbidden => self.add_error(403, ERROR_403_BODY),
            RequestOutcome::NoResource => self.add_error(404, ERROR_404_BODY),
            RequestOutcome::Internal | RequestOutcome::Incomplete => {
                self.keep_alive = false;
                self.add_error(500, ERROR_500_BODY)
            }
        };
        if !ok {
            return false;
        }
        self.bytes_to_send =
            self.write_buf.len() + self.file_map.as_ref().map(|m| m.len()).unwrap_or(0);
        self.bytes_sent = 0;
        true
    }

    /// Push queued response bytes to the socket with a gathered write:
    /// element 0 is the unsent tail of the write buffer, element 1 the
    /// unsent tail of the mapped file.
    pub fn write_once(&mut self) -> WriteStatus {
        if self.stream.is_none() {
            return WriteStatus::Error;
        }
        if self.bytes_to_send == 0 {
            // Spurious write readiness after the response already drained.
            return WriteStatus::KeepAlive;
        }

        loop {
            let sent = {
                let stream = self.stream.as_ref().expect("checked above");
                let header = &self.write_buf;
                let file: &[u8] = self.file_map.as_deref().unwrap_or(&[]);
                let result = if self.bytes_sent < header.len() {
                    let iov = [IoSlice::new(&header[self.bytes_sent..]), IoSlice::new(file)];
                    writev(stream, &iov)
                } else {
                    let file_off = self.bytes_sent - header.len();
                    let iov = [IoSlice::new(&file[file_off..])];
                    writev(stream, &iov)
                };
                match result {
                    Ok(n) => n,
                    Err(Errno::EAGAIN) => return WriteStatus::Blocked,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        log::warn!("write to {} failed: {e}", self.peer);
                        self.file_map = None;
                        return WriteStatus::Error;
                    }
                }
            };
            self.bytes_sent += sent;
            self.bytes_to_send -= sent.min(self.bytes_to_send);

            if self.bytes_to_send == 0 {
                self.file_map = None;
                return if self.keep_alive { WriteStatus::KeepAlive } else { WriteStatus::Finished };
            }
        }
    }

    /// Encoded response bytes pending in the write buffer.
    pub fn pending_response(&self) -> &[u8] {
        &self.write_buf
    }

    pub fn mapped_file(&self) -> Option<&[u8]> {
        self.file_map.as_deref()
    }

    pub fn resolved_path(&self) -> &PathBuf {
        &self.file_path
    }

    fn add_error(&mut self, status: u16, body: &str) -> bool {
        self.file_map = None;
        self.add_status(status) && self.add_headers(body.len()) && self.add_content(body)
    }

    fn add_status(&mut self, status: u16) -> bool {
        self.push_fmt(format_args!("HTTP/1.1 {status} {}\r\n", reason_phrase(status)))
    }

    fn add_headers(&mut self, content_len: usize) -> bool {
        let conn = if self.keep_alive { "keep-alive" } else { "close" };
        self.push_fmt(format_args!("Content-Length: {content_len}\r\n"))
            && self.push_fmt(format_args!("Connection: {conn}\r\n"))
            && self.push_fmt(format_args!("\r\n"))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.push_fmt(format_args!("{content}"))
    }

    /// Append formatted bytes, respecting the fixed write-buffer capacity.
    fn push_fmt(&mut self, args: std::fmt::Arguments) -> bool {
        let before = self.write_buf.len();
        if self.write_buf.write_fmt(args).is_err() {
            return false;
        }
        if self.write_buf.len() > WRITE_BUF_SIZE {
            log::warn!("response for {} overflows the write buffer", self.peer);
            self.write_buf.truncate(before);
            return false;
        }
        true
    }
}

/// Strip `scheme://authority`, keeping the path. Returns `None` when the
/// scheme does not match, `Some(None)` when there is no path after it.
fn strip_scheme<'a>(url: &'a str, scheme: &str) -> Option<Option<&'a str>> {
    if url.len() < scheme.len() || !url[..scheme.len()].eq_ignore_ascii_case(scheme) {
        return None;
    }
    let rest = &url[scheme.len()..];
    Some(rest.find('/').map(|at| &rest[at..]))
}

/// Value of a `Name: value` header line, matched case-insensitively.
fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    if line.len() <= name.len() || !line[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    let rest = &line[name.len()..];
    let value = rest.strip_prefix(':')?;
    Some(value.trim())
}

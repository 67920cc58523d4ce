// src/conn.rs
//! Per-socket HTTP/1.1 state machine.
//!
//! A [`Connection`] owns a fixed read buffer that is parsed incrementally
//! (line sub-machine feeding a request-line / header / content main machine),
//! a fixed write buffer holding the status line and headers, and an optional
//! memory-mapped file that is sent straight from the mapping with a
//! two-segment vectored write.

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::net::SocketAddr;
use std::ops::Range;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libc::c_int;
use tracing::{debug, error, trace, warn};

use crate::http::{EMPTY_DOCUMENT, HttpCode, Method, OK_200, Version};
use crate::metrics::Metrics;
use crate::mmap::MappedFile;
use crate::parser::{self, Header, LineStatus};
use crate::syscalls::{self, Interest};

pub const READ_BUF_SIZE: usize = 2048;
pub const WRITE_BUF_SIZE: usize = 1024;
/// Upper bound on document root + request path, in bytes.
pub const FILENAME_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    RequestLine,
    Header,
    Content,
}

/// What the connection needs next from the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Re-arm for readability.
    Read,
    /// Re-arm for writability.
    Write,
    /// Tear the connection down.
    Close,
}

impl Next {
    pub fn interest(self) -> Option<Interest> {
        match self {
            Next::Read => Some(Interest::Readable),
            Next::Write => Some(Interest::Writable),
            Next::Close => None,
        }
    }
}

fn shift(r: Range<usize>, by: usize) -> Range<usize> {
    r.start + by..r.end + by
}

fn has_parent_segment(url: &[u8]) -> bool {
    url.split(|&b| b == b'/').any(|seg| seg == b"..")
}

pub struct Connection {
    fd: c_int,
    peer: Option<SocketAddr>,
    doc_root: Arc<Path>,
    metrics: Arc<Metrics>,

    read_buf: [u8; READ_BUF_SIZE],
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,

    write_buf: [u8; WRITE_BUF_SIZE],
    write_idx: usize,
    iv_count: usize,
    bytes_sent: usize,

    check_state: CheckState,
    method: Method,
    url: Option<Range<usize>>,
    version: Option<Version>,
    host: Option<Range<usize>>,
    content_length: usize,
    body_start: usize,
    keep_alive: bool,

    real_file: PathBuf,
    file: Option<MappedFile>,
}

impl Connection {
    /// A closed connection slot serving files below `doc_root`.
    pub fn new(doc_root: Arc<Path>, metrics: Arc<Metrics>) -> Self {
        Self {
            fd: -1,
            peer: None,
            doc_root,
            metrics,
            read_buf: [0; READ_BUF_SIZE],
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            write_buf: [0; WRITE_BUF_SIZE],
            write_idx: 0,
            iv_count: 0,
            bytes_sent: 0,
            check_state: CheckState::RequestLine,
            method: Method::Get,
            url: None,
            version: None,
            host: None,
            content_length: 0,
            body_start: 0,
            keep_alive: false,
            real_file: PathBuf::new(),
            file: None,
        }
    }

    /// Binds an accepted socket to this connection. The connection takes
    /// ownership of `fd` and closes it in [`Connection::close`].
    pub fn init(&mut self, fd: c_int, peer: Option<SocketAddr>) {
        self.fd = fd;
        self.peer = peer;
        self.metrics.inc_conn();
        self.reset();
    }

    /// Clears all parse, write and resource state for the next request.
    fn reset(&mut self) {
        self.check_state = CheckState::RequestLine;
        self.keep_alive = false;

        self.method = Method::Get;
        self.url = None;
        self.version = None;
        self.host = None;
        self.content_length = 0;
        self.body_start = 0;
        self.start_line = 0;
        self.checked_idx = 0;
        self.read_idx = 0;
        self.write_idx = 0;
        self.iv_count = 0;
        self.bytes_sent = 0;

        self.read_buf.fill(0);
        self.write_buf.fill(0);
        self.real_file = PathBuf::new();
        self.unmap();
    }

    /// Releases the socket. With `real_close == false` only the mapping is
    /// released and the descriptor stays open.
    pub fn close(&mut self, real_close: bool) {
        self.unmap();
        if real_close && self.fd != -1 {
            syscalls::close_fd(self.fd);
            self.fd = -1;
            self.metrics.dec_conn();
        }
    }

    // ---- accessors ----

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        self.fd != -1
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn check_state(&self) -> CheckState {
        self.check_state
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn url(&self) -> Option<&[u8]> {
        self.url.clone().map(|r| &self.read_buf[r])
    }

    pub fn host(&self) -> Option<&[u8]> {
        self.host.clone().map(|r| &self.read_buf[r])
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Request body, once fully buffered.
    pub fn body(&self) -> Option<&[u8]> {
        if self.check_state != CheckState::Content
            || self.read_idx - self.body_start < self.content_length
        {
            return None;
        }
        Some(&self.read_buf[self.body_start..self.body_start + self.content_length])
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn real_file(&self) -> &Path {
        &self.real_file
    }

    pub fn is_mapped(&self) -> bool {
        self.file.is_some()
    }

    /// The active scatter-write segments: header bytes and, for a file
    /// response, the mapped file.
    pub fn segments(&self) -> (&[u8], &[u8]) {
        let body = match (&self.file, self.iv_count) {
            (Some(f), 2) => f.as_slice(),
            _ => &[][..],
        };
        (&self.write_buf[..self.write_idx], body)
    }

    // ---- read side ----

    /// Drains the socket into the read buffer until it would block.
    /// Returns false when the peer closed, on error, or when the buffer was
    /// already full.
    pub fn read(&mut self) -> bool {
        if self.read_idx >= READ_BUF_SIZE {
            return false;
        }
        while self.read_idx < READ_BUF_SIZE {
            match syscalls::read_nonblocking(self.fd, &mut self.read_buf[self.read_idx..]) {
                Ok(None) => break,
                Ok(Some(0)) => return false,
                Ok(Some(n)) => self.read_idx += n,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "read failed");
                    return false;
                }
            }
        }
        true
    }

    fn parse_line(&mut self) -> LineStatus {
        let (status, idx) = parser::parse_line(&self.read_buf[..self.read_idx], self.checked_idx);
        self.checked_idx = idx;
        status
    }

    /// Main state machine: consumes whole lines until the request is
    /// complete, malformed, or more bytes are needed.
    pub fn process_read(&mut self) -> HttpCode {
        loop {
            if self.check_state == CheckState::Content {
                return match self.parse_content() {
                    HttpCode::GetRequest => self.do_request(),
                    other => other,
                };
            }

            match self.parse_line() {
                LineStatus::Ok => {}
                LineStatus::Open => return HttpCode::NoRequest,
                LineStatus::Bad => {
                    debug!(fd = self.fd, "malformed line terminator");
                    return HttpCode::BadRequest;
                }
            }

            let line = self.start_line..self.checked_idx - 2;
            self.start_line = self.checked_idx;
            trace!(line = %self.read_buf[line.clone()].escape_ascii(), "got 1 http line");

            let ret = match self.check_state {
                CheckState::RequestLine => self.parse_request_line(line),
                CheckState::Header => self.parse_headers(line),
                CheckState::Content => HttpCode::InternalError,
            };
            match ret {
                HttpCode::NoRequest => {}
                HttpCode::GetRequest => return self.do_request(),
                other => return other,
            }
        }
    }

    fn parse_request_line(&mut self, line: Range<usize>) -> HttpCode {
        match parser::parse_request_line(&self.read_buf[line.clone()]) {
            Ok(rl) => {
                self.method = rl.method;
                self.url = Some(shift(rl.url, line.start));
                self.version = Some(rl.version);
                self.check_state = CheckState::Header;
                HttpCode::NoRequest
            }
            Err(e) => {
                debug!(fd = self.fd, error = ?e, "rejecting request line");
                HttpCode::BadRequest
            }
        }
    }

    fn parse_headers(&mut self, line: Range<usize>) -> HttpCode {
        match parser::parse_header(&self.read_buf[line.clone()]) {
            Header::End => {
                if self.content_length != 0 {
                    self.check_state = CheckState::Content;
                    self.body_start = self.checked_idx;
                    return HttpCode::NoRequest;
                }
                return HttpCode::GetRequest;
            }
            Header::Connection { keep_alive } => {
                if keep_alive {
                    self.keep_alive = true;
                }
            }
            Header::ContentLength(n) => self.content_length = n,
            Header::Host(r) => self.host = Some(shift(r, line.start)),
            Header::Unknown => {
                debug!(header = %self.read_buf[line].escape_ascii(), "unknown header");
            }
        }
        HttpCode::NoRequest
    }

    fn parse_content(&mut self) -> HttpCode {
        if self.read_idx - self.body_start >= self.content_length {
            HttpCode::GetRequest
        } else {
            HttpCode::NoRequest
        }
    }

    /// Resolves the request path below the document root and maps the file.
    fn do_request(&mut self) -> HttpCode {
        let Some(url) = self.url.clone() else {
            return HttpCode::BadRequest;
        };
        let url = &self.read_buf[url];
        if has_parent_segment(url) {
            warn!(fd = self.fd, url = %url.escape_ascii(), "path traversal rejected");
            return HttpCode::ForbiddenRequest;
        }

        let limit = FILENAME_LEN - 1;
        let root = self.doc_root.as_os_str().as_bytes();
        let mut real = Vec::with_capacity(limit);
        real.extend_from_slice(&root[..root.len().min(limit)]);
        let room = limit - real.len();
        real.extend_from_slice(&url[..url.len().min(room)]);
        self.real_file = PathBuf::from(OsString::from_vec(real));

        let meta = match fs::metadata(&self.real_file) {
            Ok(m) => m,
            Err(_) => return HttpCode::NoResource,
        };
        if meta.permissions().mode() & libc::S_IROTH == 0 {
            return HttpCode::ForbiddenRequest;
        }
        if !meta.is_file() {
            return HttpCode::BadRequest;
        }

        // Non-blocking so a file swapped for a FIFO after the stat cannot
        // stall the worker.
        let file = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.real_file)
        {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %self.real_file.display(), error = %e, "open failed");
                return HttpCode::InternalError;
            }
        };
        let len = match file.metadata() {
            Ok(m) if !m.is_file() => return HttpCode::BadRequest,
            Ok(m) => match usize::try_from(m.len()) {
                Ok(len) => len,
                Err(_) => return HttpCode::InternalError,
            },
            Err(_) => return HttpCode::InternalError,
        };
        if len == 0 {
            return HttpCode::FileRequest;
        }

        match MappedFile::map(&file, len) {
            Ok(map) => {
                self.file = Some(map);
                HttpCode::FileRequest
            }
            Err(e) => {
                error!(path = %self.real_file.display(), error = %e, "mmap failed");
                HttpCode::InternalError
            }
        }
    }

    fn unmap(&mut self) {
        self.file = None;
    }

    // ---- response assembly ----

    /// Bounded formatted append; leaves `write_idx` untouched on overflow.
    fn add_response(&mut self, args: fmt::Arguments<'_>) -> bool {
        let mut rest = &mut self.write_buf[self.write_idx..];
        let before = rest.len();
        if rest.write_fmt(args).is_err() {
            return false;
        }
        let written = before - rest.len();
        self.write_idx += written;
        true
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.add_response(format_args!("HTTP/1.1 {} {}\r\n", status, title))
    }

    fn add_headers(&mut self, content_len: usize) -> bool {
        self.add_content_length(content_len) && self.add_linger() && self.add_blank_line()
    }

    fn add_content_length(&mut self, content_len: usize) -> bool {
        self.add_response(format_args!("Content-Length: {}\r\n", content_len))
    }

    fn add_linger(&mut self) -> bool {
        let value = if self.keep_alive { "keep-alive" } else { "close" };
        self.add_response(format_args!("Connection: {}\r\n", value))
    }

    fn add_blank_line(&mut self) -> bool {
        self.add_response(format_args!("\r\n"))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.add_response(format_args!("{}", content))
    }

    /// Builds the response for `ret` and sets up the write segments.
    fn process_write(&mut self, ret: HttpCode) -> bool {
        match ret {
            HttpCode::FileRequest => {
                let file_len = self.file.as_ref().map_or(0, |f| f.len());
                if file_len != 0 {
                    if !(self.add_status_line(OK_200.code, OK_200.title)
                        && self.add_headers(file_len))
                    {
                        return false;
                    }
                    self.iv_count = 2;
                    return true;
                }
                if !(self.add_status_line(OK_200.code, OK_200.title)
                    && self.add_headers(EMPTY_DOCUMENT.len())
                    && self.add_content(EMPTY_DOCUMENT))
                {
                    return false;
                }
            }
            other => {
                let Some(status) = other.error_status() else {
                    return false;
                };
                if !(self.add_status_line(status.code, status.title)
                    && self.add_headers(status.form.len())
                    && self.add_content(status.form))
                {
                    return false;
                }
            }
        }
        self.iv_count = 1;
        true
    }

    /// Worker entry point: parse what has been read and, if a request is
    /// complete, assemble its response.
    pub fn process(&mut self) -> Next {
        let read_ret = self.process_read();
        if read_ret == HttpCode::NoRequest {
            return Next::Read;
        }
        self.metrics.inc_req();
        debug!(
            fd = self.fd,
            outcome = ?read_ret,
            url = %self.url().unwrap_or_default().escape_ascii(),
            "request parsed"
        );

        if !self.process_write(read_ret) {
            self.unmap();
            self.write_idx = 0;
            self.iv_count = 0;
            if !self.process_write(HttpCode::InternalError) {
                warn!(fd = self.fd, "response does not fit the write buffer");
                return Next::Close;
            }
        }
        Next::Write
    }

    // ---- write side ----

    fn pending_segments(&self) -> (&[u8], &[u8]) {
        let (head, body) = self.segments();
        let head_sent = self.bytes_sent.min(head.len());
        let body_sent = self.bytes_sent - head_sent;
        (&head[head_sent..], &body[body_sent..])
    }

    /// Flushes the response without re-sending bytes already written.
    pub fn write(&mut self) -> Next {
        let (head, body) = self.segments();
        let total = head.len() + body.len();
        if total == 0 {
            self.reset();
            return Next::Read;
        }

        loop {
            let (head, body) = self.pending_segments();
            match syscalls::writev_nonblocking(self.fd, &[head, body]) {
                Ok(Some(0)) | Ok(None) => return Next::Write,
                Ok(Some(n)) => {
                    self.bytes_sent += n;
                    self.metrics.add_bytes(n);
                }
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "write failed");
                    self.unmap();
                    return Next::Close;
                }
            }

            if self.bytes_sent >= total {
                self.unmap();
                if self.keep_alive {
                    self.reset();
                    return Next::Read;
                }
                return Next::Close;
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close(true);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("check_state", &self.check_state)
            .field("read_idx", &self.read_idx)
            .field("checked_idx", &self.checked_idx)
            .field("write_idx", &self.write_idx)
            .field("bytes_sent", &self.bytes_sent)
            .field("keep_alive", &self.keep_alive)
            .field("mapped", &self.file.as_ref().map(|f| f.len()))
            .finish()
    }
}

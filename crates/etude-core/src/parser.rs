// src/parser.rs
//! Stateless pieces of the request parser. The connection owns the cursors
//! and the main state machine; these functions only look at byte slices and
//! report ranges relative to the slice they were given.

use std::ops::Range;

use memchr::memchr2;

use crate::http::{Method, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full CRLF-terminated line is available.
    Ok,
    /// Malformed line terminator.
    Bad,
    /// Need more bytes.
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    InvalidFormat,
    UnsupportedMethod,
    UnsupportedVersion,
    InvalidUrl,
}

/// Scans `buf[checked_idx..]` for the end of the current line.
///
/// Returns the status and the new cursor. On `Ok` the cursor sits just past
/// the `\r\n`; on `Open` it sits on the first byte that must be re-examined
/// once more data arrives (the buffer end, or a trailing lone `\r`).
pub fn parse_line(buf: &[u8], checked_idx: usize) -> (LineStatus, usize) {
    let Some(off) = memchr2(b'\r', b'\n', &buf[checked_idx..]) else {
        return (LineStatus::Open, buf.len());
    };
    let pos = checked_idx + off;

    if buf[pos] == b'\n' {
        return (LineStatus::Bad, pos);
    }
    match buf.get(pos + 1) {
        None => (LineStatus::Open, pos),
        Some(b'\n') => (LineStatus::Ok, pos + 2),
        Some(_) => (LineStatus::Bad, pos),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    /// Path component, relative to the parsed line.
    pub url: Range<usize>,
    pub version: Version,
}

#[inline]
fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn skip_blanks(line: &[u8], mut pos: usize) -> usize {
    while pos < line.len() && is_blank(line[pos]) {
        pos += 1;
    }
    pos
}

fn find_blank(line: &[u8], from: usize) -> Option<usize> {
    line[from..].iter().position(|&b| is_blank(b)).map(|p| from + p)
}

/// Parses `<METHOD> <url> <version>`. Only `GET` and `HTTP/1.1` are accepted.
/// An absolute `http://host/path` URL is reduced to its path.
pub fn parse_request_line(line: &[u8]) -> Result<RequestLine, ParseError> {
    let method_end = find_blank(line, 0).ok_or(ParseError::InvalidFormat)?;
    let method = Method::from_bytes(&line[..method_end]);
    if method != Method::Get {
        return Err(ParseError::UnsupportedMethod);
    }

    let mut url_start = skip_blanks(line, method_end);
    let url_end = find_blank(line, url_start).ok_or(ParseError::InvalidFormat)?;

    let version_start = skip_blanks(line, url_end);
    let version =
        Version::from_bytes(&line[version_start..]).ok_or(ParseError::UnsupportedVersion)?;

    let url = &line[url_start..url_end];
    if url.len() >= 7 && url[..7].eq_ignore_ascii_case(b"http://") {
        let authority = url_start + 7;
        let slash = line[authority..url_end]
            .iter()
            .position(|&b| b == b'/')
            .ok_or(ParseError::InvalidUrl)?;
        url_start = authority + slash;
    }

    if line.get(url_start) != Some(&b'/') || url_start >= url_end {
        return Err(ParseError::InvalidUrl);
    }

    Ok(RequestLine {
        method,
        url: url_start..url_end,
        version,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// The blank line closing the header section.
    End,
    Connection { keep_alive: bool },
    ContentLength(usize),
    /// Host value, relative to the parsed line.
    Host(Range<usize>),
    Unknown,
}

fn strip_name<'a>(line: &'a [u8], name: &[u8]) -> Option<usize> {
    if line.len() >= name.len() && line[..name.len()].eq_ignore_ascii_case(name) {
        Some(skip_blanks(line, name.len()))
    } else {
        None
    }
}

/// Leading decimal digits, saturating; no digits yields zero.
fn parse_length(value: &[u8]) -> usize {
    value
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0usize, |acc, &b| {
            acc.saturating_mul(10).saturating_add((b - b'0') as usize)
        })
}

pub fn parse_header(line: &[u8]) -> Header {
    if line.is_empty() {
        return Header::End;
    }
    if let Some(v) = strip_name(line, b"Connection:") {
        return Header::Connection {
            keep_alive: line[v..].eq_ignore_ascii_case(b"keep-alive"),
        };
    }
    if let Some(v) = strip_name(line, b"Content-Length:") {
        return Header::ContentLength(parse_length(&line[v..]));
    }
    if let Some(v) = strip_name(line, b"Host:") {
        return Header::Host(v..line.len());
    }
    Header::Unknown
}

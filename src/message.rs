// Copyright (C) 2024 the macula authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP 1.0 wire model: methods, status codes, headers, and the text codec.
//!
//! Framing follows [RFC 2326 section 4](https://datatracker.ietf.org/doc/html/rfc2326#section-4):
//! an ASCII start line, `Name: value` header lines, an empty line, then a
//! body whose length is given by `Content-Length`. The parser is lenient
//! about bare `LF` line endings; the serializer always emits `CRLF`.
//! Interleaved `$`-framed binary data is handled separately by the
//! connection codec in `crate::tokio`.

use bytes::{Bytes, BytesMut};
use url::Url;

/// Maximum accepted length of a start line or header line, in bytes.
///
/// Longer lines are rejected as a framing error rather than buffered
/// indefinitely.
pub(crate) const MAX_LINE_LEN: usize = 4096;

/// Well-known header names.
///
/// Lookup is case-insensitive; these constants exist so callers spell the
/// canonical form consistently.
pub mod headers {
    pub const ACCEPT: &str = "Accept";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const CONTENT_BASE: &str = "Content-Base";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_LOCATION: &str = "Content-Location";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const CSEQ: &str = "CSeq";
    pub const LOCATION: &str = "Location";
    pub const PUBLIC: &str = "Public";
    pub const RANGE: &str = "Range";
    pub const RTP_INFO: &str = "RTP-Info";
    pub const SESSION: &str = "Session";
    pub const TRANSPORT: &str = "Transport";
    pub const USER_AGENT: &str = "User-Agent";
    pub const WWW_AUTHENTICATE: &str = "WWW-Authenticate";
}

/// An RTSP request method, as defined in RFC 2326 section 10.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Options,
    Describe,
    Announce,
    Setup,
    Play,
    Record,
    Pause,
    Teardown,
    GetParameter,
    SetParameter,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Announce => "ANNOUNCE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Record => "RECORD",
            Method::Pause => "PAUSE",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
        }
    }

    pub(crate) fn parse_token(s: &str) -> Option<Self> {
        Some(match s {
            "OPTIONS" => Method::Options,
            "DESCRIBE" => Method::Describe,
            "ANNOUNCE" => Method::Announce,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "RECORD" => Method::Record,
            "PAUSE" => Method::Pause,
            "TEARDOWN" => Method::Teardown,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// An RTSP response status code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const MOVED_PERMANENTLY: StatusCode = StatusCode(301);
    pub const FOUND: StatusCode = StatusCode(302);
    pub const SEE_OTHER: StatusCode = StatusCode(303);
    pub const USE_PROXY: StatusCode = StatusCode(305);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const SESSION_NOT_FOUND: StatusCode = StatusCode(454);
    pub const METHOD_NOT_VALID: StatusCode = StatusCode(455);
    pub const UNSUPPORTED_TRANSPORT: StatusCode = StatusCode(461);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);

    #[inline]
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }

    /// True for the redirect codes the client chases (301, 302, 303, 305).
    #[inline]
    pub fn is_redirect(self) -> bool {
        matches!(self.0, 301 | 302 | 303 | 305)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// An insertion-ordered multimap of header names to values.
///
/// Name lookup is ASCII case-insensitive; stored names and values keep the
/// form they were inserted with, and serialization emits them verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderMap(Vec<(String, Vec<String>)>);

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Appends a value, keeping any values already present under `name`.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(i) => self.0[i].1.push(value.into()),
            None => self.0.push((name, vec![value.into()])),
        }
    }

    /// Replaces all values of `name` with the single given value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(i) => self.0[i].1 = vec![value.into()],
            None => self.0.push((name, vec![value.into()])),
        }
    }

    /// Returns the first value of `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .and_then(|i| self.0[i].1.first())
            .map(String::as_str)
    }

    /// Returns all values of `name` in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, vs)| vs.iter().map(String::as_str))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Iterates over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(n, vs)| vs.iter().map(move |v| (n.as_str(), v.as_str())))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serializes header lines followed by the blank separator line.
    ///
    /// `CSeq` is emitted first and `User-Agent` second regardless of where
    /// they were inserted; the remaining headers follow in insertion order.
    /// `Content-Length` is derived from `body_len`, never from the map.
    fn write_to(&self, body_len: usize, dst: &mut BytesMut) {
        let special =
            |n: &str| n.eq_ignore_ascii_case(headers::CSEQ) || n.eq_ignore_ascii_case(headers::USER_AGENT);
        for name in [headers::CSEQ, headers::USER_AGENT] {
            if let Some(i) = self.position(name) {
                let (n, vs) = &self.0[i];
                for v in vs {
                    write_header_line(n, v, dst);
                }
            }
        }
        for (n, vs) in &self.0 {
            if special(n) || n.eq_ignore_ascii_case(headers::CONTENT_LENGTH) {
                continue;
            }
            for v in vs {
                write_header_line(n, v, dst);
            }
        }
        if body_len > 0 {
            write_header_line(headers::CONTENT_LENGTH, &body_len.to_string(), dst);
        }
        dst.extend_from_slice(b"\r\n");
    }
}

fn write_header_line(name: &str, value: &str, dst: &mut BytesMut) {
    dst.extend_from_slice(name.as_bytes());
    dst.extend_from_slice(b": ");
    dst.extend_from_slice(value.as_bytes());
    dst.extend_from_slice(b"\r\n");
}

/// An RTSP request.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Builder-style header insertion.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub(crate) fn write_to(&self, dst: &mut BytesMut) {
        dst.extend_from_slice(self.method.as_str().as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(self.url.as_str().as_bytes());
        dst.extend_from_slice(b" RTSP/1.0\r\n");
        self.headers.write_to(self.body.len(), dst);
        dst.extend_from_slice(&self.body);
    }
}

/// An RTSP response.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub(crate) fn write_to(&self, dst: &mut BytesMut) {
        dst.extend_from_slice(b"RTSP/1.0 ");
        dst.extend_from_slice(self.status.0.to_string().as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(self.reason.as_bytes());
        dst.extend_from_slice(b"\r\n");
        self.headers.write_to(self.body.len(), dst);
        dst.extend_from_slice(&self.body);
    }
}

/// An interleaved binary data frame: `$`, channel id, 16-bit length, payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Data {
    pub channel_id: u8,
    pub payload: Bytes,
}

/// Any message that can cross an RTSP connection.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Data(Data),
}

/// One scanned line: the content range (CR/LF excluded) and the offset just
/// past the terminator. `Ok(None)` means the line is still incomplete.
fn scan_line(src: &[u8], start: usize) -> Result<Option<(std::ops::Range<usize>, usize)>, String> {
    let limit = std::cmp::min(start + MAX_LINE_LEN, src.len());
    match src[start..limit].iter().position(|&b| b == b'\n') {
        Some(i) => {
            let nl = start + i;
            let end = if nl > start && src[nl - 1] == b'\r' {
                nl - 1
            } else {
                nl
            };
            Ok(Some((start..end, nl + 1)))
        }
        None if src.len() - start >= MAX_LINE_LEN => {
            Err(format!("line longer than {MAX_LINE_LEN} bytes"))
        }
        None => Ok(None),
    }
}

fn line_str<'a>(src: &'a [u8], range: &std::ops::Range<usize>) -> Result<&'a str, String> {
    std::str::from_utf8(&src[range.clone()]).map_err(|_| "non-ASCII bytes in line".to_owned())
}

/// Incrementally parses one RTSP text message (request or response) from the
/// front of `src`.
///
/// Returns `Ok(None)` when more bytes are needed, or the parsed message and
/// the total number of bytes it occupies. `Content-Length` governs the body
/// (absent means empty) and is consumed as framing rather than kept in the
/// header map.
pub(crate) fn parse(src: &[u8]) -> Result<Option<(Message, usize)>, String> {
    let (start_line, mut pos) = match scan_line(src, 0)? {
        Some((r, next)) => (r, next),
        None => return Ok(None),
    };

    let mut headers = HeaderMap::new();
    let mut content_length = 0usize;
    loop {
        let (line, next) = match scan_line(src, pos)? {
            Some(v) => v,
            None => return Ok(None),
        };
        pos = next;
        if line.is_empty() {
            break;
        }
        let line = line_str(src, &line)?;
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("header line without colon: {line:?}"))?;
        let value = value.trim();
        if name.eq_ignore_ascii_case(headers::CONTENT_LENGTH) {
            content_length = usize::from_str_radix(value, 10)
                .map_err(|_| format!("bad Content-Length {value:?}"))?;
        } else {
            headers.add(name, value);
        }
    }

    if src.len() < pos + content_length {
        return Ok(None);
    }
    let body = Bytes::copy_from_slice(&src[pos..pos + content_length]);
    let total = pos + content_length;

    let start_line = line_str(src, &start_line)?;
    let msg = if let Some(rest) = start_line.strip_prefix("RTSP/") {
        // Status line: RTSP/1.0 SP code SP reason.
        let mut parts = rest.splitn(3, ' ');
        let _version = parts.next();
        let code = parts
            .next()
            .ok_or_else(|| format!("status line missing code: {start_line:?}"))?;
        let code = u16::from_str_radix(code, 10)
            .map_err(|_| format!("bad status code in {start_line:?}"))?;
        let reason = parts.next().unwrap_or("").to_owned();
        Message::Response(Response {
            status: StatusCode(code),
            reason,
            headers,
            body,
        })
    } else {
        // Request line: METHOD SP url SP RTSP/1.0.
        let mut parts = start_line.split(' ');
        let method = parts
            .next()
            .ok_or_else(|| "empty request line".to_owned())
            .and_then(|m| Method::parse_token(m).ok_or_else(|| format!("unknown method {m:?}")))?;
        let target = parts
            .next()
            .ok_or_else(|| format!("request line missing target: {start_line:?}"))?;
        match parts.next() {
            Some(v) if v.starts_with("RTSP/") => {}
            _ => return Err(format!("request line missing RTSP version: {start_line:?}")),
        }
        let url = Url::parse(target).map_err(|e| format!("bad request URL {target:?}: {e}"))?;
        Message::Request(Request {
            method,
            url,
            headers,
            body,
        })
    };
    Ok(Some((msg, total)))
}

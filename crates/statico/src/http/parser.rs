//! Incremental HTTP/1.1 request-header parser and response-header encoder.
//!
//! The parser does not own the bytes it parses. The connection owns a fixed
//! read buffer and hands the parser the filled prefix on every call; the
//! prefix only ever grows until [`HeaderParser::reset`]. Scanning resumes
//! where the previous call stopped, so a request delivered one byte at a time
//! costs the same as one delivered whole.
//!
//! ```text
//!  buf:  GET /a HTTP/1.1\r\nHost: x\r\nAcc
//!                                     ^ line_start   ^ scan_pos
//! ```

use std::collections::BTreeMap;

use crate::http::status::{Method, StatusCode};

/// Header name → value, last occurrence wins. Iterates in name order.
pub type HeaderMap = BTreeMap<String, String>;

/// Outcome of one [`HeaderParser::parse_request`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Header section incomplete; call again with more bytes.
    Working,
    /// Blank line seen; [`HeaderParser::request`] is available.
    Done,
    /// Malformed request line or header line.
    Error,
}

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub method: Method,
    /// Target with the leading `/` (or `http://authority/`) removed.
    pub path: String,
    pub version: String,
    pub headers: HeaderMap,
}

impl RequestHeader {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `Connection: keep-alive` was requested.
    pub fn keep_alive(&self) -> bool {
        self.header("Connection")
            .map(|v| v.len() >= 10 && v.as_bytes()[..10].eq_ignore_ascii_case(b"keep-alive"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    RequestLine,
    Headers,
    Complete,
    Failed,
}

enum Line {
    /// `[start, end)` excludes the CRLF; `colon` is the first `:` in the line.
    Ok {
        start: usize,
        end: usize,
        colon: Option<usize>,
    },
    Open,
    Bad,
}

#[derive(Debug)]
pub struct HeaderParser {
    stage: Stage,
    scan_pos: usize,
    line_start: usize,
    colon: Option<usize>,
    request: Option<RequestHeader>,
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderParser {
    pub fn new() -> Self {
        Self {
            stage: Stage::RequestLine,
            scan_pos: 0,
            line_start: 0,
            colon: None,
            request: None,
        }
    }

    /// Forget all progress and the parsed request.
    ///
    /// Binding to a different buffer is just a reset: the next call to
    /// [`parse_request`](Self::parse_request) scans the new buffer from 0.
    pub fn reset(&mut self) {
        self.stage = Stage::RequestLine;
        self.scan_pos = 0;
        self.line_start = 0;
        self.colon = None;
        self.request = None;
    }

    /// Continue parsing `buf`, the filled prefix of the read buffer.
    pub fn parse_request(&mut self, buf: &[u8]) -> ParseStatus {
        match self.stage {
            Stage::Complete => return ParseStatus::Done,
            Stage::Failed => return ParseStatus::Error,
            _ => {}
        }
        if buf.len() < self.scan_pos {
            // buffer shrank underneath us
            return self.fail();
        }

        loop {
            match self.next_line(buf) {
                Line::Open => return ParseStatus::Working,
                Line::Bad => return self.fail(),
                Line::Ok { start, end, colon } => {
                    let line = &buf[start..end];
                    let ok = match self.stage {
                        Stage::RequestLine => self.parse_request_line(line),
                        Stage::Headers if line.is_empty() => {
                            self.stage = Stage::Complete;
                            return ParseStatus::Done;
                        }
                        Stage::Headers => self.parse_header_line(line, colon.map(|c| c - start)),
                        Stage::Complete | Stage::Failed => unreachable!(),
                    };
                    if !ok {
                        return self.fail();
                    }
                }
            }
        }
    }

    /// The parsed request, once [`ParseStatus::Done`] was returned.
    pub fn request(&self) -> Option<&RequestHeader> {
        match self.stage {
            Stage::Complete => self.request.as_ref(),
            _ => None,
        }
    }

    /// Serialize a response header. See [`encode_respond_header`].
    pub fn respond_header(version: &str, status: StatusCode, headers: Option<&HeaderMap>) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        encode_respond_header(&mut out, version, status, headers);
        out
    }

    fn fail(&mut self) -> ParseStatus {
        self.stage = Stage::Failed;
        ParseStatus::Error
    }

    /// Scan forward for the next CRLF-terminated line.
    fn next_line(&mut self, buf: &[u8]) -> Line {
        while self.scan_pos < buf.len() {
            let i = self.scan_pos;
            match buf[i] {
                b':' if self.colon.is_none() => self.colon = Some(i),
                b'\n' => {
                    if i == 0 || i - 1 < self.line_start || buf[i - 1] != b'\r' {
                        return Line::Bad;
                    }
                    let line = Line::Ok {
                        start: self.line_start,
                        end: i - 1,
                        colon: self.colon.filter(|&c| c < i - 1),
                    };
                    self.scan_pos = i + 1;
                    self.line_start = i + 1;
                    self.colon = None;
                    return line;
                }
                _ => {}
            }
            self.scan_pos += 1;
        }
        Line::Open
    }

    /// `METHOD SP TARGET SP VERSION`
    fn parse_request_line(&mut self, line: &[u8]) -> bool {
        let Ok(line) = std::str::from_utf8(line) else {
            return false;
        };
        let Some((method, rest)) = line.split_once(' ') else {
            return false;
        };
        let Some(method) = Method::from_token(method) else {
            return false;
        };
        let Some((target, version)) = rest.split_once(' ') else {
            return false;
        };
        let path = if let Some(absolute) = target.strip_prefix("http://") {
            // drop the authority as well
            match absolute.find('/') {
                Some(slash) => &absolute[slash + 1..],
                None => "",
            }
        } else if let Some(origin) = target.strip_prefix('/') {
            origin
        } else {
            return false;
        };

        self.request = Some(RequestHeader {
            method,
            path: path.to_string(),
            version: version.to_string(),
            headers: HeaderMap::new(),
        });
        self.stage = Stage::Headers;
        true
    }

    /// `Name: value`; `colon` is relative to the line start.
    fn parse_header_line(&mut self, line: &[u8], colon: Option<usize>) -> bool {
        let Some(colon) = colon else {
            return false;
        };
        if colon == 0 {
            return false;
        }
        let name = String::from_utf8_lossy(&line[..colon]).into_owned();
        let value = String::from_utf8_lossy(&line[colon + 1..])
            .trim_matches(|c| c == ' ' || c == '\t')
            .to_string();
        match self.request.as_mut() {
            Some(req) => {
                req.headers.insert(name, value);
                true
            }
            None => false,
        }
    }
}

/// Append `VERSION SP STATUS CRLF (Name: value CRLF)* CRLF [BODY]` to `out`.
///
/// Non-OK statuses ignore `headers`: the only header is `Content-Length` and
/// the body is the status text. OK emits `headers` verbatim and no body.
pub fn encode_respond_header(out: &mut Vec<u8>, version: &str, status: StatusCode, headers: Option<&HeaderMap>) {
    let text = status.text();
    out.extend_from_slice(version.as_bytes());
    out.push(b' ');
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(b"\r\n");

    if status != StatusCode::Ok {
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", text.len()).as_bytes());
        out.extend_from_slice(text.as_bytes());
        return;
    }

    if let Some(headers) = headers {
        for (name, value) in headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b"\r\n");
}

use bytes::Bytes;

use crate::http::body::Body;
use crate::http::headers::Headers;
use crate::http::request::{Method, Request, Target};
use crate::http::response::StatusCode;

/// Upper bound on a request or response head.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on a decoded request body.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidHeader,
    InvalidContentLength,
    InvalidChunk,
    InvalidStatus,
    HeadTooLarge,
    BodyTooLarge,
    Incomplete,
}

/// How the length of a message body is determined.
#[derive(Debug, PartialEq, Eq)]
pub enum Framing {
    Length(usize),
    Chunked,
    /// Body runs until the peer closes. Only valid for responses.
    UntilClose,
}

/// Parses one complete request from the front of `buf`.
///
/// Returns the request and the number of bytes it occupied, or
/// [`ParseError::Incomplete`] if more data is needed.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    RequestDecoder::default()
        .decode(buf)?
        .ok_or(ParseError::Incomplete)
}

/// Incremental request reader for a connection's receive buffer.
///
/// The head is parsed once; a chunked body resumes from the last complete
/// chunk on every call. `buf` must always start at the same request, growing
/// only at the end, until a request is returned.
pub struct RequestDecoder {
    pending: Option<PendingRequest>,
    max_body: usize,
}

struct PendingRequest {
    request: Request,
    body_start: usize,
    body: BodyState,
}

enum BodyState {
    Length(usize),
    Chunked(ChunkedDecoder),
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new(MAX_BODY_BYTES)
    }
}

impl RequestDecoder {
    pub fn new(max_body: usize) -> Self {
        Self {
            pending: None,
            max_body,
        }
    }

    /// Returns the next request and its length in `buf`, or `None` if more
    /// data is needed.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Request, usize)>, ParseError> {
        if self.pending.is_none() {
            match parse_request_head(buf, self.max_body) {
                Ok(pending) => self.pending = Some(pending),
                Err(ParseError::Incomplete) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        let Some(pending) = self.pending.as_mut() else {
            return Ok(None);
        };

        let start = pending.body_start;
        let (body, body_len) = match &mut pending.body {
            BodyState::Length(len) => {
                let len = *len;
                if buf.len() - start < len {
                    return Ok(None);
                }
                (Bytes::copy_from_slice(&buf[start..start + len]), len)
            }
            BodyState::Chunked(decoder) => match decoder.decode(&buf[start..])? {
                Some(done) => done,
                None => return Ok(None),
            },
        };

        let Some(mut pending) = self.pending.take() else {
            return Ok(None);
        };
        pending.request.body = Body::full(body);
        Ok(Some((pending.request, start + body_len)))
    }
}

fn parse_request_head(buf: &[u8], max_body: usize) -> Result<PendingRequest, ParseError> {
    let headers_end = match find_headers_end(buf) {
        Some(end) => end,
        None if buf.len() > MAX_HEAD_BYTES => return Err(ParseError::HeadTooLarge),
        None => return Err(ParseError::Incomplete),
    };
    let header_bytes = &buf[..headers_end];
    let body_start = headers_end + 4;

    let headers_str = std::str::from_utf8(header_bytes)
        .map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let raw_target = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() || !version.starts_with("HTTP/1.") {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::parse(method_str).ok_or(ParseError::InvalidMethod)?;
    let target = parse_target(raw_target)?;
    let headers = parse_header_lines(lines)?;

    let body = match request_framing(&headers)? {
        Framing::Chunked => BodyState::Chunked(ChunkedDecoder::with_limit(max_body)),
        Framing::Length(len) if len > max_body => return Err(ParseError::BodyTooLarge),
        Framing::Length(len) => BodyState::Length(len),
        Framing::UntilClose => BodyState::Length(0),
    };

    let request = Request {
        method,
        target,
        version: version.to_string(),
        headers,
        body: Body::Empty,
    };

    Ok(PendingRequest {
        request,
        body_start,
        body,
    })
}

/// Parses the status line and headers of a response.
///
/// Returns `(status, reason, headers, head_len)`.
pub fn parse_response_head(
    buf: &[u8],
) -> Result<(StatusCode, String, Headers, usize), ParseError> {
    let headers_end = match find_headers_end(buf) {
        Some(end) => end,
        None if buf.len() > MAX_HEAD_BYTES => return Err(ParseError::HeadTooLarge),
        None => return Err(ParseError::Incomplete),
    };

    let head = std::str::from_utf8(&buf[..headers_end]).map_err(|_| ParseError::InvalidStatus)?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().ok_or(ParseError::InvalidStatus)?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().ok_or(ParseError::InvalidStatus)?;
    if !version.starts_with("HTTP/1.") {
        return Err(ParseError::InvalidStatus);
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(StatusCode::from_u16)
        .ok_or(ParseError::InvalidStatus)?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = parse_header_lines(lines)?;
    Ok((status, reason, headers, headers_end + 4))
}

/// Decides how a request body is framed. Requests without a length have none.
pub fn request_framing(headers: &Headers) -> Result<Framing, ParseError> {
    if headers.has_token("Transfer-Encoding", "chunked") {
        return Ok(Framing::Chunked);
    }
    Ok(Framing::Length(content_length(headers)?.unwrap_or(0)))
}

/// Decides how a response body is framed.
///
/// `bodiless` is set for responses that never carry a body (HEAD, 1xx, 204, 304).
pub fn response_framing(headers: &Headers, bodiless: bool) -> Result<Framing, ParseError> {
    if bodiless {
        return Ok(Framing::Length(0));
    }
    if headers.has_token("Transfer-Encoding", "chunked") {
        return Ok(Framing::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(len) => Framing::Length(len),
        None => Framing::UntilClose,
    })
}

fn content_length(headers: &Headers) -> Result<Option<usize>, ParseError> {
    let mut length = None;
    for value in headers.get_all("Content-Length") {
        let parsed = value
            .trim()
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength)?;
        if length.is_some_and(|l| l != parsed) {
            return Err(ParseError::InvalidContentLength);
        }
        length = Some(parsed);
    }
    Ok(length)
}

/// Decodes a chunked body from the front of `buf`.
///
/// Returns the decoded bytes and how many input bytes were consumed,
/// including the terminating chunk and any trailers.
pub fn decode_chunked(buf: &[u8]) -> Result<(Bytes, usize), ParseError> {
    ChunkedDecoder::with_limit(usize::MAX)
        .decode(buf)?
        .ok_or(ParseError::Incomplete)
}

/// Resumable chunked-body decoder.
///
/// Complete chunks are copied out once and never scanned again, so feeding a
/// growing buffer costs time proportional to the new bytes only.
#[derive(Debug)]
pub struct ChunkedDecoder {
    body: Vec<u8>,
    pos: usize,
    in_trailers: bool,
    limit: usize,
}

impl ChunkedDecoder {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            body: Vec::new(),
            pos: 0,
            in_trailers: false,
            limit,
        }
    }

    /// Continues decoding `buf`, which must start at the first chunk.
    ///
    /// Returns `None` until the terminating chunk and trailers have arrived.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Bytes, usize)>, ParseError> {
        loop {
            let Some(line_end) = find_crlf(&buf[self.pos..]) else {
                return Ok(None);
            };
            let line_start = self.pos;
            let after_line = line_start + line_end + 2;

            if self.in_trailers {
                self.pos = after_line;
                if line_end == 0 {
                    let body = std::mem::take(&mut self.body);
                    return Ok(Some((Bytes::from(body), self.pos)));
                }
                continue;
            }

            let size_line = std::str::from_utf8(&buf[line_start..line_start + line_end])
                .map_err(|_| ParseError::InvalidChunk)?;
            let size_hex = size_line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_hex, 16).map_err(|_| ParseError::InvalidChunk)?;

            if size == 0 {
                self.pos = after_line;
                self.in_trailers = true;
                continue;
            }

            if size > self.limit - self.body.len() {
                return Err(if self.limit == usize::MAX {
                    ParseError::InvalidChunk
                } else {
                    ParseError::BodyTooLarge
                });
            }
            let chunk_end = after_line
                .checked_add(size)
                .and_then(|end| end.checked_add(2))
                .ok_or(ParseError::InvalidChunk)?;
            if buf.len() < chunk_end {
                return Ok(None);
            }
            if &buf[chunk_end - 2..chunk_end] != b"\r\n" {
                return Err(ParseError::InvalidChunk);
            }
            self.body.extend_from_slice(&buf[after_line..chunk_end - 2]);
            self.pos = chunk_end;
        }
    }
}

fn parse_target(raw: &str) -> Result<Target, ParseError> {
    if raw.starts_with('/') {
        return Ok(Target::from_origin_form(raw));
    }

    // Absolute form: keep only the path and query; the destination is decided
    // by the environment, not by the client.
    let rest = raw
        .strip_prefix("http://")
        .or_else(|| raw.strip_prefix("https://"))
        .ok_or(ParseError::InvalidRequest)?;
    let path_start = rest.find(['/', '?']).unwrap_or(rest.len());
    let origin = &rest[path_start..];
    if origin.starts_with('?') {
        return Ok(Target::from_origin_form(&format!("/{}", origin)));
    }
    Ok(Target::from_origin_form(origin))
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line
            .split_once(':')
            .ok_or(ParseError::InvalidHeader)?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(ParseError::InvalidHeader);
        }

        headers.append(key, value.trim());
    }

    Ok(headers)
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

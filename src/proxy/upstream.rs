//! One HTTP/1.1 exchange with an upstream.
//!
//! The request is written in full, then the response is read until its body
//! is complete. Each exchange uses its own connection (`Connection: close`).

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::http::body::Body;
use crate::http::headers::Headers;
use crate::http::parser::{
    ChunkedDecoder, Framing, ParseError, parse_response_head, response_framing,
};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder};
use crate::http::writer::serialize_request;

/// Default buffer size for reading
const BUFFER_SIZE: usize = 8192;

/// Headers that describe a single connection and are never passed along.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Transfer-Encoding",
    "Upgrade",
    "TE",
    "Trailer",
];

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("I/O error talking to upstream: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed upstream response: {0:?}")]
    Malformed(ParseError),

    #[error("connection closed before complete response received")]
    Closed,

    #[error("request body was not buffered before sending")]
    UnbufferedBody,
}

/// Removes hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut Headers) {
    let named: Vec<String> = headers
        .get_all("Connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    for name in named.iter().map(String::as_str).chain(HOP_BY_HOP_HEADERS.iter().copied()) {
        headers.remove(name);
    }
}

/// Sends `request` over `stream` and reads back the response.
pub async fn exchange<S>(stream: &mut S, request: &Request) -> Result<Response, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    if matches!(request.body, Body::Stream(_)) {
        return Err(UpstreamError::UnbufferedBody);
    }

    stream.write_all(&serialize_request(request)).await?;
    stream.flush().await?;

    read_response(stream, request.method == Method::HEAD).await
}

/// Reads one complete response, skipping interim 1xx responses.
async fn read_response<S>(stream: &mut S, head_request: bool) -> Result<Response, UpstreamError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        let (status, reason, mut headers, head_len) = loop {
            match parse_response_head(&buffer) {
                Ok(head) => break head,
                Err(ParseError::Incomplete) => fill(stream, &mut buffer).await?,
                Err(e) => return Err(UpstreamError::Malformed(e)),
            }
        };
        buffer.advance(head_len);

        let code = status.as_u16();
        if (100..200).contains(&code) && code != 101 {
            continue;
        }

        let bodiless = head_request || (100..200).contains(&code) || code == 204 || code == 304;
        let framing = response_framing(&headers, bodiless).map_err(UpstreamError::Malformed)?;

        let body = match framing {
            Framing::Length(len) => read_exact_body(stream, &mut buffer, len).await?,
            Framing::Chunked => read_chunked_body(stream, &mut buffer).await?,
            Framing::UntilClose => read_until_close(stream, &mut buffer).await?,
        };

        // The body is handed on fully buffered, so it is re-framed by length.
        let reframe = !matches!(framing, Framing::Length(_));
        strip_hop_by_hop(&mut headers);
        if reframe {
            headers.set("Content-Length", body.len().to_string());
        }

        return Ok(ResponseBuilder::new(status)
            .reason(reason)
            .headers(headers)
            .body(body)
            .build());
    }
}

async fn fill<S>(stream: &mut S, buffer: &mut BytesMut) -> Result<(), UpstreamError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    if stream.read_buf(buffer).await? == 0 {
        return Err(UpstreamError::Closed);
    }
    Ok(())
}

async fn read_exact_body<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    len: usize,
) -> Result<Bytes, UpstreamError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    while buffer.len() < len {
        buffer.reserve((len - buffer.len()).min(BUFFER_SIZE));
        fill(stream, buffer).await?;
    }
    Ok(buffer.split_to(len).freeze())
}

async fn read_chunked_body<S>(stream: &mut S, buffer: &mut BytesMut) -> Result<Bytes, UpstreamError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut decoder = ChunkedDecoder::with_limit(usize::MAX);
    loop {
        match decoder.decode(&buffer[..]) {
            Ok(Some((body, consumed))) => {
                buffer.advance(consumed);
                return Ok(body);
            }
            Ok(None) => fill(stream, buffer).await?,
            Err(e) => return Err(UpstreamError::Malformed(e)),
        }
    }
}

async fn read_until_close<S>(stream: &mut S, buffer: &mut BytesMut) -> Result<Bytes, UpstreamError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    loop {
        if stream.read_buf(buffer).await? == 0 {
            return Ok(buffer.split().freeze());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::RequestBuilder;
    use tokio::io::duplex;

    async fn exchange_with(raw_response: &'static [u8], method: Method) -> (Response, Vec<u8>) {
        let (mut client, mut server) = duplex(64 * 1024);

        let upstream = tokio::spawn(async move {
            let mut received = vec![0u8; 4096];
            let n = server.read(&mut received).await.unwrap();
            received.truncate(n);
            server.write_all(raw_response).await.unwrap();
            server.shutdown().await.unwrap();
            received
        });

        let request = RequestBuilder::new()
            .method(method)
            .path("/status")
            .header("Host", "db.example")
            .build()
            .unwrap();

        let response = exchange(&mut client, &request).await.unwrap();
        (response, upstream.await.unwrap())
    }

    #[tokio::test]
    async fn reads_length_delimited_response() {
        let (response, sent) = exchange_with(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\n\r\n{\"ok\":true}",
            Method::GET,
        )
        .await;

        assert!(String::from_utf8(sent).unwrap().starts_with("GET /status HTTP/1.1\r\n"));
        assert_eq!(response.status.as_u16(), 200);
        assert_eq!(&response.body[..], b"{\"ok\":true}");
        assert_eq!(response.headers.get("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn chunked_response_is_reframed() {
        let (response, _) = exchange_with(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
            Method::GET,
        )
        .await;

        assert_eq!(&response.body[..], b"abcde");
        assert_eq!(response.headers.get("Content-Length"), Some("5"));
        assert!(!response.headers.contains("Transfer-Encoding"));
        assert!(!response.headers.contains("Connection"));
    }

    #[tokio::test]
    async fn interim_continue_is_skipped() {
        let (response, _) = exchange_with(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 403 Forbidden\r\nContent-Length: 6\r\n\r\ndenied",
            Method::GET,
        )
        .await;

        assert_eq!(response.status.as_u16(), 403);
        assert_eq!(response.reason, "Forbidden");
        assert_eq!(&response.body[..], b"denied");
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        let (response, _) = exchange_with(
            b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n",
            Method::HEAD,
        )
        .await;

        assert!(response.body.is_empty());
        assert_eq!(response.headers.get("Content-Length"), Some("1234"));
    }

    #[tokio::test]
    async fn body_until_close() {
        let (response, _) = exchange_with(b"HTTP/1.1 200 OK\r\n\r\nstreamed", Method::GET).await;

        assert_eq!(&response.body[..], b"streamed");
        assert_eq!(response.headers.get("Content-Length"), Some("8"));
    }

    #[test]
    fn hop_by_hop_includes_connection_tokens() {
        let mut headers: Headers = [
            ("Connection", "close, X-Private"),
            ("X-Private", "1"),
            ("Keep-Alive", "timeout=5"),
            ("Content-Type", "text/plain"),
        ]
        .into_iter()
        .collect();

        strip_hop_by_hop(&mut headers);

        let names: Vec<_> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["Content-Type"]);
    }
}

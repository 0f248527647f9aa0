use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::request::{Method, Request};
use crate::http::response::Response;

const HTTP_VERSION: &str = "HTTP/1.1";

fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256 + resp.body.len());

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        resp.status.as_u16(),
        resp.reason
    );
    buf.extend_from_slice(status_line.as_bytes());

    write_headers(&mut buf, resp.headers.iter());
    buf.extend_from_slice(&resp.body);

    buf
}

/// Serializes a request whose body has already been buffered.
///
/// The request line uses the raw path and query from the target, byte for
/// byte. `Content-Length` is always written from the body actually sent.
pub fn serialize_request(req: &Request) -> Vec<u8> {
    let body = req.body.as_bytes().map(|b| b.as_ref()).unwrap_or(&[]);
    let mut buf = Vec::with_capacity(256 + body.len());

    buf.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            req.method,
            req.target.path_and_query(),
            HTTP_VERSION
        )
        .as_bytes(),
    );

    let length = body.len().to_string();
    let framing = (!body.is_empty() || !matches!(req.method, Method::GET | Method::HEAD))
        .then_some(("Content-Length", length.as_str()));

    write_headers(
        &mut buf,
        req.headers
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case("Content-Length"))
            .chain(framing),
    );
    buf.extend_from_slice(body);

    buf
}

fn write_headers<'a>(buf: &mut Vec<u8>, headers: impl Iterator<Item = (&'a str, &'a str)>) {
    for (k, v) in headers {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");
}

pub struct ResponseWriter {
    buffer: Vec<u8>,
    written: usize,
}

impl ResponseWriter {
    pub fn new(response: &Response) -> Self {
        Self {
            buffer: serialize_response(response),
            written: 0,
        }
    }

    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while self.written < self.buffer.len() {
            let n = stream
                .write(&self.buffer[self.written..])
                .await?;

            if n == 0 {
                return Err(anyhow::anyhow!("connection closed while writing"));
            }

            self.written += n;
        }

        stream.flush().await?;
        Ok(())
    }
}

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;

use crate::http::parser::{ParseError, RequestDecoder};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;
use crate::proxy::ProxyHandler;

/// One client connection to an environment's listener.
///
/// Requests are read and answered strictly in order; pipelined requests wait
/// in `buffer` until the previous response has been written.
pub struct Connection<S = TcpStream> {
    stream: S,
    buffer: Vec<u8>,
    decoder: RequestDecoder,
    state: ConnectionState,
    handler: Arc<ProxyHandler>,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    /// Response to send, and whether to read another request afterwards.
    Writing(ResponseWriter, bool),
    Closed,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, handler: Arc<ProxyHandler>) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
            decoder: RequestDecoder::default(),
            state: ConnectionState::Reading,
            handler,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => {
                    self.state = match self.read_request().await {
                        Ok(Some(req)) => ConnectionState::Processing(req),
                        Ok(None) => ConnectionState::Closed,
                        Err(e) => {
                            tracing::warn!(
                                environment = self.handler.environment(),
                                error = ?e,
                                "Rejecting malformed request"
                            );
                            let response = match e {
                                ParseError::BodyTooLarge => Response::payload_too_large(),
                                _ => Response::bad_request(),
                            };
                            ConnectionState::Writing(ResponseWriter::new(&response), false)
                        }
                    };
                }

                ConnectionState::Processing(req) => {
                    let keep_alive = req.keep_alive();
                    let mut response = self.handler.handle(req).await;
                    if !keep_alive {
                        response.headers.set("Connection", "close");
                    }

                    let writer = ResponseWriter::new(&response);
                    self.state = ConnectionState::Writing(writer, keep_alive);
                }

                ConnectionState::Writing(mut writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if keep_alive {
                        self.state = ConnectionState::Reading;
                    }
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Reads the next request, or `None` once the client has closed the
    /// connection between requests.
    pub async fn read_request(&mut self) -> Result<Option<Request>, ParseError> {
        loop {
            if let Some((request, consumed)) = self.decoder.decode(&self.buffer)? {
                self.buffer.drain(..consumed);
                return Ok(Some(request));
            }

            let mut temp = [0u8; 4096];
            let n = match self.stream.read(&mut temp).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "Client read failed");
                    return Ok(None);
                }
            };

            if n == 0 {
                if !self.buffer.is_empty() {
                    tracing::debug!(
                        pending = self.buffer.len(),
                        "Client closed connection mid-request"
                    );
                }
                return Ok(None);
            }

            self.buffer.extend_from_slice(&temp[..n]);
        }
    }
}

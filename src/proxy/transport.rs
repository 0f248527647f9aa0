//! The outbound half of an environment.
//!
//! Every request leaving the proxy goes through [`ForwardingTransport::round_trip`]:
//! client-supplied address headers are dropped, the request is signed, sent
//! once, and the outcome is reported to the event sink.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::http::headers::Headers;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::observe::{ProxyEvent, SharedSink};
use crate::proxy::connector::{Connector, split_authority};
use crate::proxy::upstream::{self, UpstreamError, strip_hop_by_hop};
use crate::signer::{SignError, Signer};

/// Headers through which a client could claim an address of its choosing.
pub const CLIENT_ADDRESS_HEADERS: &[&str] = &["X-Forwarded-For", "Forwarded"];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request not signed: {0}")]
    Signing(#[from] SignError),

    #[error("failed to connect to {authority}: {source}")]
    Connect {
        authority: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

pub struct ForwardingTransport {
    environment: String,
    signer: Signer,
    connector: Arc<dyn Connector>,
    sink: SharedSink,
}

impl ForwardingTransport {
    pub fn new(
        environment: impl Into<String>,
        signer: Signer,
        connector: Arc<dyn Connector>,
        sink: SharedSink,
    ) -> Self {
        Self {
            environment: environment.into(),
            signer,
            connector,
            sink,
        }
    }

    /// Signs and sends `req`, returning the upstream's response untouched.
    ///
    /// Upstream error statuses are successful round trips. Only failures to
    /// sign or to complete the exchange are errors, and neither is retried.
    pub async fn round_trip(&self, mut req: Request) -> Result<Response, ProxyError> {
        strip_client_address(&mut req.headers);
        strip_hop_by_hop(&mut req.headers);
        req.headers.set("Connection", "close");

        let method = req.method.to_string();

        if let Err(e) = self.signer.sign(&mut req, Utc::now()).await {
            self.sink.record(ProxyEvent::SigningFailed {
                environment: self.environment.clone(),
                method,
                url: req.target.url(),
                error: e.to_string(),
            });
            return Err(e.into());
        }

        let url = req.target.url();
        match self.send(&req).await {
            Ok(response) => {
                self.sink.record(ProxyEvent::Completed {
                    environment: self.environment.clone(),
                    method,
                    url,
                    status: response.status.as_u16(),
                });
                Ok(response)
            }
            Err(e) => {
                self.sink.record(ProxyEvent::Failed {
                    environment: self.environment.clone(),
                    method,
                    url,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn send(&self, req: &Request) -> Result<Response, ProxyError> {
        // The signer refuses requests without a host, so one is always set here.
        let authority = req.target.host.as_deref().unwrap_or_default();
        let (host, port) = split_authority(authority);

        let mut stream = self
            .connector
            .connect(host, port)
            .await
            .map_err(|source| ProxyError::Connect {
                authority: authority.to_string(),
                source,
            })?;

        Ok(upstream::exchange(&mut stream, req).await?)
    }
}

/// Removes every client-address header, whatever its casing.
pub fn strip_client_address(headers: &mut Headers) {
    for name in CLIENT_ADDRESS_HEADERS {
        headers.remove(name);
    }
}

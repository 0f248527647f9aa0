//! Reverse proxy functionality
//!
//! This module implements the per-environment request pipeline: the
//! [`Director`] points a request at the environment's upstream, and the
//! [`ForwardingTransport`] signs it and performs the round trip.

pub mod connector;
pub mod director;
pub mod transport;
pub mod upstream;

use std::sync::Arc;

pub use connector::{Connector, TlsConnector};
pub use director::Director;
pub use transport::{ForwardingTransport, ProxyError};

use crate::config::Environment;
use crate::credentials::CredentialContext;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::observe::SharedSink;
use crate::signer::Signer;

/// A working reverse proxy for exactly one environment.
pub struct ProxyHandler {
    environment: String,
    director: Director,
    transport: ForwardingTransport,
}

impl ProxyHandler {
    pub fn new(
        environment: &Environment,
        context: Arc<CredentialContext>,
        connector: Arc<dyn Connector>,
        sink: SharedSink,
    ) -> Self {
        Self {
            environment: environment.name.clone(),
            director: Director::new(&environment.name, &environment.upstream_host, sink.clone()),
            transport: ForwardingTransport::new(
                &environment.name,
                Signer::new(context),
                connector,
                sink,
            ),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn upstream_host(&self) -> &str {
        self.director.upstream_host()
    }

    /// Forwards one request.
    ///
    /// The upstream's response comes back as-is. If the request could not be
    /// signed or the upstream could not be reached, the caller gets an empty
    /// `502 Bad Gateway`; the failure itself has already been reported to the
    /// event sink.
    pub async fn handle(&self, mut request: Request) -> Response {
        self.director.direct(&mut request);

        match self.transport.round_trip(request).await {
            Ok(response) => response,
            Err(_) => Response::bad_gateway(),
        }
    }
}

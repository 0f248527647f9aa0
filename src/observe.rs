//! Observability events emitted on the request path.
//!
//! The director, transport and signer never log directly. They report
//! [`ProxyEvent`]s to an [`EventSink`] handed to them at construction, and the
//! sink decides what to do with them. [`TracingSink`] turns them into
//! `tracing` records; tests use a recording sink.

use std::sync::Arc;

/// One thing that happened to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// The request was pointed at the environment's upstream.
    Directed {
        environment: String,
        method: String,
        upstream_host: String,
        path: String,
    },
    /// The upstream answered. Any status counts, including 4xx and 5xx.
    Completed {
        environment: String,
        method: String,
        url: String,
        status: u16,
    },
    /// The request could not be signed and was not sent.
    SigningFailed {
        environment: String,
        method: String,
        url: String,
        error: String,
    },
    /// The upstream could not be reached or the exchange broke off.
    Failed {
        environment: String,
        method: String,
        url: String,
        error: String,
    },
}

impl ProxyEvent {
    pub fn environment(&self) -> &str {
        match self {
            ProxyEvent::Directed { environment, .. }
            | ProxyEvent::Completed { environment, .. }
            | ProxyEvent::SigningFailed { environment, .. }
            | ProxyEvent::Failed { environment, .. } => environment,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: ProxyEvent);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Writes every event to `tracing`, tagged with its environment.
///
/// Upstream statuses of 400 and above are logged at ERROR so rejected
/// signatures stand out; everything else that reached the upstream is INFO.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: ProxyEvent) {
        match event {
            ProxyEvent::Directed {
                environment,
                method,
                upstream_host,
                path,
            } => {
                tracing::info!(
                    environment = %environment,
                    method = %method,
                    upstream = %upstream_host,
                    path = %path,
                    "Forwarding request"
                );
            }
            ProxyEvent::Completed {
                environment,
                method,
                url,
                status,
            } if status >= 400 => {
                tracing::error!(
                    environment = %environment,
                    method = %method,
                    url = %url,
                    status,
                    "Upstream returned an error status"
                );
            }
            ProxyEvent::Completed {
                environment,
                method,
                url,
                status,
            } => {
                tracing::info!(
                    environment = %environment,
                    method = %method,
                    url = %url,
                    status,
                    "Upstream responded"
                );
            }
            ProxyEvent::SigningFailed {
                environment,
                method,
                url,
                error,
            } => {
                tracing::error!(
                    environment = %environment,
                    method = %method,
                    url = %url,
                    error = %error,
                    "Failed to sign request, not forwarding"
                );
            }
            ProxyEvent::Failed {
                environment,
                method,
                url,
                error,
            } => {
                tracing::error!(
                    environment = %environment,
                    method = %method,
                    url = %url,
                    error = %error,
                    "Upstream request failed"
                );
            }
        }
    }
}

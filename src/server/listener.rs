use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::http::connection::Connection;
use crate::proxy::ProxyHandler;

/// One listener serving exactly one environment.
pub struct EnvironmentServer {
    listener: TcpListener,
    handler: Arc<ProxyHandler>,
}

impl EnvironmentServer {
    pub async fn bind(addr: SocketAddr, handler: Arc<ProxyHandler>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.with_context(|| {
            format!(
                "failed to bind {} for environment {}",
                addr,
                handler.environment()
            )
        })?;

        info!(
            environment = handler.environment(),
            upstream = handler.upstream_host(),
            "Listening on {}",
            listener.local_addr().unwrap_or(addr)
        );

        Ok(Self { listener, handler })
    }

    pub fn environment(&self) -> &str {
        self.handler.environment()
    }

    pub fn handler(&self) -> Arc<ProxyHandler> {
        self.handler.clone()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the listener fails. Each connection gets its
    /// own task, so a slow request never holds up the accept loop.
    pub async fn serve(self) -> anyhow::Result<()> {
        loop {
            let (socket, peer) = self
                .listener
                .accept()
                .await
                .with_context(|| format!("accept failed for environment {}", self.environment()))?;
            debug!(environment = self.environment(), "Accepted connection from {}", peer);

            let handler = self.handler.clone();
            tokio::spawn(async move {
                let environment = handler.environment().to_string();
                let mut conn = Connection::new(socket, handler);
                if let Err(e) = conn.run().await {
                    tracing::warn!(
                        environment = %environment,
                        "Connection error from {}: {}",
                        peer,
                        e
                    );
                }
            });
        }
    }
}

//! Outbound connections.
//!
//! The transport never opens sockets itself; it asks a [`Connector`]. The
//! production connector speaks TLS with the platform's root certificates.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Default port for signed upstream traffic.
pub const HTTPS_PORT: u16 = 443;

pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

pub type BoxedIo = Box<dyn UpstreamIo>;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedIo>;
}

/// Splits `host[:port]` into its parts, defaulting to 443.
pub fn split_authority(authority: &str) -> (&str, u16) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            let port = after
                .strip_prefix(':')
                .and_then(|port| port.parse().ok())
                .unwrap_or(HTTPS_PORT);
            return (host, port);
        }
    }
    if let Some((host, port)) = authority.rsplit_once(':') {
        if let Ok(port) = port.parse() {
            return (host, port);
        }
    }
    (authority, HTTPS_PORT)
}

/// TLS over TCP, verifying the upstream against a fixed root store.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn from_config(config: Arc<ClientConfig>) -> Self {
        Self {
            inner: tokio_rustls::TlsConnector::from(config),
        }
    }

    /// Trusts the operating system's certificate store.
    pub fn with_native_roots() -> anyhow::Result<Self> {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for error in &native.errors {
            tracing::warn!(error = %error, "Failed to load a native root certificate");
        }

        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        if added == 0 {
            anyhow::bail!("no usable root certificates found in the system store");
        }
        tracing::debug!(added, ignored, "Loaded native root certificates");

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self::from_config(Arc::new(config)))
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedIo> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;

        let tls = self.inner.connect(server_name, tcp).await?;
        Ok(Box::new(tls))
    }
}

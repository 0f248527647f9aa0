//! Credentials served over plain HTTP by the platform the proxy runs on: the
//! container credentials endpoint (ECS tasks, EKS pod identity) and the EC2
//! instance metadata service.
//!
//! Both hand out temporary credentials with an expiry. Wrap them in a
//! [`RefreshingProvider`] so they are fetched once and renewed shortly before
//! they lapse.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use url::Url;

use crate::credentials::{CredentialError, CredentialProvider, Credentials, Lookup};
use crate::http::request::{Method, RequestBuilder};
use crate::http::response::Response;
use crate::proxy::upstream::exchange;

/// Host that `AWS_CONTAINER_CREDENTIALS_RELATIVE_URI` is resolved against.
pub const CONTAINER_CREDENTIALS_HOST: &str = "http://169.254.170.2";
pub const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254";

const METADATA_TOKEN_PATH: &str = "/latest/api/token";
const METADATA_ROLES_PATH: &str = "/latest/meta-data/iam/security-credentials/";
const METADATA_TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const METADATA_TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const METADATA_TOKEN_TTL_SECONDS: &str = "21600";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Cached credentials are renewed once they are this close to expiring.
const REFRESH_BEFORE_EXPIRY_SECS: i64 = 5 * 60;

/// Body returned by both the container endpoint and the metadata service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RemoteCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
    expiration: Option<DateTime<Utc>>,
    /// Only sent by the metadata service; anything but `Success` is a failure.
    code: Option<String>,
}

impl RemoteCredentials {
    fn parse(provider: &'static str, body: &[u8]) -> Result<Credentials, CredentialError> {
        let remote: RemoteCredentials =
            serde_json::from_slice(body).map_err(|e| remote_error(provider, e))?;
        if let Some(code) = remote.code.as_deref().filter(|code| *code != "Success") {
            return Err(remote_error(provider, format!("credentials endpoint returned {code}")));
        }

        let mut credentials = Credentials::new(remote.access_key_id, remote.secret_access_key);
        credentials.session_token = remote.token;
        credentials.expires_at = remote.expiration;
        Ok(credentials)
    }
}

/// Credentials from the container credentials endpoint.
///
/// Configured by `AWS_CONTAINER_CREDENTIALS_RELATIVE_URI` or
/// `AWS_CONTAINER_CREDENTIALS_FULL_URI`, with an optional `Authorization`
/// value from `AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE` or
/// `AWS_CONTAINER_AUTHORIZATION_TOKEN`.
#[derive(Debug, Clone)]
pub struct ContainerProvider {
    endpoint: String,
    token: Option<String>,
    token_file: Option<String>,
}

impl ContainerProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
            token_file: None,
        }
    }

    pub fn with_authorization(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// `None` when the process is not running in a container that serves
    /// credentials.
    pub fn from_lookup(lookup: &Lookup) -> Option<Self> {
        let endpoint = match lookup("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI") {
            Some(relative) => format!("{}{}", CONTAINER_CREDENTIALS_HOST, relative),
            None => lookup("AWS_CONTAINER_CREDENTIALS_FULL_URI")?,
        };
        Some(Self {
            endpoint,
            token: lookup("AWS_CONTAINER_AUTHORIZATION_TOKEN"),
            token_file: lookup("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE"),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn authorization(&self) -> Result<Option<String>, CredentialError> {
        match &self.token_file {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .map(|token| Some(token.trim().to_string()))
                .map_err(|source| CredentialError::Read {
                    path: path.into(),
                    source,
                }),
            None => Ok(self.token.clone()),
        }
    }
}

#[async_trait]
impl CredentialProvider for ContainerProvider {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn credentials(&self) -> Result<Option<Credentials>, CredentialError> {
        let url = parse_endpoint(self.name(), &self.endpoint)?;
        let authorization = self.authorization().await?;
        let mut headers = Vec::new();
        if let Some(token) = authorization.as_deref() {
            headers.push(("Authorization", token));
        }

        let response = fetch(Method::GET, &url, &url_path(&url), &headers)
            .await
            .map_err(|e| remote_error(self.name(), e))?;
        if !is_success(&response) {
            return Err(remote_error(
                self.name(),
                format!("{} answered {}", self.endpoint, response.status.as_u16()),
            ));
        }
        RemoteCredentials::parse(self.name(), &response.body).map(Some)
    }
}

/// Instance-role credentials from the EC2 instance metadata service.
///
/// Uses a session token (IMDSv2) and falls back to plain requests when the
/// token call is refused. An unreachable service means the proxy is not on
/// EC2 and yields no credentials rather than an error.
#[derive(Debug, Clone)]
pub struct InstanceMetadataProvider {
    endpoint: String,
}

impl InstanceMetadataProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Honors `AWS_EC2_METADATA_SERVICE_ENDPOINT`. `None` when
    /// `AWS_EC2_METADATA_DISABLED` is `true`.
    pub fn from_lookup(lookup: &Lookup) -> Option<Self> {
        if lookup("AWS_EC2_METADATA_DISABLED").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
            return None;
        }
        let endpoint = lookup("AWS_EC2_METADATA_SERVICE_ENDPOINT")
            .unwrap_or_else(|| DEFAULT_METADATA_ENDPOINT.to_string());
        Some(Self::new(endpoint))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CredentialProvider for InstanceMetadataProvider {
    fn name(&self) -> &'static str {
        "instance-metadata"
    }

    async fn credentials(&self) -> Result<Option<Credentials>, CredentialError> {
        let name = self.name();
        let url = parse_endpoint(name, &self.endpoint)?;

        let token_response = match fetch(
            Method::PUT,
            &url,
            METADATA_TOKEN_PATH,
            &[(METADATA_TOKEN_TTL_HEADER, METADATA_TOKEN_TTL_SECONDS)],
        )
        .await
        {
            Ok(response) => response,
            Err(FetchError::Unreachable(e)) => {
                tracing::debug!(endpoint = %self.endpoint, "Instance metadata unreachable: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(remote_error(name, e)),
        };
        let token = is_success(&token_response)
            .then(|| String::from_utf8_lossy(&token_response.body).trim().to_string());

        let mut headers = Vec::new();
        if let Some(token) = token.as_deref() {
            headers.push((METADATA_TOKEN_HEADER, token));
        }

        let roles = fetch(Method::GET, &url, METADATA_ROLES_PATH, &headers)
            .await
            .map_err(|e| remote_error(name, e))?;
        if roles.status.as_u16() == 404 {
            // No instance profile attached.
            return Ok(None);
        }
        if !is_success(&roles) {
            return Err(remote_error(
                name,
                format!("role listing answered {}", roles.status.as_u16()),
            ));
        }
        let listing = String::from_utf8_lossy(&roles.body);
        let Some(role) = listing.lines().map(str::trim).find(|line| !line.is_empty()) else {
            return Ok(None);
        };

        let path = format!("{}{}", METADATA_ROLES_PATH, role);
        let response = fetch(Method::GET, &url, &path, &headers)
            .await
            .map_err(|e| remote_error(name, e))?;
        if !is_success(&response) {
            return Err(remote_error(
                name,
                format!("credentials for role {} answered {}", role, response.status.as_u16()),
            ));
        }
        RemoteCredentials::parse(name, &response.body).map(Some)
    }
}

/// Keeps the last credentials that carry an expiry and serves them until they
/// are about to lapse.
///
/// If renewing fails while the cached credentials are still valid, the cached
/// ones keep being used.
pub struct RefreshingProvider<P> {
    inner: P,
    cached: Mutex<Option<Credentials>>,
}

impl<P: CredentialProvider> RefreshingProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<P: CredentialProvider> CredentialProvider for RefreshingProvider<P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn credentials(&self) -> Result<Option<Credentials>, CredentialError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();
        let window = chrono::Duration::seconds(REFRESH_BEFORE_EXPIRY_SECS);

        if let Some(credentials) = cached.as_ref() {
            if !credentials.expires_within(now, window) {
                return Ok(Some(credentials.clone()));
            }
        }

        match self.inner.credentials().await {
            Ok(fresh) => {
                *cached = fresh.clone().filter(|c| c.expires_at.is_some());
                Ok(fresh)
            }
            Err(e) => match cached.as_ref() {
                Some(credentials) if !credentials.expires_within(now, chrono::Duration::zero()) => {
                    tracing::warn!(
                        provider = self.inner.name(),
                        "Credential refresh failed, using cached credentials: {}",
                        e
                    );
                    Ok(Some(credentials.clone()))
                }
                _ => Err(e),
            },
        }
    }
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("{0}")]
    Failed(String),
}

/// One request over a fresh plain-HTTP connection.
async fn fetch(
    method: Method,
    url: &Url,
    path: &str,
    headers: &[(&str, &str)],
) -> Result<Response, FetchError> {
    let host = url
        .host_str()
        .ok_or_else(|| FetchError::Failed(format!("{} has no host", url)))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let mut builder = RequestBuilder::new()
        .method(method)
        .path(path)
        .header("Host", authority.as_str())
        .header("Connection", "close");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.build().map_err(|e| FetchError::Failed(e.to_string()))?;

    let dial_host = host.trim_start_matches('[').trim_end_matches(']');
    let connect = TcpStream::connect((dial_host, port));
    let mut stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(FetchError::Unreachable(e.to_string())),
        Err(_) => {
            return Err(FetchError::Unreachable(format!(
                "no answer from {} within {:?}",
                authority, CONNECT_TIMEOUT
            )));
        }
    };

    match tokio::time::timeout(RESPONSE_TIMEOUT, exchange(&mut stream, &request)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(FetchError::Failed(e.to_string())),
        Err(_) => Err(FetchError::Failed(format!(
            "{} did not answer within {:?}",
            authority, RESPONSE_TIMEOUT
        ))),
    }
}

fn parse_endpoint(provider: &'static str, endpoint: &str) -> Result<Url, CredentialError> {
    let url =
        Url::parse(endpoint).map_err(|e| remote_error(provider, format!("{endpoint}: {e}")))?;
    if url.scheme() != "http" {
        return Err(remote_error(
            provider,
            format!("only http endpoints are supported, got {endpoint}"),
        ));
    }
    Ok(url)
}

fn url_path(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn is_success(response: &Response) -> bool {
    (200..300).contains(&response.status.as_u16())
}

fn remote_error(provider: &'static str, e: impl std::fmt::Display) -> CredentialError {
    CredentialError::Remote {
        provider,
        message: e.to_string(),
    }
}

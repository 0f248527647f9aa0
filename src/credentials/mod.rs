//! Credential context shared by every environment.
//!
//! The context is built once at startup and handed to each environment behind
//! an `Arc`. It never changes after that; credentials that rotate (temporary
//! session tokens, a credentials file rewritten by an external tool) are picked
//! up because providers are asked again on every signature. Remote providers
//! with expiring credentials are cached by [`RefreshingProvider`] instead.

mod remote;

pub use remote::{
    CONTAINER_CREDENTIALS_HOST, ContainerProvider, DEFAULT_METADATA_ENDPOINT,
    InstanceMetadataProvider, RefreshingProvider,
};

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Name of the profile used when `AWS_PROFILE` is unset.
pub const DEFAULT_PROFILE: &str = "default";

/// Looks up a variable by name. Production code reads the process environment.
pub type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub fn process_env() -> Lookup {
    Arc::new(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    /// When temporary credentials stop working. `None` for long-term keys.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expires_at: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// True if these credentials lapse before `now + window`.
    pub fn expires_within(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.expires_at.is_some_and(|at| at <= now + window)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credentials found (tried: {tried})")]
    NotFound { tried: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("profile `{profile}` in {path} is missing `{field}`")]
    IncompleteProfile {
        profile: String,
        path: PathBuf,
        field: &'static str,
    },

    #[error("no region configured; set AWS_REGION or AWS_DEFAULT_REGION")]
    MissingRegion,

    #[error("{provider} credentials unavailable: {message}")]
    Remote {
        provider: &'static str,
        message: String,
    },
}

/// A source of signing credentials.
///
/// `Ok(None)` means "nothing configured here", letting a [`ChainProvider`]
/// move on; an error means the source is configured but broken.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn credentials(&self) -> Result<Option<Credentials>, CredentialError>;
}

/// Fixed credentials, mostly for tests.
#[derive(Debug, Clone)]
pub struct StaticProvider {
    credentials: Credentials,
}

impl StaticProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn credentials(&self) -> Result<Option<Credentials>, CredentialError> {
        Ok(Some(self.credentials.clone()))
    }
}

/// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`,
/// read on every call.
pub struct EnvironmentProvider {
    lookup: Lookup,
}

impl EnvironmentProvider {
    pub fn new(lookup: Lookup) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl CredentialProvider for EnvironmentProvider {
    fn name(&self) -> &'static str {
        "environment"
    }

    async fn credentials(&self) -> Result<Option<Credentials>, CredentialError> {
        let (Some(key), Some(secret)) = (
            (self.lookup)("AWS_ACCESS_KEY_ID"),
            (self.lookup)("AWS_SECRET_ACCESS_KEY"),
        ) else {
            return Ok(None);
        };

        let mut credentials = Credentials::new(key, secret);
        credentials.session_token = (self.lookup)("AWS_SESSION_TOKEN");
        Ok(Some(credentials))
    }
}

/// A profile from the shared credentials file, re-read on every call.
#[derive(Debug, Clone)]
pub struct ProfileProvider {
    path: PathBuf,
    profile: String,
}

impl ProfileProvider {
    pub fn new(path: impl Into<PathBuf>, profile: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            profile: profile.into(),
        }
    }

    /// Honors `AWS_SHARED_CREDENTIALS_FILE` and `AWS_PROFILE`.
    pub fn from_lookup(lookup: &Lookup) -> Option<Self> {
        let path = lookup("AWS_SHARED_CREDENTIALS_FILE")
            .map(PathBuf::from)
            .or_else(|| home_dir(lookup).map(|home| home.join(".aws").join("credentials")))?;
        let profile = lookup("AWS_PROFILE").unwrap_or_else(|| DEFAULT_PROFILE.to_string());
        Some(Self::new(path, profile))
    }
}

#[async_trait]
impl CredentialProvider for ProfileProvider {
    fn name(&self) -> &'static str {
        "profile"
    }

    async fn credentials(&self) -> Result<Option<Credentials>, CredentialError> {
        let Some(profiles) = read_profiles(&self.path).await? else {
            return Ok(None);
        };
        let Some(section) = profiles.get(&self.profile) else {
            return Ok(None);
        };

        let field = |name: &'static str| {
            section
                .get(name)
                .cloned()
                .ok_or_else(|| CredentialError::IncompleteProfile {
                    profile: self.profile.clone(),
                    path: self.path.clone(),
                    field: name,
                })
        };

        let mut credentials = Credentials::new(
            field("aws_access_key_id")?,
            field("aws_secret_access_key")?,
        );
        credentials.session_token = section.get("aws_session_token").cloned();
        Ok(Some(credentials))
    }
}

/// Tries each provider in order and returns the first credentials found.
pub struct ChainProvider {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl ChainProvider {
    pub fn new(providers: Vec<Box<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }

    /// Environment variables, the shared credentials file, then whichever
    /// platform endpoint applies: the container endpoint when one is
    /// configured, otherwise the instance metadata service.
    pub fn default_chain(lookup: &Lookup) -> Self {
        let mut providers: Vec<Box<dyn CredentialProvider>> =
            vec![Box::new(EnvironmentProvider::new(lookup.clone()))];
        if let Some(profile) = ProfileProvider::from_lookup(lookup) {
            providers.push(Box::new(profile));
        }
        if let Some(container) = ContainerProvider::from_lookup(lookup) {
            providers.push(Box::new(RefreshingProvider::new(container)));
        } else if let Some(metadata) = InstanceMetadataProvider::from_lookup(lookup) {
            providers.push(Box::new(RefreshingProvider::new(metadata)));
        }
        Self::new(providers)
    }
}

#[async_trait]
impl CredentialProvider for ChainProvider {
    fn name(&self) -> &'static str {
        "chain"
    }

    async fn credentials(&self) -> Result<Option<Credentials>, CredentialError> {
        for provider in &self.providers {
            if let Some(credentials) = provider.credentials().await? {
                tracing::trace!(provider = provider.name(), "Resolved credentials");
                return Ok(Some(credentials));
            }
        }
        Ok(None)
    }
}

/// Region, service name and credential source used to sign every request.
#[derive(Clone)]
pub struct CredentialContext {
    region: String,
    service: String,
    provider: Arc<dyn CredentialProvider>,
}

impl CredentialContext {
    pub fn new(
        region: impl Into<String>,
        service: impl Into<String>,
        provider: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
            provider,
        }
    }

    /// Builds the default context: region from the environment or the shared
    /// config file, credentials from the default provider chain.
    pub async fn resolve(
        service: impl Into<String>,
        region_override: Option<String>,
        lookup: &Lookup,
    ) -> Result<Self, CredentialError> {
        let region = match region_override {
            Some(region) => region,
            None => resolve_region(lookup).await?,
        };
        Ok(Self::new(
            region,
            service,
            Arc::new(ChainProvider::default_chain(lookup)),
        ))
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Asks the provider for the credentials to sign with right now.
    pub async fn credentials(&self) -> Result<Credentials, CredentialError> {
        self.provider
            .credentials()
            .await?
            .ok_or_else(|| CredentialError::NotFound {
                tried: self.provider.name().to_string(),
            })
    }
}

impl fmt::Debug for CredentialContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialContext")
            .field("region", &self.region)
            .field("service", &self.service)
            .field("provider", &self.provider.name())
            .finish()
    }
}

/// `AWS_REGION`, then `AWS_DEFAULT_REGION`, then the active profile's
/// `region` in the shared config file.
pub async fn resolve_region(lookup: &Lookup) -> Result<String, CredentialError> {
    if let Some(region) = lookup("AWS_REGION").or_else(|| lookup("AWS_DEFAULT_REGION")) {
        return Ok(region);
    }

    let Some(path) = lookup("AWS_CONFIG_FILE")
        .map(PathBuf::from)
        .or_else(|| home_dir(lookup).map(|home| home.join(".aws").join("config")))
    else {
        return Err(CredentialError::MissingRegion);
    };
    let profile = lookup("AWS_PROFILE").unwrap_or_else(|| DEFAULT_PROFILE.to_string());

    read_profiles(&path)
        .await?
        .and_then(|profiles| profiles.get(&profile)?.get("region").cloned())
        .ok_or(CredentialError::MissingRegion)
}

fn home_dir(lookup: &Lookup) -> Option<PathBuf> {
    lookup("HOME").or_else(|| lookup("USERPROFILE")).map(PathBuf::from)
}

/// Reads an AWS-style INI file. A missing file is `Ok(None)`.
async fn read_profiles(
    path: &PathBuf,
) -> Result<Option<HashMap<String, HashMap<String, String>>>, CredentialError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(parse_profiles(&text))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CredentialError::Read {
            path: path.clone(),
            source,
        }),
    }
}

/// Parses `[section]` / `key = value` pairs.
///
/// The config file names sections `[profile foo]` while the credentials file
/// uses `[foo]`; both map to `foo`.
pub fn parse_profiles(text: &str) -> HashMap<String, HashMap<String, String>> {
    let mut profiles: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let section = section.trim();
            let name = section.strip_prefix("profile ").unwrap_or(section).trim();
            profiles.entry(name.to_string()).or_default();
            current = Some(name.to_string());
            continue;
        }

        if let (Some(section), Some((key, value))) = (&current, line.split_once('=')) {
            profiles
                .entry(section.clone())
                .or_default()
                .insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    profiles
}

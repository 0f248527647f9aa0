//! Proxy configuration.
//!
//! Environments are read from `AWS_NEPTUNE_PROXY_*` variables, or from a YAML
//! file when `AWS_NEPTUNE_PROXY_CONFIG` names one. The variables may come from
//! `.env.default` and `.env` files loaded by [`load_env_files`]. Every
//! environment is validated before anything binds; the first problem found is
//! returned and startup stops there.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::credentials::{Lookup, process_env};

pub const ENV_PREFIX: &str = "AWS_NEPTUNE_PROXY";
/// Signing service name for Neptune's IAM authentication.
pub const DEFAULT_SERVICE: &str = "neptune-db";
const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Variables loaded at startup underneath anything already set.
pub const ENV_DEFAULTS_FILE: &str = ".env.default";
/// Variables loaded after the defaults, replacing what is already set.
pub const ENV_OVERRIDES_FILE: &str = ".env";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    pub listen_port: u16,
    /// `host` or `host:port`, without a scheme.
    pub upstream_host: String,
}

impl Environment {
    pub fn listen_addr(&self, bind: IpAddr) -> SocketAddr {
        SocketAddr::new(bind, self.listen_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub environments: Vec<Environment>,
    /// Address every listener binds on.
    pub bind: IpAddr,
    pub service: String,
    /// Overrides the region found in the AWS environment.
    pub region: Option<String>,
    /// How many times a failed environment is restarted before it is given up.
    pub max_restarts: u32,
    pub restart_backoff: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no environments configured; has AWS_NEPTUNE_PROXY_ENVIRONMENTS been set?")]
    NoEnvironments,

    #[error(
        "empty environment name at index {index}; has AWS_NEPTUNE_PROXY_ENVIRONMENTS been configured correctly?"
    )]
    EmptyName { index: usize },

    #[error("listen port not configured for environment {index} ({name})")]
    MissingPort { index: usize, name: String },

    #[error("listen port not a number between 1 and 65535 for environment {index} ({name}): {value:?}")]
    InvalidPort {
        index: usize,
        name: String,
        value: String,
    },

    #[error("host not configured for environment {index} ({name})")]
    MissingHost { index: usize, name: String },

    #[error("invalid upstream host for environment {index} ({name}): {host:?}")]
    InvalidHost {
        index: usize,
        name: String,
        host: String,
    },

    #[error("environment {index} ({name}) is configured more than once")]
    DuplicateName { index: usize, name: String },

    #[error("listen port {port} of environment {index} ({name}) is already used by {other}")]
    DuplicatePort {
        index: usize,
        name: String,
        port: u16,
        other: String,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidSetting { key: String, value: String },

    #[error("failed to read config file {path}: {message}")]
    File { path: String, message: String },

    #[error("failed to load environment file {path}: {message}")]
    EnvFile { path: String, message: String },
}

/// Loads variable files into the process environment.
///
/// `defaults` must exist and parse, and never replaces a variable that is
/// already set. `overrides` replaces anything set before it; when it cannot
/// be loaded a warning is logged and startup carries on.
pub fn load_env_files(
    defaults: impl AsRef<Path>,
    overrides: impl AsRef<Path>,
) -> Result<(), ConfigError> {
    let defaults = defaults.as_ref();
    dotenvy::from_filename(defaults).map_err(|e| ConfigError::EnvFile {
        path: defaults.display().to_string(),
        message: e.to_string(),
    })?;

    let overrides = overrides.as_ref();
    if let Err(e) = dotenvy::from_filename_override(overrides) {
        tracing::warn!(path = %overrides.display(), "Environment overrides not loaded: {}", e);
    }
    Ok(())
}

/// One environment as written by the operator, before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnvironment {
    #[serde(default)]
    name: String,
    listen_port: Option<PortValue>,
    host: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(i64),
    Text(String),
}

impl PortValue {
    fn into_string(self) -> String {
        match self {
            PortValue::Number(n) => n.to_string(),
            PortValue::Text(s) => s,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    bind: Option<String>,
    service: Option<String>,
    region: Option<String>,
    max_restarts: Option<u32>,
    restart_backoff_ms: Option<u64>,
    #[serde(default)]
    environments: Vec<RawEnvironment>,
}

impl Config {
    /// Loads configuration from the process environment, or from the YAML
    /// file named by `AWS_NEPTUNE_PROXY_CONFIG`.
    pub fn load() -> Result<Self, ConfigError> {
        let lookup = process_env();
        match lookup(&format!("{ENV_PREFIX}_CONFIG")) {
            Some(path) => Self::from_yaml_file(path),
            None => Self::from_lookup(&lookup),
        }
    }

    /// Reads the `AWS_NEPTUNE_PROXY_*` variables through `lookup`.
    pub fn from_lookup(lookup: &Lookup) -> Result<Self, ConfigError> {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}_{suffix}"));

        let names = var("ENVIRONMENTS").ok_or(ConfigError::NoEnvironments)?;
        let environments = names
            .split(',')
            .map(|name| {
                let name = name.trim().to_string();
                RawEnvironment {
                    listen_port: var(&format!("{name}_LISTEN_PORT")).map(PortValue::Text),
                    host: var(&format!("{name}_HOST")),
                    name,
                }
            })
            .collect();

        let raw = RawConfig {
            bind: var("BIND"),
            service: var("SERVICE"),
            region: var("REGION"),
            max_restarts: var("MAX_RESTARTS")
                .map(|v| parse_setting(&format!("{ENV_PREFIX}_MAX_RESTARTS"), &v))
                .transpose()?,
            restart_backoff_ms: var("RESTART_BACKOFF_MS")
                .map(|v| parse_setting(&format!("{ENV_PREFIX}_RESTART_BACKOFF_MS"), &v))
                .transpose()?,
            environments,
        };

        Self::from_raw(raw)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&text).map_err(|e| match e {
            ConfigError::File { message, .. } => ConfigError::File {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text).map_err(|e| ConfigError::File {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.environments.is_empty() {
            return Err(ConfigError::NoEnvironments);
        }

        let bind = match raw.bind {
            Some(bind) => parse_setting("bind", &bind)?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let mut environments: Vec<Environment> = Vec::with_capacity(raw.environments.len());
        let mut ports: HashMap<u16, String> = HashMap::new();

        for (index, env) in raw.environments.into_iter().enumerate() {
            let validated = validate_environment(index, env)?;

            if environments.iter().any(|e| e.name == validated.name) {
                return Err(ConfigError::DuplicateName {
                    index,
                    name: validated.name,
                });
            }
            if let Some(other) = ports.get(&validated.listen_port) {
                return Err(ConfigError::DuplicatePort {
                    index,
                    name: validated.name,
                    port: validated.listen_port,
                    other: other.clone(),
                });
            }

            ports.insert(validated.listen_port, validated.name.clone());
            environments.push(validated);
        }

        Ok(Self {
            environments,
            bind,
            service: raw.service.unwrap_or_else(|| DEFAULT_SERVICE.to_string()),
            region: raw.region,
            max_restarts: raw.max_restarts.unwrap_or(0),
            restart_backoff: raw
                .restart_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RESTART_BACKOFF),
        })
    }
}

fn validate_environment(index: usize, raw: RawEnvironment) -> Result<Environment, ConfigError> {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        return Err(ConfigError::EmptyName { index });
    }

    let port = raw
        .listen_port
        .map(PortValue::into_string)
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingPort {
            index,
            name: name.clone(),
        })?;
    let listen_port = port
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ConfigError::InvalidPort {
            index,
            name: name.clone(),
            value: port.clone(),
        })?;

    let host = raw
        .host
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ConfigError::MissingHost {
            index,
            name: name.clone(),
        })?;
    if !is_valid_upstream_host(&host) {
        return Err(ConfigError::InvalidHost { index, name, host });
    }

    Ok(Environment {
        name,
        listen_port,
        upstream_host: host,
    })
}

/// A bare `host` or `host:port`: no scheme, path, query or credentials.
fn is_valid_upstream_host(host: &str) -> bool {
    if host.contains("://") || host.contains(['/', '?', '#', '@']) {
        return false;
    }
    match url::Url::parse(&format!("https://{host}/")) {
        Ok(url) => url.host_str().is_some_and(|h| !h.is_empty()) && url.path() == "/",
        Err(_) => false,
    }
}

fn parse_setting<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidSetting {
        key: key.to_string(),
        value: value.to_string(),
    })
}

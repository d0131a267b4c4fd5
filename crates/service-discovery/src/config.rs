use std::env;
use std::time::Duration;

use crate::error::{RegistryError, Result};
use crate::path;

pub const DEFAULT_ROOT_PATH: &str = "/api";
pub const DEFAULT_ENDPOINTS: &str = "localhost:2379";
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Connection and layout settings for a [`ServiceRegistry`].
///
/// [`ServiceRegistry`]: crate::ServiceRegistry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Namespace root under which every service lives.
    pub root_path: String,
    /// etcd endpoints, e.g. `["localhost:2379"]`.
    pub endpoints: Vec<String>,
    /// How long an unresponsive session keeps its ephemeral nodes.
    pub session_timeout: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl RegistryConfig {
    pub fn new(endpoints: Vec<String>, root_path: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            endpoints,
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Read the configuration from the process environment.
    ///
    /// - `ETCD_ENDPOINTS`: comma separated (default `localhost:2379`)
    /// - `SERVICE_REGISTRY_ROOT` (default `/api`)
    /// - `SERVICE_REGISTRY_SESSION_TIMEOUT_SECS` (default 10)
    /// - `SERVICE_REGISTRY_CONNECT_TIMEOUT_SECS` (default 5)
    /// - `SERVICE_REGISTRY_REQUEST_TIMEOUT_SECS` (default 5)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but with a caller-supplied lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoints = lookup("ETCD_ENDPOINTS")
            .unwrap_or_else(|| DEFAULT_ENDPOINTS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        let root_path =
            lookup("SERVICE_REGISTRY_ROOT").unwrap_or_else(|| DEFAULT_ROOT_PATH.to_string());

        let secs = |key: &str, default: u64| -> Result<Duration> {
            match lookup(key) {
                None => Ok(Duration::from_secs(default)),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| RegistryError::Config(format!("{key}={raw}: {e}"))),
            }
        };

        let config = Self {
            root_path,
            endpoints,
            session_timeout: secs(
                "SERVICE_REGISTRY_SESSION_TIMEOUT_SECS",
                DEFAULT_SESSION_TIMEOUT_SECS,
            )?,
            connect_timeout: secs(
                "SERVICE_REGISTRY_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )?,
            request_timeout: secs(
                "SERVICE_REGISTRY_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(RegistryError::Config("no etcd endpoints configured".into()));
        }
        path::validate(&self.root_path)
            .map_err(|e| RegistryError::Config(format!("root path: {e}")))?;
        for (name, value) in [
            ("session timeout", self.session_timeout),
            ("connect timeout", self.connect_timeout),
            ("request timeout", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(RegistryError::Config(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new(vec![DEFAULT_ENDPOINTS.to_string()], DEFAULT_ROOT_PATH)
    }
}

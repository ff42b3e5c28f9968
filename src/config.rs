//! Validated server settings.
//!
//! clap parses and type-checks the raw values; [`Config::validate`] checks
//! what clap cannot (URL schemes, zero durations, origin shape) so startup
//! fails before anything is connected.

use crate::broker::topology::TopologyConfig;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name,
            reason: reason.into(),
        }
    }
}

/// S3-compatible bucket for uploads. Without static credentials the default
/// AWS provider chain (`AWS_ACCESS_KEY_ID`, profiles, ...) is used.
#[derive(Clone, Debug)]
pub struct ObjectStoreConfig {
    pub url: String,
    pub bucket: String,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<SecretString>,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9000".to_string(),
            bucket: "user-files".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    port: u16,
    dsn: SecretString,
    broker_url: SecretString,
    message_ttl: Option<Duration>,
    login_timeout: Duration,
    verifier_workers: usize,
    object_store: ObjectStoreConfig,
    frontend_origin: String,
    topology: TopologyConfig,
}

impl Config {
    #[must_use]
    pub fn new(dsn: SecretString, broker_url: SecretString) -> Self {
        Self {
            port: 8080,
            dsn,
            broker_url,
            message_ttl: Some(Duration::from_secs(60)),
            login_timeout: Duration::from_secs(5),
            verifier_workers: 1,
            object_store: ObjectStoreConfig::default(),
            frontend_origin: "http://localhost:3000".to_string(),
            topology: TopologyConfig::default(),
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// A TTL of zero disables expiry on primary queues.
    #[must_use]
    pub fn with_message_ttl_ms(mut self, millis: u64) -> Self {
        self.message_ttl = (millis > 0).then(|| Duration::from_millis(millis));
        self
    }

    #[must_use]
    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_verifier_workers(mut self, workers: usize) -> Self {
        self.verifier_workers = workers;
        self
    }

    #[must_use]
    pub fn with_object_store(mut self, object_store: ObjectStoreConfig) -> Self {
        self.object_store = object_store;
        self
    }

    #[must_use]
    pub fn with_frontend_origin(mut self, origin: impl Into<String>) -> Self {
        self.frontend_origin = origin.into();
        self
    }

    /// # Errors
    /// Returns [`ConfigError`] for the first setting that cannot work.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.dsn.expose_secret().trim().is_empty() {
            return Err(ConfigError::Missing("dsn"));
        }

        self.broker_url()?;

        if self.login_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "login timeout",
                "must be greater than zero",
            ));
        }

        let origin = Url::parse(&self.frontend_origin)
            .map_err(|err| ConfigError::invalid("frontend origin", err.to_string()))?;
        if origin.host_str().is_none() {
            return Err(ConfigError::invalid("frontend origin", "missing host"));
        }

        let base = Url::parse(&self.object_store.url)
            .map_err(|err| ConfigError::invalid("object store url", err.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "object store url",
                format!("unsupported scheme: {}", base.scheme()),
            ));
        }

        let bucket = &self.object_store.bucket;
        if bucket.trim().is_empty() || bucket.contains('/') {
            return Err(ConfigError::invalid(
                "object store bucket",
                "must be a single non-empty path segment",
            ));
        }

        let store = &self.object_store;
        if store.access_key_id.is_some() != store.secret_access_key.is_some() {
            return Err(ConfigError::invalid(
                "object store credentials",
                "access key and secret key must be set together",
            ));
        }

        Ok(self)
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn dsn(&self) -> &SecretString {
        &self.dsn
    }

    /// # Errors
    /// Returns [`ConfigError::Invalid`] if the URL does not parse or uses a
    /// scheme other than `amqp`, `amqps` or `memory`.
    pub fn broker_url(&self) -> Result<Url, ConfigError> {
        // The URL may embed credentials; keep them out of the error.
        let url = Url::parse(self.broker_url.expose_secret())
            .map_err(|err| ConfigError::invalid("broker url", err.to_string()))?;
        match url.scheme() {
            "amqp" | "amqps" | "memory" => Ok(url),
            scheme => Err(ConfigError::invalid(
                "broker url",
                format!("unsupported scheme: {scheme}"),
            )),
        }
    }

    #[must_use]
    pub const fn login_timeout(&self) -> Duration {
        self.login_timeout
    }

    #[must_use]
    pub const fn verifier_workers(&self) -> usize {
        self.verifier_workers
    }

    #[must_use]
    pub fn object_store(&self) -> &ObjectStoreConfig {
        &self.object_store
    }

    #[must_use]
    pub fn frontend_origin(&self) -> &str {
        &self.frontend_origin
    }

    /// Topology names with this configuration's TTL applied.
    #[must_use]
    pub fn topology(&self) -> TopologyConfig {
        self.topology.clone().with_message_ttl(self.message_ttl)
    }
}

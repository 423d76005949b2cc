use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::transport::RequestTransformer;

/// Errors raised while validating a [`ServerConfig`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid protocol {0:?}: expected \"http\" or \"https\"")]
    InvalidProtocol(String),

    #[error("hostname must not be empty")]
    MissingHostname,

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Wire protocol spoken to every endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    #[default]
    Https,
}

impl Protocol {
    /// URI scheme for this protocol
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    /// Port implied by the scheme when none is written in a URI
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Protocol::Https)
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(ConfigError::InvalidProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// How the hostname is turned into addresses
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolverSettings {
    /// Operating system resolver (getaddrinfo)
    #[default]
    System,

    /// hickory stub resolver with an explicit cache TTL ceiling
    Hickory {
        /// Upper bound on how long positive answers are cached, in seconds
        #[serde(default)]
        cache_ttl_secs: Option<u64>,
    },

    /// Fixed list of addresses, no lookup performed
    Static { addresses: Vec<IpAddr> },
}

/// Trust anchors used when verifying endpoint certificates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Trust the bundled Mozilla root set
    #[serde(default = "default_webpki_roots")]
    pub webpki_roots: bool,

    /// Additional PEM encoded CA certificates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
}

fn default_webpki_roots() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            webpki_roots: default_webpki_roots(),
            ca_file: None,
        }
    }
}

/// Limits for the per-address idle connection cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCacheConfig {
    /// Maximum idle connections kept for one address
    #[serde(default = "default_max_idle_per_address")]
    pub max_idle_per_address: usize,

    /// Idle connections older than this are discarded, in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_max_idle_per_address() -> usize {
    32
}

fn default_idle_timeout_secs() -> u64 {
    90
}

impl ConnectionCacheConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ConnectionCacheConfig {
    fn default() -> Self {
        Self {
            max_idle_per_address: default_max_idle_per_address(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

/// Everything needed to reach one logical server
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Logical hostname; also the TLS name every certificate is checked against
    pub hostname: String,

    /// Port used for every resolved address (default: 443)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path probed by health checks (default: empty, i.e. `/`)
    #[serde(default)]
    pub health_path: String,

    /// `http` or `https` (default: https)
    #[serde(default)]
    pub protocol: Protocol,

    /// DNS refresh interval in seconds
    #[serde(default = "default_dns_refresh_period_secs")]
    pub dns_refresh_period_secs: u64,

    /// Health probe interval in seconds
    #[serde(default = "default_health_check_period_secs")]
    pub health_check_period_secs: u64,

    /// Timeout for one health probe in milliseconds
    #[serde(default = "default_health_read_timeout_ms")]
    pub health_read_timeout_ms: u64,

    /// Reserved; parsed and kept but not consulted (-1 = disabled)
    #[serde(default = "default_failure_response_count_threshold")]
    pub failure_response_count_threshold: i32,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub resolver: ResolverSettings,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub connection_cache: ConnectionCacheConfig,

    /// Hook applied to every request before it is retargeted
    #[serde(skip)]
    pub transformer: Option<RequestTransformer>,
}

fn default_port() -> u16 {
    443
}

fn default_dns_refresh_period_secs() -> u64 {
    300
}

fn default_health_check_period_secs() -> u64 {
    30
}

fn default_health_read_timeout_ms() -> u64 {
    5000
}

fn default_failure_response_count_threshold() -> i32 {
    -1
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl ServerConfig {
    /// Configuration for `hostname` with every other field at its default
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: default_port(),
            health_path: String::new(),
            protocol: Protocol::default(),
            dns_refresh_period_secs: default_dns_refresh_period_secs(),
            health_check_period_secs: default_health_check_period_secs(),
            health_read_timeout_ms: default_health_read_timeout_ms(),
            failure_response_count_threshold: default_failure_response_count_threshold(),
            connect_timeout_ms: default_connect_timeout_ms(),
            resolver: ResolverSettings::default(),
            tls: TlsConfig::default(),
            connection_cache: ConnectionCacheConfig::default(),
            transformer: None,
        }
    }

    /// Install a request transformer
    pub fn with_transformer(mut self, transformer: RequestTransformer) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn dns_refresh_period(&self) -> Duration {
        Duration::from_secs(self.dns_refresh_period_secs)
    }

    pub fn health_check_period(&self) -> Duration {
        Duration::from_secs(self.health_check_period_secs)
    }

    pub fn health_read_timeout(&self) -> Duration {
        Duration::from_millis(self.health_read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check the invariants that serde cannot express
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::MissingHostname);
        }
        if self.hostname.contains("://") || self.hostname.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "hostname",
                reason: format!("{:?} is not a bare hostname", self.hostname),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port",
                reason: "must be non-zero".to_string(),
            });
        }

        let positive = [
            ("dns_refresh_period_secs", self.dns_refresh_period_secs),
            ("health_check_period_secs", self.health_check_period_secs),
            ("health_read_timeout_ms", self.health_read_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("health_path", &self.health_path)
            .field("protocol", &self.protocol)
            .field("dns_refresh_period_secs", &self.dns_refresh_period_secs)
            .field("health_check_period_secs", &self.health_check_period_secs)
            .field("health_read_timeout_ms", &self.health_read_timeout_ms)
            .field("failure_response_count_threshold", &self.failure_response_count_threshold)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("resolver", &self.resolver)
            .field("tls", &self.tls)
            .field("connection_cache", &self.connection_cache)
            .field("transformer", &self.transformer.is_some())
            .finish()
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<ServerConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: ServerConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    config.validate().context("Invalid configuration")?;

    Ok(config)
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse()
                .context(format!("{} has an invalid value: {:?}", name, raw))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

/// Load configuration from environment variables
///
/// - HOSTPOOL_HOSTNAME (required)
/// - HOSTPOOL_PORT
/// - HOSTPOOL_PROTOCOL (`http` or `https`)
/// - HOSTPOOL_HEALTH_PATH
/// - HOSTPOOL_DNS_REFRESH_SECS
/// - HOSTPOOL_HEALTH_CHECK_SECS
/// - HOSTPOOL_HEALTH_READ_TIMEOUT_MS
/// - HOSTPOOL_CONNECT_TIMEOUT_MS
/// - HOSTPOOL_CA_FILE
pub fn load_from_env() -> Result<ServerConfig> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let hostname = std::env::var("HOSTPOOL_HOSTNAME")
        .context("HOSTPOOL_HOSTNAME environment variable not set")?;

    let mut config = ServerConfig::new(hostname);

    if let Some(port) = env_parse("HOSTPOOL_PORT")? {
        config.port = port;
    }
    if let Some(protocol) = env_parse("HOSTPOOL_PROTOCOL")? {
        config.protocol = protocol;
    }
    if let Ok(path) = std::env::var("HOSTPOOL_HEALTH_PATH") {
        config.health_path = path;
    }
    if let Some(secs) = env_parse("HOSTPOOL_DNS_REFRESH_SECS")? {
        config.dns_refresh_period_secs = secs;
    }
    if let Some(secs) = env_parse("HOSTPOOL_HEALTH_CHECK_SECS")? {
        config.health_check_period_secs = secs;
    }
    if let Some(ms) = env_parse("HOSTPOOL_HEALTH_READ_TIMEOUT_MS")? {
        config.health_read_timeout_ms = ms;
    }
    if let Some(ms) = env_parse("HOSTPOOL_CONNECT_TIMEOUT_MS")? {
        config.connect_timeout_ms = ms;
    }
    if let Ok(ca_file) = std::env::var("HOSTPOOL_CA_FILE") {
        config.tls.ca_file = Some(PathBuf::from(ca_file));
    }

    config.validate().context("Invalid configuration")?;

    Ok(config)
}

/// Load configuration from a YAML file when a path is given, otherwise from the environment
pub fn load_config(config_path: Option<&str>) -> Result<ServerConfig> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}

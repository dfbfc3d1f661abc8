//! Network configuration
//!
//! [`NetworkConfig`] is loaded once at startup (YAML file or defaults) and is
//! afterwards only ever replaced wholesale. [`SharedConfig`] publishes the
//! current snapshot as an `Arc<NetworkConfig>`, so readers hold either the old
//! or the new configuration, never a mix of both.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which entries the response cache evicts first when it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpirationPolicy {
    /// Least recently accessed first
    #[default]
    Lru,
    /// Oldest insertion first
    Age,
}

impl std::fmt::Display for ExpirationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpirationPolicy::Lru => write!(f, "lru"),
            ExpirationPolicy::Age => write!(f, "age"),
        }
    }
}

/// How the query string takes part in cache identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryNormalization {
    /// Query kept byte-for-byte
    #[default]
    Preserve,
    /// Parameters sorted by name, so `?b=2&a=1` and `?a=1&b=2` share an entry
    Sorted,
    /// Query dropped entirely
    Ignore,
}

/// Cache-key normalization policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheKeyPolicy {
    pub query: QueryNormalization,
    /// Request headers whose values are part of the key (case-insensitive)
    pub vary_headers: Vec<String>,
}

impl Default for CacheKeyPolicy {
    fn default() -> Self {
        Self {
            query: QueryNormalization::Preserve,
            vary_headers: vec!["accept".to_string(), "accept-language".to_string()],
        }
    }
}

/// Process-wide network settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Global ceiling on open pooled connections
    pub max_connections: usize,
    /// Ceiling on open connections per (address, secure) destination
    pub max_connections_per_host: usize,
    /// Timeout for one send/receive exchange
    pub request_timeout_ms: u64,
    /// Timeout for establishing a transport connection
    pub connect_timeout_ms: u64,
    /// How long an acquisition waits for a free connection
    pub pool_acquire_timeout_ms: u64,
    /// Idle connections older than this are closed on the next acquisition scan
    pub idle_timeout_secs: u64,
    pub max_connection_age_secs: u64,

    /// Total attempts per logical fetch
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Fraction of each backoff delay randomized (0 disables jitter)
    pub retry_jitter: f64,

    /// Nameservers queried in order; empty means the system resolver
    pub dns_servers: Vec<SocketAddr>,
    pub dns_timeout_ms: u64,
    pub dns_cache_size: usize,
    pub dns_ttl_secs: u64,
    pub dns_negative_ttl_secs: u64,

    pub cache_max_bytes: usize,
    pub cache_policy: ExpirationPolicy,
    /// Freshness lifetime for responses without freshness directives
    pub cache_default_ttl_secs: u64,
    pub cache_key: CacheKeyPolicy,

    /// Handed to the TLS provider for certificate validation
    pub ca_bundle_path: Option<PathBuf>,
    /// Largest response body read from the wire
    pub max_response_bytes: usize,

    pub monitor_interval_secs: u64,
    pub speed_test_url: Option<String>,
    pub upload_test_url: Option<String>,

    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            max_connections_per_host: 6,
            request_timeout_ms: 15_000,
            connect_timeout_ms: 5_000,
            pool_acquire_timeout_ms: 10_000,
            idle_timeout_secs: 60,
            max_connection_age_secs: 300,
            max_retries: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 10_000,
            retry_jitter: 0.0,
            dns_servers: Vec::new(),
            dns_timeout_ms: 2_000,
            dns_cache_size: 1_000,
            dns_ttl_secs: 300,
            dns_negative_ttl_secs: 30,
            cache_max_bytes: 64 * 1024 * 1024,
            cache_policy: ExpirationPolicy::Lru,
            cache_default_ttl_secs: 300,
            cache_key: CacheKeyPolicy::default(),
            ca_bundle_path: None,
            max_response_bytes: 64 * 1024 * 1024,
            monitor_interval_secs: 60,
            speed_test_url: None,
            upload_test_url: None,
            user_agent: concat!("netfetch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl NetworkConfig {
    /// Load and validate a YAML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate YAML; missing fields take their defaults
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: NetworkConfig = serde_yaml::from_str(text)?;
        config.validate()
    }

    /// Reject unusable values and clamp the per-host ceiling to the global one
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.max_connections_per_host == 0 {
            return Err(ConfigError::Invalid(
                "max_connections_per_host must be at least 1".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
        }
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.pool_acquire_timeout_ms == 0 {
            return Err(ConfigError::Invalid("pool_acquire_timeout_ms must be non-zero".into()));
        }
        if self.dns_negative_ttl_secs >= self.dns_ttl_secs {
            return Err(ConfigError::Invalid(format!(
                "dns_negative_ttl_secs ({}) must be shorter than dns_ttl_secs ({})",
                self.dns_negative_ttl_secs, self.dns_ttl_secs
            )));
        }
        if self.max_response_bytes == 0 {
            return Err(ConfigError::Invalid("max_response_bytes must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::Invalid("retry_jitter must be within 0.0..=1.0".into()));
        }
        if self.monitor_interval_secs == 0 {
            return Err(ConfigError::Invalid("monitor_interval_secs must be non-zero".into()));
        }
        self.max_connections_per_host = self.max_connections_per_host.min(self.max_connections);
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_acquire_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

/// Handle to the current configuration snapshot.
///
/// Cloning the handle shares the same underlying channel.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    tx: Arc<watch::Sender<Arc<NetworkConfig>>>,
}

impl SharedConfig {
    pub fn new(config: NetworkConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// The configuration in effect right now
    pub fn snapshot(&self) -> Arc<NetworkConfig> {
        self.tx.borrow().clone()
    }

    /// Swap in a new configuration, returning the previous one
    pub fn replace(&self, config: NetworkConfig) -> Arc<NetworkConfig> {
        self.tx.send_replace(Arc::new(config))
    }

    /// Receive every future configuration swap
    pub fn subscribe(&self) -> watch::Receiver<Arc<NetworkConfig>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetworkConfig::default().validate().unwrap();
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.cache_policy, ExpirationPolicy::Lru);
        assert!(config.dns_negative_ttl_secs < config.dns_ttl_secs);
    }

    #[test]
    fn test_yaml_partial_override() {
        let config = NetworkConfig::from_yaml_str(
            r#"
max_connections: 4
dns_servers: ["1.1.1.1:53", "8.8.8.8:53"]
cache_policy: age
cache_key:
  query: sorted
"#,
        )
        .unwrap();

        assert_eq!(config.max_connections, 4);
        assert_eq!(config.max_connections_per_host, 4); // clamped from 6
        assert_eq!(config.dns_servers.len(), 2);
        assert_eq!(config.cache_policy, ExpirationPolicy::Age);
        assert_eq!(config.cache_key.query, QueryNormalization::Sorted);
        assert_eq!(config.cache_key.vary_headers, CacheKeyPolicy::default().vary_headers);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_validate_rejects_zero_ceiling() {
        let config = NetworkConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_jitter() {
        let config = NetworkConfig {
            retry_jitter: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_long_negative_dns_ttl() {
        let err = NetworkConfig::from_yaml_str("dns_negative_ttl_secs: 600").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let equal = NetworkConfig {
            dns_ttl_secs: 60,
            dns_negative_ttl_secs: 60,
            ..Default::default()
        };
        assert!(equal.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_acquire_timeout() {
        let config = NetworkConfig {
            pool_acquire_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_response_limit() {
        let config = NetworkConfig {
            max_response_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "request_timeout_ms: 30000\nmax_retries: 5").unwrap();

        let config = NetworkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn test_from_missing_file() {
        let err = NetworkConfig::from_file("/nonexistent/netfetch.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_shared_config_swap_is_whole() {
        let shared = SharedConfig::new(NetworkConfig::default());
        let before = shared.snapshot();

        let previous = shared.replace(NetworkConfig {
            max_connections: 2,
            max_connections_per_host: 2,
            ..Default::default()
        });

        assert_eq!(previous.max_connections, 16);
        // a snapshot taken earlier stays fully valid
        assert_eq!(before.max_connections, 16);
        assert_eq!(before.max_connections_per_host, 6);
        let after = shared.snapshot();
        assert_eq!(after.max_connections, 2);
        assert_eq!(after.max_connections_per_host, 2);
    }

    #[tokio::test]
    async fn test_shared_config_notifies_subscribers() {
        let shared = SharedConfig::new(NetworkConfig::default());
        let mut rx = shared.subscribe();

        shared.replace(NetworkConfig {
            request_timeout_ms: 1,
            ..Default::default()
        });

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().request_timeout_ms, 1);
    }
}

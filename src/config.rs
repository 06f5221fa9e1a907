//! Configuration management for Windowgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::admission::FailurePolicy;
use crate::error::{GateError, Result};
use crate::ratelimit::{
    LimiterOptions, RateLimitPolicy, Salt, DEFAULT_KEY_PREFIX, DEFAULT_POOL_CAPACITY,
};
use crate::store::{ExpiryMode, RedisStoreConfig};

/// Prefix for environment overrides, e.g. `WINDOWGATE__LIMITER__SALT`.
pub const ENV_PREFIX: &str = "WINDOWGATE";

/// Main configuration for the Windowgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Sliding window configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Counter store connection
    #[serde(default)]
    pub store: RedisStoreConfig,

    /// Admission behaviour
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sliding window configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum admitted requests per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in milliseconds
    #[serde(default = "default_window_size_ms")]
    pub window_size_ms: u64,

    /// Bucket length in milliseconds; must divide the window exactly
    #[serde(default = "default_sub_window_size_ms")]
    pub sub_window_size_ms: u64,

    /// Secret mixed into client key digests
    #[serde(default)]
    pub salt: String,

    /// Namespace prepended to every store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-field or whole-key bucket expiry
    #[serde(default)]
    pub expiry: ExpiryMode,

    /// Bound on one store round trip in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Idle digest states kept for reuse
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

impl std::fmt::Debug for LimiterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterConfig")
            .field("limit", &self.limit)
            .field("window_size_ms", &self.window_size_ms)
            .field("sub_window_size_ms", &self.sub_window_size_ms)
            .field("salt", &Salt::new(self.salt.clone()))
            .field("key_prefix", &self.key_prefix)
            .field("expiry", &self.expiry)
            .field("store_timeout_ms", &self.store_timeout_ms)
            .field("pool_capacity", &self.pool_capacity)
            .finish()
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_size_ms: default_window_size_ms(),
            sub_window_size_ms: default_sub_window_size_ms(),
            salt: String::new(),
            key_prefix: default_key_prefix(),
            expiry: ExpiryMode::default(),
            store_timeout_ms: default_store_timeout_ms(),
            pool_capacity: default_pool_capacity(),
        }
    }
}

fn default_limit() -> u64 {
    5
}

fn default_window_size_ms() -> u64 {
    60_000
}

fn default_sub_window_size_ms() -> u64 {
    20_000
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

impl LimiterConfig {
    /// Validate into a policy.
    pub fn policy(&self) -> Result<RateLimitPolicy> {
        RateLimitPolicy::new(
            self.limit,
            Duration::from_millis(self.window_size_ms),
            Duration::from_millis(self.sub_window_size_ms),
        )
    }

    pub fn salt(&self) -> Salt {
        Salt::new(self.salt.clone())
    }

    pub fn options(&self) -> Result<LimiterOptions> {
        if self.store_timeout_ms == 0 {
            return Err(GateError::Config(
                "store_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(LimiterOptions {
            key_prefix: self.key_prefix.clone(),
            expiry: self.expiry,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            pool_capacity: self.pool_capacity,
        })
    }
}

/// Admission behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Behaviour while the counter store is unavailable
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Layer an optional file under `WINDOWGATE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GateError::Config(e.to_string()))
    }

    /// Check every section that can be checked without a store.
    pub fn validate(&self) -> Result<()> {
        self.limiter.policy()?;
        self.limiter.options()?;
        if self.store.connect_timeout_ms == 0 {
            return Err(GateError::Config(
                "store.connect_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let config = GateConfig::default();
        let policy = config.limiter.policy().unwrap();

        assert_eq!(policy.limit(), 5);
        assert_eq!(policy.num_sub_windows(), 3);
        assert_eq!(config.limiter.key_prefix, "rate_limit:");
        assert_eq!(config.limiter.expiry, ExpiryMode::Field);
        assert_eq!(config.admission.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.store.url, "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
limiter:
  limit: 100
  window_size_ms: 60000
  sub_window_size_ms: 10000
  salt: pepper
  expiry: key
store:
  url: redis://cache:6379/1
admission:
  failure_policy: fail_open
logging:
  level: debug
  json: true
"#;
        let config = GateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limiter.limit, 100);
        assert_eq!(config.limiter.policy().unwrap().num_sub_windows(), 6);
        assert_eq!(config.limiter.expiry, ExpiryMode::Key);
        assert_eq!(config.store.url, "redis://cache:6379/1");
        assert_eq!(config.admission.failure_policy, FailurePolicy::FailOpen);
        assert!(config.logging.json);
        assert!(!config.limiter.salt().is_empty());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = GateConfig::from_yaml("limiter:\n  limit: 7\n").unwrap();
        assert_eq!(config.limiter.limit, 7);
        assert_eq!(config.limiter.window_size_ms, 60_000);
        assert_eq!(config.limiter.store_timeout_ms, 250);
    }

    #[test]
    fn test_invalid_window_is_config_error() {
        let config = GateConfig::from_yaml(
            "limiter:\n  window_size_ms: 60000\n  sub_window_size_ms: 7000\n",
        )
        .unwrap();
        assert_err!(config.validate());

        let config = GateConfig::from_yaml("limiter:\n  limit: 0\n").unwrap();
        assert!(matches!(config.validate(), Err(GateError::Config(_))));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let config = GateConfig::from_yaml("limiter:\n  store_timeout_ms: 0\n").unwrap();
        assert_err!(config.limiter.options());
    }

    #[test]
    fn test_store_connect_bounds() {
        let config = GateConfig::from_yaml(
            "store:\n  url: redis://cache/\n  connect_timeout_ms: 500\n  connect_retries: 0\n",
        )
        .unwrap();
        assert_eq!(config.store.connect_timeout_ms, 500);
        assert_eq!(config.store.connect_retries, 0);
        assert_ok!(config.validate());

        let config = GateConfig::from_yaml("store:\n  connect_timeout_ms: 0\n").unwrap();
        assert_err!(config.validate());
    }

    #[test]
    fn test_malformed_yaml() {
        assert_err!(GateConfig::from_yaml("limiter: [unclosed"));
    }

    #[test]
    fn test_debug_hides_salt() {
        let config = GateConfig::from_yaml("limiter:\n  salt: hunter2\n").unwrap();
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn test_load_without_file() {
        let config = assert_ok!(GateConfig::load(None));
        assert_ok!(config.validate());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("windowgate-{}.yaml", std::process::id()));
        std::fs::write(&path, "limiter:\n  limit: 42\n  salt: abc\n").unwrap();

        let config = GateConfig::load(Some(&path)).unwrap();
        assert_eq!(config.limiter.limit, 42);
        assert_eq!(config.limiter.salt, "abc");

        std::fs::remove_file(&path).unwrap();
    }
}

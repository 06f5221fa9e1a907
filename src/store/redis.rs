//! Redis-backed counter store.
//!
//! Each client is one Redis hash keyed by its namespaced store key; each
//! bucket is a field of that hash. A check is a single non-transactional
//! pipeline:
//!
//! ```text
//! HINCRBY   rate_limit:<digest> <bucket> 1
//! HPEXPIRE  rate_limit:<digest> <window_ms> NX FIELDS 1 <bucket>
//! HGET      rate_limit:<digest> <bucket>        (once per trailing bucket)
//! ```
//!
//! `HPEXPIRE` needs Redis 7.4 or newer. Older servers reject it and every
//! check fails; configure [`ExpiryMode::Key`] for them, which swaps it for a
//! whole-key `PEXPIRE`.
//!
//! ## Connection handling
//!
//! The adapter holds a `redis::aio::ConnectionManager`, which multiplexes
//! commands over one connection and reconnects after failures. Handles are
//! cheap clones of the manager.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{CounterBatch, CounterStore, ExpiryMode};
use crate::error::StoreError;

/// Connection settings for the Redis store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Bound on establishing the initial connection, retries included
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Reconnect attempts after a failed connection
    #[serde(default = "default_connect_retries")]
    pub connect_retries: usize,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_retries: default_connect_retries(),
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_connect_retries() -> usize {
    2
}

impl RedisStoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn manager_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig::new()
            .set_connection_timeout(self.connect_timeout())
            .set_number_of_retries(self.connect_retries)
    }
}

/// Counter store shared by every service instance through Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect with the default configuration.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(RedisStoreConfig {
            url: url.to_string(),
            ..RedisStoreConfig::default()
        })
        .await
    }

    /// Connect using the given configuration.
    ///
    /// The connection manager's own reconnect backoff is capped by
    /// `connect_retries`, and the whole attempt by `connect_timeout_ms`.
    ///
    /// # Errors
    /// Returns [`StoreError::Connection`] if the URL is invalid or the server
    /// refuses every attempt, and [`StoreError::Timeout`] if no connection is
    /// established in time.
    pub async fn connect_with_config(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let timeout = config.connect_timeout();
        let connecting = ConnectionManager::new_with_config(client, config.manager_config());
        let connection = match tokio::time::timeout(timeout, connecting).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                warn!(url = %redact_url(&config.url), error = %e, "Redis connection failed");
                return Err(StoreError::Connection(e.to_string()));
            }
            Err(_) => {
                warn!(
                    url = %redact_url(&config.url),
                    timeout = ?timeout,
                    "Redis connection timed out"
                );
                return Err(StoreError::Timeout(Some(timeout)));
            }
        };

        info!(url = %redact_url(&config.url), "Connected to Redis counter store");

        Ok(Self { connection, config })
    }

    fn pipeline(batch: &CounterBatch) -> redis::Pipeline {
        let ttl_ms = batch.ttl.as_millis() as u64;
        let mut pipe = redis::pipe();

        pipe.hincr(&batch.key, &batch.field, batch.increment).ignore();

        match batch.expiry {
            ExpiryMode::Field => {
                pipe.cmd("HPEXPIRE")
                    .arg(&batch.key)
                    .arg(ttl_ms)
                    .arg("NX")
                    .arg("FIELDS")
                    .arg(1)
                    .arg(&batch.field)
                    .ignore();
            }
            ExpiryMode::Key => {
                pipe.cmd("PEXPIRE").arg(&batch.key).arg(ttl_ms).ignore();
            }
        }

        for field in &batch.reads {
            pipe.hget(&batch.key, field);
        }

        pipe
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn record_and_read(&self, batch: &CounterBatch) -> Result<Vec<Option<u64>>, StoreError> {
        let mut conn = self.connection.clone();
        let values: Vec<Option<u64>> = Self::pipeline(batch)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(error = %e, key = %batch.key, "Redis counter pipeline failed");
                StoreError::from(e)
            })?;
        Ok(values)
    }

    async fn read(&self, key: &str, fields: &[String]) -> Result<Vec<Option<u64>>, StoreError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for field in fields {
            pipe.hget(key, field);
        }

        let mut conn = self.connection.clone();
        let values: Vec<Option<u64>> = pipe.query_async(&mut conn).await.map_err(|e| {
            warn!(error = %e, key = %key, "Redis counter read failed");
            StoreError::from(e)
        })?;
        Ok(values)
    }
}

/// Strip credentials from a connection URL before logging it.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

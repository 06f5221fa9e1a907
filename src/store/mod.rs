//! Shared counter store adapters.
//!
//! The limiter keeps no mutable state of its own. Every count lives in a
//! [`CounterStore`]: one hash per store key, one field per bucket index.

mod memory;
mod redis;

pub use self::memory::MemoryCounterStore;
pub use self::redis::{RedisCounterStore, RedisStoreConfig};

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// How bucket expiry is applied after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryMode {
    /// Per-field TTL, set only if the field has none. Bounds a client to
    /// `num_sub_windows + 1` live buckets.
    #[default]
    Field,
    /// Whole-key TTL refreshed on every increment, for stores without
    /// field-level expiry. Old buckets linger until the client goes idle.
    Key,
}

/// One admission check's worth of store commands, sent in a single round trip.
#[derive(Debug, Clone)]
pub struct CounterBatch {
    /// Namespaced store key.
    pub key: String,
    /// Bucket field to increment.
    pub field: String,
    pub increment: u64,
    /// Expiry applied to the field (or key, see [`ExpiryMode`]).
    pub ttl: Duration,
    pub expiry: ExpiryMode,
    /// Bucket fields to read after the increment, in order.
    pub reads: Vec<String>,
}

/// Port for the shared counter store.
///
/// Implementations must apply the increment atomically with respect to
/// other callers and must order it before the reads of the same batch.
#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Increment, set expiry, then read every field in `batch.reads`.
    ///
    /// Returns one entry per read field; missing fields are `None`.
    async fn record_and_read(&self, batch: &CounterBatch) -> Result<Vec<Option<u64>>, StoreError>;

    /// Read fields without modifying anything.
    async fn read(&self, key: &str, fields: &[String]) -> Result<Vec<Option<u64>>, StoreError>;
}

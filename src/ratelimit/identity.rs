//! Client identity and salted store-key hashing.
//!
//! A [`ClientKey`] is never written to the counter store or to logs. It is
//! digested together with the process [`Salt`] into a [`StoreKey`], a 64
//! character SHA-256 hex string.

use std::fmt;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{GateError, Result};

/// Default number of idle digests kept for reuse.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Application-supplied caller identity, e.g. `"203.0.113.7:/recipe"`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a per-route key from a `host:port` remote address.
    ///
    /// The port is stripped at the last `:` and the route appended, giving
    /// `"<host>:<route>"`. IPv6 hosts keep their brackets.
    pub fn from_remote_addr(remote_addr: &str, route: &str) -> Result<Self> {
        let idx = remote_addr.rfind(':').ok_or_else(|| {
            GateError::InvalidClientAddr("missing port separator".to_string())
        })?;
        let host = &remote_addr[..idx];
        if host.is_empty() {
            return Err(GateError::InvalidClientAddr("empty host".to_string()));
        }
        Ok(Self(format!("{}:{}", host, route)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientKey(<redacted>)")
    }
}

/// Process-wide secret mixed into every digest.
#[derive(Clone, Default)]
pub struct Salt(String);

impl Salt {
    pub fn new(salt: impl Into<String>) -> Self {
        Self(salt.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Salt(<empty>)")
        } else {
            f.write_str("Salt(<redacted>)")
        }
    }
}

/// Hex-encoded digest of a client key, safe to persist and to log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix the key so it cannot collide with unrelated data in a shared store.
    pub fn namespaced(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Salted SHA-256 hasher with a bounded pool of reusable digest states.
#[derive(Debug)]
pub struct IdentityHasher {
    salt: Salt,
    pool: DigestPool,
}

impl IdentityHasher {
    pub fn new(salt: Salt) -> Self {
        Self::with_pool_capacity(salt, DEFAULT_POOL_CAPACITY)
    }

    pub fn with_pool_capacity(salt: Salt, capacity: usize) -> Self {
        if salt.is_empty() {
            warn!("Identity salt is empty; store keys are plain client key hashes");
        }
        Self {
            salt,
            pool: DigestPool::new(capacity),
        }
    }

    /// Digest `client_key ‖ salt` into a store key.
    pub fn digest(&self, client_key: &str) -> StoreKey {
        let mut digest = self.pool.acquire();
        digest.update(client_key.as_bytes());
        digest.update(self.salt.as_bytes());
        StoreKey(hex::encode(digest.finalize_reset()))
    }

    /// Number of idle digests currently held by the pool.
    pub fn idle_digests(&self) -> usize {
        self.pool.idle.lock().len()
    }
}

#[derive(Debug)]
struct DigestPool {
    idle: Mutex<Vec<Sha256>>,
    capacity: usize,
}

impl DigestPool {
    fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    fn acquire(&self) -> PooledDigest<'_> {
        let mut digest = self.idle.lock().pop().unwrap_or_default();
        Digest::reset(&mut digest);
        PooledDigest {
            pool: self,
            digest: Some(digest),
        }
    }

    fn release(&self, digest: Sha256) {
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(digest);
        }
    }
}

/// Exclusive loan of a pooled digest; returned to the pool on drop.
struct PooledDigest<'a> {
    pool: &'a DigestPool,
    digest: Option<Sha256>,
}

impl PooledDigest<'_> {
    fn update(&mut self, data: &[u8]) {
        if let Some(digest) = self.digest.as_mut() {
            Digest::update(digest, data);
        }
    }

    fn finalize_reset(&mut self) -> Vec<u8> {
        self.digest
            .as_mut()
            .map(|digest| Digest::finalize_reset(digest).to_vec())
            .unwrap_or_default()
    }
}

impl Drop for PooledDigest<'_> {
    fn drop(&mut self) {
        if let Some(mut digest) = self.digest.take() {
            Digest::reset(&mut digest);
            self.pool.release(digest);
        }
    }
}
